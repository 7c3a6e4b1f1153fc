//! Per-visitor invoice ledger.
//!
//! One SQLite file per session. The session exclusively owns its rows until
//! the reconciler copies them into the site ledger; after that the rows stay
//! behind as a stale read cache until the file is purged.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, named_params};
use tollgate_core::invoice::Invoice;

use crate::error::Result;

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (creating if needed) the ledger at `path`, stamping the check-in
    /// row on first creation.
    pub fn open(path: &Path, now_ms: i64) -> Result<Self> {
        let conn = super::open_connection(path, true)?;
        conn.execute_batch(&format!(
            "create table if not exists checkin (date int not null);
             {}",
            super::INVOICE_SCHEMA
        ))?;
        conn.execute(
            "insert or ignore into checkin (rowid, date) values (1, ?1)",
            [now_ms],
        )?;
        Ok(SessionStore {
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing ledger without creating one.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let conn = super::open_connection(path, false)?;
        Ok(SessionStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn set_check_in(&self, now_ms: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("update checkin set date = ?1 where rowid = 1", [now_ms])?;
        Ok(())
    }

    pub fn check_in(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let date = conn.query_row("select date from checkin where rowid = 1", [], |row| {
            row.get(0)
        })?;
        Ok(date)
    }

    pub fn invoice_by_ref(&self, reference: &str) -> Result<Option<Invoice>> {
        let conn = self.conn.lock().unwrap();
        invoice_by_ref(&conn, reference)
    }

    /// True iff some invoice for `url_path` was paid at or after `cutoff_ms`.
    pub fn access_check(&self, url_path: &str, cutoff_ms: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let hit = conn
            .query_row(
                "select 1 from invoices where urlPath = ?1 and paidAt >= ?2 limit 1",
                rusqlite::params![url_path, cutoff_ms],
                |_| Ok(()),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// Hand back the open invoice for `url_path` created at or after
    /// `reuse_cutoff_ms`, or mint and insert the one produced by `mint`.
    /// Both steps run inside a single transaction, so two concurrent
    /// requests for the same path cannot each mint fresh outputs.
    pub fn issue_or_reuse(
        &self,
        url_path: &str,
        reuse_cutoff_ms: i64,
        mint: impl FnOnce() -> Result<Invoice>,
    ) -> Result<Invoice> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        if let Some(existing) = recent_unpaid_by_path(&tx, url_path, reuse_cutoff_ms)? {
            tx.commit()?;
            return Ok(existing);
        }

        let invoice = mint()?;
        insert_invoice(&tx, &invoice)?;
        tx.commit()?;
        Ok(invoice)
    }

    /// Record payment. Set-once: returns false when the invoice is unknown
    /// or `paid_at` was already set, and changes nothing in that case.
    pub fn mark_paid(
        &self,
        reference: &str,
        paid_at_ms: i64,
        payment_method: &str,
        txid: Option<&str>,
        tx_raw: Option<&[u8]>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "update invoices
             set paidAt = :paidAt, paymentMethod = :paymentMethod, txid = :txid, txraw = :txraw
             where ref = :ref and paidAt is null",
            named_params! {
                ":ref": reference,
                ":paidAt": paid_at_ms,
                ":paymentMethod": payment_method,
                ":txid": txid,
                ":txraw": tx_raw,
            },
        )?;
        Ok(changed == 1)
    }

    /// Invoices the reconciler still has to copy: not yet copied, and either
    /// paid or created before `expiry_cutoff_ms`.
    pub fn uncopied(&self, expiry_cutoff_ms: i64, limit: usize) -> Result<Vec<Invoice>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "select {} from invoices
             where copied = 0 and (paidAt is not null or created < ?1)
             order by ref limit ?2",
            super::INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            rusqlite::params![expiry_cutoff_ms, limit as i64],
            super::invoice_from_row,
        )?;
        let mut invoices = Vec::new();
        for row in rows {
            invoices.push(row?);
        }
        Ok(invoices)
    }

    pub fn mark_copied(&self, references: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for reference in references {
            changed += tx.execute(
                "update invoices set copied = 1 where ref = ?1",
                [reference],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }
}

fn invoice_by_ref(conn: &Connection, reference: &str) -> Result<Option<Invoice>> {
    let invoice = conn
        .query_row(
            &format!(
                "select {} from invoices where ref = ?1",
                super::INVOICE_COLUMNS
            ),
            [reference],
            super::invoice_from_row,
        )
        .optional()?;
    Ok(invoice)
}

fn recent_unpaid_by_path(
    conn: &Connection,
    url_path: &str,
    cutoff_ms: i64,
) -> Result<Option<Invoice>> {
    let invoice = conn
        .query_row(
            &format!(
                "select {} from invoices
                 where urlPath = ?1 and paidAt is null and created >= ?2
                 order by created desc limit 1",
                super::INVOICE_COLUMNS
            ),
            rusqlite::params![url_path, cutoff_ms],
            super::invoice_from_row,
        )
        .optional()?;
    Ok(invoice)
}

fn insert_invoice(conn: &Connection, invoice: &Invoice) -> Result<()> {
    let spec = serde_json::to_string(&invoice.spec)?;
    conn.execute(
        "insert into invoices
         (ref, created, domain, urlPath, spec, subtotal, paymentMethod, paidAt, txid, txraw, copied)
         values (:ref, :created, :domain, :urlPath, :spec, :subtotal,
                 :paymentMethod, :paidAt, :txid, :txraw, :copied)",
        named_params! {
            ":ref": invoice.reference,
            ":created": invoice.created,
            ":domain": invoice.domain,
            ":urlPath": invoice.url_path,
            ":spec": spec,
            ":subtotal": invoice.subtotal as i64,
            ":paymentMethod": invoice.payment_method,
            ":paidAt": invoice.paid_at,
            ":txid": invoice.txid,
            ":txraw": invoice.tx_raw,
            ":copied": invoice.copied,
        },
    )?;
    Ok(())
}
