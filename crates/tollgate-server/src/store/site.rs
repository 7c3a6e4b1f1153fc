//! The site's authoritative store: reconciled invoices, config, file index.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, named_params};
use tollgate_core::invoice::Invoice;

use crate::error::Result;

/// One published file, as recorded by the publishing CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub url_path: String,
    pub hash: String,
    pub size: u64,
    pub storage_path: String,
    pub mime_type: String,
}

pub struct SiteStore {
    conn: Mutex<Connection>,
}

impl SiteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = super::open_connection(path, true)?;
        conn.execute_batch(&format!(
            "{}
             create table if not exists config (
                 name text primary key,
                 value text not null
             );
             create table if not exists files (
                 urlPath text primary key,
                 hash text not null,
                 size int not null,
                 storagePath text not null,
                 mimeType text not null
             );",
            super::INVOICE_SCHEMA
        ))?;
        Ok(SiteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Idempotent insert keyed by reference; returns whether a row landed.
    pub fn insert_invoice(&self, invoice: &Invoice) -> Result<bool> {
        let spec = serde_json::to_string(&invoice.spec)?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "insert into invoices
             (ref, created, domain, urlPath, spec, subtotal,
              paymentMethod, paidAt, txid, txraw, copied)
             values (:ref, :created, :domain, :urlPath, :spec, :subtotal,
                     :paymentMethod, :paidAt, :txid, :txraw, 1)
             on conflict (ref) do nothing",
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
            },
        )?;
        Ok(changed == 1)
    }

    pub fn invoice_by_ref(&self, reference: &str) -> Result<Option<Invoice>> {
        let conn = self.conn.lock().unwrap();
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

    /// All reconciled invoices in reference (creation) order.
    pub fn list_invoices(&self) -> Result<Vec<Invoice>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "select {} from invoices order by ref",
            super::INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map([], super::invoice_from_row)?;
        let mut invoices = Vec::new();
        for row in rows {
            invoices.push(row?);
        }
        Ok(invoices)
    }

    pub fn config_set(&self, entries: &[(&str, &str)]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for (name, value) in entries {
            changed += tx.execute(
                "insert into config (name, value) values (?1, ?2)
                 on conflict (name) do update set value = ?2",
                [name, value],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn config_get(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("select value from config where name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Fetch several keys at once; absent names are simply missing from the
    /// result.
    pub fn config_get_many(&self, names: &[&str]) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut found = HashMap::new();
        for name in names {
            let value: Option<String> = conn
                .query_row("select value from config where name = ?1", [name], |row| {
                    row.get(0)
                })
                .optional()?;
            if let Some(value) = value {
                found.insert(name.to_string(), value);
            }
        }
        Ok(found)
    }

    pub fn config_all(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("select name, value from config")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut all = HashMap::new();
        for row in rows {
            let (name, value): (String, String) = row?;
            all.insert(name, value);
        }
        Ok(all)
    }

    pub fn config_remove(&self, names: &[&str]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut changed = 0;
        for name in names {
            changed += tx.execute("delete from config where name = ?1", [name])?;
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn file_row(&self, url_path: &str) -> Result<Option<FileRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "select urlPath, hash, size, storagePath, mimeType
                 from files where urlPath = ?1",
                [url_path],
                |row| {
                    Ok(FileRow {
                        url_path: row.get(0)?,
                        hash: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        storage_path: row.get(3)?,
                        mime_type: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert_file(&self, row: &FileRow) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into files (urlPath, hash, size, storagePath, mimeType)
             values (:urlPath, :hash, :size, :storagePath, :mimeType)
             on conflict (urlPath) do update set
                 hash = :hash, size = :size, storagePath = :storagePath, mimeType = :mimeType",
            named_params! {
                ":urlPath": row.url_path,
                ":hash": row.hash,
                ":size": row.size as i64,
                ":storagePath": row.storage_path,
                ":mimeType": row.mime_type,
            },
        )?;
        Ok(())
    }
}
