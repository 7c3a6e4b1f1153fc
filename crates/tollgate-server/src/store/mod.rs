//! Relational stores backing the site.
//!
//! Every store owns a single connection behind a mutex; background tasks
//! that must not depend on in-process state open fresh stores instead of
//! sharing handles. Cross-process coordination is left to SQLite (WAL plus
//! a busy timeout).

use std::path::Path;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row};
use tollgate_core::invoice::{Invoice, InvoiceSpec};

use crate::error::Result;

pub mod counters;
pub mod session;
pub mod site;

pub use counters::CounterStore;
pub use session::SessionStore;
pub use site::{FileRow, SiteStore};

fn open_connection(path: &Path, create: bool) -> Result<Connection> {
    let conn = if create {
        Connection::open(path)?
    } else {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?
    };

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

const INVOICE_SCHEMA: &str = "
    create table if not exists invoices (
        ref text primary key,
        created int not null,
        domain text not null,
        urlPath text not null,
        spec text not null,
        subtotal int not null,
        paymentMethod text,
        paidAt int,
        txid text,
        txraw blob,
        copied int not null default 0
    );
    create index if not exists invoices_paidAt on invoices(paidAt);
    create index if not exists invoices_urlPath on invoices(urlPath);
";

const INVOICE_COLUMNS: &str =
    "ref, created, domain, urlPath, spec, subtotal, paymentMethod, paidAt, txid, txraw, copied";

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    let spec_text: String = row.get(4)?;
    let spec: InvoiceSpec = serde_json::from_str(&spec_text)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(err)))?;

    Ok(Invoice {
        reference: row.get(0)?,
        created: row.get(1)?,
        domain: row.get(2)?,
        url_path: row.get(3)?,
        spec,
        subtotal: row.get::<_, i64>(5)? as u64,
        payment_method: row.get(6)?,
        paid_at: row.get(7)?,
        txid: row.get(8)?,
        tx_raw: row.get(9)?,
        copied: row.get(10)?,
    })
}
