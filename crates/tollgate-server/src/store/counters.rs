//! Per-worker derivation counters.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

/// Monotonic counters keyed by master-key string.
///
/// The increment is a single transactional statement on the store's one
/// connection, so concurrent callers against the same store always observe
/// distinct values. Workers never share a counters file; uniqueness across
/// workers comes from partitioning the derivation path by worker id.
pub struct CounterStore {
    conn: Mutex<Connection>,
}

impl CounterStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = super::open_connection(path, true)?;
        conn.execute_batch(
            "create table if not exists counters (
                name text primary key,
                counter int not null
            ) without rowid;",
        )?;
        Ok(CounterStore {
            conn: Mutex::new(conn),
        })
    }

    /// Increment and return the counter for `name`. The first call for a new
    /// name yields 0.
    pub fn next_value(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let counter = conn.query_row(
            "insert into counters (name, counter) values (?1, 0)
             on conflict (name) do update set counter = counter + 1
             returning counter",
            [name],
            |row| row.get(0),
        )?;
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counts_up_from_zero_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = CounterStore::open(&dir.path().join("counters-0.db")).unwrap();

        assert_eq!(store.next_value("xpub-a").unwrap(), 0);
        assert_eq!(store.next_value("xpub-a").unwrap(), 1);
        assert_eq!(store.next_value("xpub-a").unwrap(), 2);
        // Keys are independent sequences.
        assert_eq!(store.next_value("xpub-b").unwrap(), 0);
        assert_eq!(store.next_value("xpub-a").unwrap(), 3);
    }

    #[test]
    fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters-0.db");
        {
            let store = CounterStore::open(&path).unwrap();
            assert_eq!(store.next_value("xpub").unwrap(), 0);
            assert_eq!(store.next_value("xpub").unwrap(), 1);
        }
        let store = CounterStore::open(&path).unwrap();
        assert_eq!(store.next_value("xpub").unwrap(), 2);
    }

    #[test]
    fn concurrent_callers_never_share_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CounterStore::open(&dir.path().join("counters-0.db")).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..25 {
                    seen.push(store.next_value("xpub").unwrap());
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let seen = handle.join().unwrap();
            // Each caller's own sequence is strictly increasing.
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }

        // Globally: 200 distinct values, a gap-free 0..200.
        all.sort_unstable();
        let expected: Vec<i64> = (0..200).collect();
        assert_eq!(all, expected);
    }
}
