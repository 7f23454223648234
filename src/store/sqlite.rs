use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle, Transaction};

use super::schema::SCHEMA;
use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Opens a private in-memory database. Background jobs share its single
    /// connection instead of opening their own.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a guard to the shared request connection.
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn()
    }

    /// Runs `f` inside a transaction on the shared connection. The
    /// transaction commits if `f` succeeds and rolls back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn();
        run_in_transaction(&mut conn, f)
    }

    /// Opens a dedicated connection for long-running background work, or
    /// `None` for in-memory stores.
    pub fn open_dedicated(&self) -> Result<Option<Connection>> {
        match &self.path {
            Some(path) => Ok(Some(open(path)?)),
            None => Ok(None),
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.conn().get_interrupt_handle()
    }
}

fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

pub fn run_in_transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}
