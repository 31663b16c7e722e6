//! Connection wrapper
//!
//! `Db` owns one SQLite connection plus the bookkeeping the layers above
//! share: the nesting depth of open [`TransactionNester`] scopes, a counter
//! for unique savepoint names, and a rollback epoch that caches compare to
//! notice their eager writes were undone.
//!
//! A `Db` is `Send` but not `Sync`: one thread at a time per connection.
//!
//! [`TransactionNester`]: crate::storage::txn::TransactionNester

use std::cell::Cell;
use std::path::Path;
use std::time::Duration;

use rusqlite::blob::Blob;
use rusqlite::{Connection, DatabaseName, OptionalExtension};
use tracing::debug;

use crate::storage::error::StoreResult;
use crate::storage::schema::{init_schema, needs_init};

/// How long a writer waits on another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of everything that can silently change cached rows
///
/// `data_version` moves when another connection commits; `rollback_epoch`
/// moves when this connection rolls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherencyToken {
    pub data_version: i64,
    pub rollback_epoch: u64,
}

/// A single SQLite connection with transaction bookkeeping
#[derive(Debug)]
pub struct Db {
    conn: Connection,
    depth: Cell<u32>,
    savepoint_seq: Cell<u64>,
    rollback_epoch: Cell<u64>,
}

impl Db {
    /// Open or create a database file
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        Ok(Self {
            conn,
            depth: Cell::new(0),
            savepoint_seq: Cell::new(0),
            rollback_epoch: Cell::new(0),
        })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close the connection, reporting any error SQLite returns
    pub fn close(self) -> StoreResult<()> {
        self.conn.close().map_err(|(_, e)| e.into())
    }

    /// Whether SQLite reports an open transaction
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Number of open transaction scopes on this connection
    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub(crate) fn enter_scope(&self) -> u32 {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        depth
    }

    pub(crate) fn exit_scope(&self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }

    pub(crate) fn next_savepoint_name(&self) -> String {
        let seq = self.savepoint_seq.get() + 1;
        self.savepoint_seq.set(seq);
        format!("arbor_sp_{}", seq)
    }

    pub(crate) fn note_rollback(&self) {
        self.rollback_epoch.set(self.rollback_epoch.get() + 1);
    }

    pub fn rollback_epoch(&self) -> u64 {
        self.rollback_epoch.get()
    }

    /// SQLite's write counter for commits made by other connections
    pub fn data_version(&self) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("PRAGMA data_version", [], |row| row.get(0))?)
    }

    pub fn coherency_token(&self) -> StoreResult<CoherencyToken> {
        Ok(CoherencyToken {
            data_version: self.data_version()?,
            rollback_epoch: self.rollback_epoch(),
        })
    }

    /// Open a read-only incremental blob on `table.column` at `rowid`
    ///
    /// Returns `None` when the row is gone or the column holds no blob
    /// (NULL or another type). Any other failure is a genuine error.
    /// `table` and `column` are internal identifiers, never user input.
    pub fn open_blob(&self, table: &str, column: &str, rowid: i64) -> StoreResult<Option<Blob<'_>>> {
        let err = match self
            .conn
            .blob_open(DatabaseName::Main, table, column, rowid, true)
        {
            Ok(blob) => return Ok(Some(blob)),
            Err(err) => err,
        };

        let kind: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT typeof({}) FROM {} WHERE rowid = ?", column, table),
                [rowid],
                |row| row.get(0),
            )
            .optional()?;

        match kind.as_deref() {
            None => {
                debug!(table, rowid, "Blob row vanished before open");
                Ok(None)
            }
            Some("blob") | Some("text") => Err(err.into()),
            Some(other) => {
                debug!(table, column, rowid, kind = other, "Column holds no blob");
                Ok(None)
            }
        }
    }
}
