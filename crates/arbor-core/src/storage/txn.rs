//! Nested write transactions
//!
//! A [`TransactionNester`] opened on an idle connection issues `BEGIN IMMEDIATE`; one
//! opened inside another scope issues a uniquely named `SAVEPOINT`. Either
//! way the scope ends exactly once: by [`commit`](TransactionNester::commit)
//! or, if that never happens, by a rollback when the value is dropped. A
//! nested scope rolling back only undoes its own writes.

use tracing::{debug, warn};

use crate::storage::db::Db;
use crate::storage::error::{StoreError, StoreResult};

#[derive(Debug)]
enum Scope {
    Outermost,
    Savepoint(String),
}

/// A transaction scope that nests through savepoints
#[derive(Debug)]
pub struct TransactionNester<'db> {
    db: &'db Db,
    scope: Scope,
    released: bool,
}

impl<'db> TransactionNester<'db> {
    /// Begin a scope on `db`
    pub fn begin(db: &'db Db) -> StoreResult<Self> {
        let scope = if db.depth() == 0 && !db.in_transaction() {
            db.connection().execute_batch("BEGIN IMMEDIATE")?;
            Scope::Outermost
        } else {
            let name = db.next_savepoint_name();
            db.connection()
                .execute_batch(&format!("SAVEPOINT {}", name))?;
            Scope::Savepoint(name)
        };
        db.enter_scope();
        Ok(Self {
            db,
            scope,
            released: false,
        })
    }

    /// Whether this scope owns the outermost transaction
    pub fn is_outermost(&self) -> bool {
        matches!(self.scope, Scope::Outermost)
    }

    pub fn db(&self) -> &'db Db {
        self.db
    }

    /// Commit (outermost) or release (nested) the scope
    ///
    /// Calling this twice is a programming error and returns
    /// [`StoreError::AlreadyReleased`].
    pub fn commit(&mut self) -> StoreResult<()> {
        if self.released {
            return Err(StoreError::AlreadyReleased);
        }
        let sql = match &self.scope {
            Scope::Outermost => "COMMIT".to_string(),
            Scope::Savepoint(name) => format!("RELEASE {}", name),
        };
        self.db.connection().execute_batch(&sql)?;
        self.released = true;
        self.db.exit_scope();
        Ok(())
    }

    /// Roll the scope back now, reporting any failure
    fn rollback(&mut self) -> StoreResult<()> {
        self.released = true;
        self.db.exit_scope();

        // SQLite may already have rolled the whole transaction back on its own
        // (e.g. after SQLITE_FULL); issuing ROLLBACK again would fail.
        if !self.db.in_transaction() {
            debug!("Transaction already rolled back by SQLite");
            self.db.note_rollback();
            return Ok(());
        }

        let sql = match &self.scope {
            Scope::Outermost => "ROLLBACK".to_string(),
            Scope::Savepoint(name) => format!("ROLLBACK TO {0}; RELEASE {0}", name),
        };
        let result = self.db.connection().execute_batch(&sql);
        self.db.note_rollback();
        result.map_err(Into::into)
    }
}

impl Drop for TransactionNester<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.rollback() {
            warn!("Rollback of {:?} failed: {}", self.scope, e);
        }
    }
}

/// Run `f` inside a nested scope, committing on `Ok`
///
/// On `Err` the scope is rolled back explicitly; if that rollback fails too,
/// both errors come back as one [`StoreError::Aggregate`].
pub fn with_transaction<T, F>(db: &Db, f: F) -> StoreResult<T>
where
    F: FnOnce(&Db) -> StoreResult<T>,
{
    let mut tx = TransactionNester::begin(db)?;
    match f(db) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => match tx.rollback() {
            Ok(()) => Err(e),
            Err(rollback_err) => {
                warn!("Rollback after failed transaction body failed: {}", rollback_err);
                Err(StoreError::Aggregate(vec![e, rollback_err]))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(db: &Db) -> Vec<String> {
        db.connection()
            .prepare("SELECT name FROM NameId ORDER BY rowid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    fn insert(db: &Db, name: &str) {
        db.connection()
            .execute("INSERT INTO NameId (name) VALUES (?)", [name])
            .unwrap();
    }

    #[test]
    fn test_outermost_commit() {
        let db = Db::open_in_memory().unwrap();
        let mut tx = TransactionNester::begin(&db).unwrap();
        assert!(tx.is_outermost());
        assert!(db.in_transaction());
        insert(&db, "a");
        tx.commit().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(db.depth(), 0);
        assert_eq!(names(&db), vec!["a"]);
    }

    #[test]
    fn test_double_commit_is_error() {
        let db = Db::open_in_memory().unwrap();
        let mut tx = TransactionNester::begin(&db).unwrap();
        tx.commit().unwrap();
        assert!(matches!(tx.commit(), Err(StoreError::AlreadyReleased)));
    }

    #[test]
    fn test_drop_rolls_back_outermost() {
        let db = Db::open_in_memory().unwrap();
        let epoch = db.rollback_epoch();
        {
            let _tx = TransactionNester::begin(&db).unwrap();
            insert(&db, "a");
        }
        assert!(!db.in_transaction());
        assert!(names(&db).is_empty());
        assert_eq!(db.rollback_epoch(), epoch + 1);
    }

    #[test]
    fn test_nested_lifo_commit() {
        let db = Db::open_in_memory().unwrap();
        let mut outer = TransactionNester::begin(&db).unwrap();
        insert(&db, "outer");
        {
            let mut middle = TransactionNester::begin(&db).unwrap();
            assert!(!middle.is_outermost());
            insert(&db, "middle");
            {
                let mut inner = TransactionNester::begin(&db).unwrap();
                insert(&db, "inner");
                assert_eq!(db.depth(), 3);
                inner.commit().unwrap();
            }
            middle.commit().unwrap();
        }
        outer.commit().unwrap();

        assert!(!db.in_transaction());
        assert_eq!(names(&db), vec!["outer", "middle", "inner"]);
    }

    #[test]
    fn test_inner_drop_rolls_back_only_inner() {
        let db = Db::open_in_memory().unwrap();
        let mut outer = TransactionNester::begin(&db).unwrap();
        insert(&db, "kept");
        {
            let _inner = TransactionNester::begin(&db).unwrap();
            insert(&db, "discarded");
        }
        assert!(db.in_transaction());
        insert(&db, "after");
        outer.commit().unwrap();

        assert_eq!(names(&db), vec!["kept", "after"]);
    }

    #[test]
    fn test_outer_rollback_discards_committed_inner() {
        let db = Db::open_in_memory().unwrap();
        {
            let _outer = TransactionNester::begin(&db).unwrap();
            let mut inner = TransactionNester::begin(&db).unwrap();
            insert(&db, "inner");
            inner.commit().unwrap();
        }
        assert!(names(&db).is_empty());
    }

    #[test]
    fn test_drop_after_external_rollback_is_quiet() {
        let db = Db::open_in_memory().unwrap();
        {
            let _tx = TransactionNester::begin(&db).unwrap();
            insert(&db, "a");
            db.connection().execute_batch("ROLLBACK").unwrap();
        }
        assert_eq!(db.depth(), 0);
        assert!(names(&db).is_empty());
    }

    #[test]
    fn test_with_transaction() {
        let db = Db::open_in_memory().unwrap();
        let id = with_transaction(&db, |db| {
            insert(db, "x");
            Ok(db.connection().last_insert_rowid())
        })
        .unwrap();
        assert_eq!(id, 1);

        let failed: StoreResult<()> = with_transaction(&db, |db| {
            insert(db, "y");
            Err(StoreError::Cancelled)
        });
        assert!(matches!(failed, Err(StoreError::Cancelled)));
        assert_eq!(names(&db), vec!["x"]);
    }

    #[test]
    fn test_with_transaction_reports_failed_rollback() {
        let db = Db::open_in_memory().unwrap();
        let mut outer = TransactionNester::begin(&db).unwrap();
        let epoch = db.rollback_epoch();

        let failed: StoreResult<()> = with_transaction(&db, |db| {
            // release the scope's own savepoint so rolling back to it fails
            db.connection().execute_batch("RELEASE arbor_sp_1").unwrap();
            Err(StoreError::Cancelled)
        });

        match failed {
            Err(StoreError::Aggregate(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[0], StoreError::Cancelled));
                assert!(matches!(errors[1], StoreError::Database(_)));
            }
            other => panic!("expected aggregate error, got {:?}", other),
        }
        assert_eq!(db.depth(), 1);
        assert_eq!(db.rollback_epoch(), epoch + 1);
        outer.commit().unwrap();
        assert!(!db.in_transaction());
    }
}
