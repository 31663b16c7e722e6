//! Name interning over the `NameId` table
//!
//! Names map to positive integer ids through two LRU caches (name → id and
//! id → name) that share one `Arc<str>` per name. Other connections can
//! change the table behind our back, so tracked lookups first compare the
//! connection's [`CoherencyToken`] with the one seen last and drop both
//! caches when it moved. The `*_stale` lookups skip that check for callers
//! that already hold a consistent view, such as code running inside one
//! transaction.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use tracing::debug;

use crate::cache::{IdentifierCache, StrSizer};
use crate::storage::db::{CoherencyToken, Db};
use crate::storage::error::{is_unique_violation, StoreResult};
use crate::storage::txn::TransactionNester;

/// Interned-name lookup and allocation for one connection
#[derive(Debug)]
pub struct NameRegistry {
    by_name: IdentifierCache<Arc<str>, i64, StrSizer>,
    by_id: IdentifierCache<i64, Arc<str>, StrSizer>,
    token: Option<CoherencyToken>,
    next_id: Option<i64>,
}

impl NameRegistry {
    /// Registry whose caches each hold up to `cache_size` size units
    pub fn new(cache_size: usize) -> Self {
        Self {
            by_name: IdentifierCache::with_sizer(cache_size, StrSizer),
            by_id: IdentifierCache::with_sizer(cache_size, StrSizer),
            token: None,
            next_id: None,
        }
    }

    /// Drop all cached state
    pub fn invalidate(&mut self) {
        self.by_name.clear();
        self.by_id.clear();
        self.next_id = None;
    }

    /// Number of names currently cached
    pub fn cached_len(&self) -> usize {
        self.by_name.len()
    }

    fn sync_with(&mut self, db: &Db) -> StoreResult<()> {
        let token = db.coherency_token()?;
        if self.token != Some(token) {
            if self.token.is_some() {
                debug!(?token, "Store changed underneath name caches, invalidating");
            }
            self.invalidate();
            self.token = Some(token);
        }
        Ok(())
    }

    /// The canonical shared instance of `name`, if cached
    pub fn normalize(&self, name: &str) -> Option<Arc<str>> {
        self.by_name.normalize(name).cloned()
    }

    fn remember(&mut self, name: &str, id: i64) -> Arc<str> {
        let canonical = self
            .by_name
            .normalize(name)
            .cloned()
            .or_else(|| self.by_id.peek(&id).filter(|n| &***n == name).cloned())
            .unwrap_or_else(|| Arc::from(name));
        self.by_name.put(canonical.clone(), id);
        self.by_id.put(id, canonical.clone());
        canonical
    }

    /// Id of `name`, checking store coherency first
    pub fn id_of(&mut self, db: &Db, name: &str) -> StoreResult<Option<i64>> {
        self.sync_with(db)?;
        self.id_of_stale(db, name)
    }

    /// Id of `name`, trusting the caches as they are
    pub fn id_of_stale(&mut self, db: &Db, name: &str) -> StoreResult<Option<i64>> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(Some(id));
        }
        let found = lookup_id(db, name)?;
        if let Some(id) = found {
            self.remember(name, id);
        }
        Ok(found)
    }

    /// Name for `id`, checking store coherency first
    pub fn name_of(&mut self, db: &Db, id: i64) -> StoreResult<Option<Arc<str>>> {
        self.sync_with(db)?;
        self.name_of_stale(db, id)
    }

    /// Name for `id`, trusting the caches as they are
    pub fn name_of_stale(&mut self, db: &Db, id: i64) -> StoreResult<Option<Arc<str>>> {
        if let Some(name) = self.by_id.get(&id) {
            return Ok(Some(name.clone()));
        }
        let found: Option<String> = db
            .connection()
            .query_row("SELECT name FROM NameId WHERE rowid = ?", [id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.map(|name| self.remember(&name, id)))
    }

    /// Id of `name`, allocating one if the name is new
    pub fn ensure_id(&mut self, db: &Db, name: &str) -> StoreResult<i64> {
        self.sync_with(db)?;
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }

        let mut tx = TransactionNester::begin(db)?;
        if let Some(id) = lookup_id(db, name)? {
            tx.commit()?;
            self.remember(name, id);
            return Ok(id);
        }

        loop {
            let id = self.take_next_id(db)?;
            match db.connection().execute(
                "INSERT INTO NameId (rowid, name) VALUES (?, ?)",
                rusqlite::params![id, name],
            ) {
                Ok(_) => {
                    tx.commit()?;
                    debug!(name, id, "Allocated name id");
                    self.remember(name, id);
                    return Ok(id);
                }
                Err(e) if is_unique_violation(&e) => {
                    // Someone else wrote the name or took the id; reseed and look again.
                    self.next_id = None;
                    if let Some(existing) = lookup_id(db, name)? {
                        debug!(name, id = existing, "Name inserted concurrently");
                        tx.commit()?;
                        self.remember(name, existing);
                        return Ok(existing);
                    }
                }
                Err(e) => {
                    self.next_id = Some(id);
                    return Err(e.into());
                }
            }
        }
    }

    fn take_next_id(&mut self, db: &Db) -> StoreResult<i64> {
        let id = match self.next_id {
            Some(id) => id,
            None => db.connection().query_row(
                "SELECT COALESCE(MAX(rowid), 0) + 1 FROM NameId",
                [],
                |row| row.get(0),
            )?,
        };
        self.next_id = Some(id + 1);
        Ok(id)
    }
}

fn lookup_id(db: &Db, name: &str) -> StoreResult<Option<i64>> {
    Ok(db
        .connection()
        .query_row("SELECT rowid FROM NameId WHERE name = ?", [name], |row| {
            row.get(0)
        })
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_id_allocates_once() {
        let db = Db::open_in_memory().unwrap();
        let mut names = NameRegistry::new(1024);

        let title = names.ensure_id(&db, "title").unwrap();
        let body = names.ensure_id(&db, "body").unwrap();
        assert!(title > 0);
        assert_ne!(title, body);
        assert_eq!(names.ensure_id(&db, "title").unwrap(), title);
        assert_eq!(names.id_of(&db, "body").unwrap(), Some(body));
        assert_eq!(names.name_of(&db, title).unwrap().as_deref(), Some("title"));
        assert_eq!(names.id_of(&db, "missing").unwrap(), None);
    }

    #[test]
    fn test_lookups_share_canonical_instance() {
        let db = Db::open_in_memory().unwrap();
        let mut names = NameRegistry::new(1024);
        let id = names.ensure_id(&db, "title").unwrap();

        let from_id = names.name_of(&db, id).unwrap().unwrap();
        let normalized = names.normalize("title").unwrap();
        assert!(Arc::ptr_eq(&from_id, &normalized));
    }

    #[test]
    fn test_uncached_ids_load_from_table() {
        let db = Db::open_in_memory().unwrap();
        db.connection()
            .execute("INSERT INTO NameId (rowid, name) VALUES (40, 'seeded')", [])
            .unwrap();

        let mut names = NameRegistry::new(1024);
        assert_eq!(names.id_of(&db, "seeded").unwrap(), Some(40));
        // counter continues past the highest existing id
        assert_eq!(names.ensure_id(&db, "fresh").unwrap(), 41);
    }

    #[test]
    fn test_id_collision_reseeds_counter() {
        let db = Db::open_in_memory().unwrap();
        let mut names = NameRegistry::new(1024);
        assert_eq!(names.ensure_id(&db, "a").unwrap(), 1);

        // a row appears that the counter does not know about
        db.connection()
            .execute("INSERT INTO NameId (rowid, name) VALUES (2, 'sneaky')", [])
            .unwrap();

        assert_eq!(names.ensure_id(&db, "b").unwrap(), 3);
    }

    #[test]
    fn test_concurrent_insert_detected_by_data_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("names.db");
        let a = Db::open(&path).unwrap();
        let b = Db::open(&path).unwrap();

        let mut names_a = NameRegistry::new(1024);
        let mut names_b = NameRegistry::new(1024);

        let id = names_a.ensure_id(&a, "shared").unwrap();
        assert_eq!(names_b.ensure_id(&b, "shared").unwrap(), id);

        // b renames the row out from under a's cache
        b.connection()
            .execute("UPDATE NameId SET name = 'renamed' WHERE rowid = ?", [id])
            .unwrap();

        assert_eq!(names_a.id_of_stale(&a, "shared").unwrap(), Some(id));
        assert_eq!(names_a.id_of(&a, "shared").unwrap(), None);
        assert_eq!(names_a.id_of(&a, "renamed").unwrap(), Some(id));
    }

    #[test]
    fn test_rollback_invalidates_cache() {
        let db = Db::open_in_memory().unwrap();
        let mut names = NameRegistry::new(1024);
        {
            let _tx = TransactionNester::begin(&db).unwrap();
            names.ensure_id(&db, "doomed").unwrap();
            assert!(names.id_of_stale(&db, "doomed").unwrap().is_some());
        }
        assert_eq!(names.id_of(&db, "doomed").unwrap(), None);
        assert_eq!(names.ensure_id(&db, "doomed").unwrap(), 1);
    }

    #[test]
    fn test_small_cache_still_answers() {
        let db = Db::open_in_memory().unwrap();
        let mut names = NameRegistry::new(40);
        let ids: Vec<i64> = (0..20)
            .map(|i| names.ensure_id(&db, &format!("field_{}", i)).unwrap())
            .collect();
        assert!(names.cached_len() < 20);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(names.id_of(&db, &format!("field_{}", i)).unwrap(), Some(*id));
        }
    }
}
