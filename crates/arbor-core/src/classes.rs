//! Class rows
//!
//! A class lives in `Class` plus one `ClassToField` row per field definition
//! and one `ClassToInclude` row per included uid. Saving replaces the child
//! rows wholesale.

use rusqlite::{params, OptionalExtension};

use crate::codec::fields::{self, FieldValue};
use crate::models::{Checksum, Class, FieldDef, StoreType};
use crate::modstamp::Modstamp;
use crate::names::NameRegistry;
use crate::storage::db::Db;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::txn::TransactionNester;
use crate::uid::Uid;

/// Convert a checksum column into a fixed array
pub(crate) fn to_checksum(bytes: Vec<u8>) -> StoreResult<Checksum> {
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| StoreError::corrupt(format!("checksum has {} bytes, expected 32", len)))
}

/// Row id of the class with `uid`, tombstoned or not
pub fn class_rowid(db: &Db, uid: Uid) -> StoreResult<Option<i64>> {
    Ok(db
        .connection()
        .query_row("SELECT rowid FROM Class WHERE uid = ?", [uid], |row| row.get(0))
        .optional()?)
}

/// Row id of the item with `uid`, tombstoned or not
pub fn item_rowid(db: &Db, uid: Uid) -> StoreResult<Option<i64>> {
    Ok(db
        .connection()
        .query_row("SELECT rowid FROM Item WHERE uid = ?", [uid], |row| row.get(0))
        .optional()?)
}

/// Insert or update a class and its field and include rows
///
/// The stored checksum and modstamp are taken from `class` as given.
pub fn save_class(db: &Db, names: &mut NameRegistry, class: &Class) -> StoreResult<i64> {
    let mut tx = TransactionNester::begin(db)?;
    let conn = db.connection();

    let manager = match class.manager {
        Some(uid) => Some(
            item_rowid(db, uid)?
                .ok_or_else(|| StoreError::not_found(format!("manager item {}", uid)))?,
        ),
        None => None,
    };

    conn.execute(
        "INSERT INTO Class (uid, csum, modst, ord, manager, name, isDeleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(uid) DO UPDATE SET
            csum = excluded.csum,
            modst = excluded.modst,
            ord = excluded.ord,
            manager = excluded.manager,
            name = excluded.name,
            isDeleted = excluded.isDeleted",
        params![
            class.uid,
            &class.checksum[..],
            class.modstamp,
            class.ordinal,
            manager,
            class.name,
            class.is_deleted,
        ],
    )?;
    let rowid = class_rowid(db, class.uid)?
        .ok_or_else(|| StoreError::not_found(format!("class {}", class.uid)))?;

    conn.execute("DELETE FROM ClassToField WHERE cls = ?", [rowid])?;
    conn.execute("DELETE FROM ClassToInclude WHERE cls = ?", [rowid])?;

    for (ord, field) in class.fields.iter().enumerate() {
        let fld = names.ensure_id(db, &field.name)?;
        let val = match &field.shared_value {
            Some(value) if !value.is_null() => Some(fields::encode(std::slice::from_ref(value))),
            _ => None,
        };
        conn.execute(
            "INSERT INTO ClassToField (cls, fld, csum, ord, storeType, val)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rowid,
                fld,
                &field.checksum()[..],
                ord as i64,
                field.store_type.code(),
                val
            ],
        )?;
    }

    for (ord, incl) in class.includes.iter().enumerate() {
        conn.execute(
            "INSERT INTO ClassToInclude (cls, incl, ord) VALUES (?1, ?2, ?3)",
            params![rowid, incl, ord as i64],
        )?;
    }

    tx.commit()?;
    Ok(rowid)
}

/// Load a class by uid, including tombstoned ones
pub fn load_class(db: &Db, names: &mut NameRegistry, uid: Uid) -> StoreResult<Option<Class>> {
    let conn = db.connection();
    let row = conn
        .query_row(
            "SELECT rowid, csum, modst, ord, manager, name, isDeleted FROM Class WHERE uid = ?",
            [uid],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Modstamp>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((rowid, csum, modstamp, ordinal, manager, name, is_deleted)) = row else {
        return Ok(None);
    };

    let manager = match manager {
        Some(item) => Some(
            conn.query_row("SELECT uid FROM Item WHERE rowid = ?", [item], |row| {
                row.get::<_, Uid>(0)
            })
            .optional()?
            .ok_or_else(|| StoreError::corrupt(format!("class {} manager row {} missing", uid, item)))?,
        ),
        None => None,
    };

    let field_rows: Vec<(i64, u8, Option<Vec<u8>>)> = conn
        .prepare("SELECT fld, storeType, val FROM ClassToField WHERE cls = ? ORDER BY ord")?
        .query_map([rowid], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<_, _>>()?;

    let mut field_defs = Vec::with_capacity(field_rows.len());
    for (fld, code, val) in field_rows {
        let name = names
            .name_of(db, fld)?
            .ok_or_else(|| StoreError::corrupt(format!("field name id {} missing", fld)))?;
        let store_type = StoreType::from_code(code)
            .ok_or_else(|| StoreError::corrupt(format!("unknown store type {}", code)))?;
        let shared_value = match val {
            Some(bytes) => fields::decode_all(&bytes)?.into_iter().next(),
            None => None,
        }
        .filter(|v: &FieldValue| !v.is_null());
        field_defs.push(FieldDef {
            name: name.to_string(),
            store_type,
            shared_value,
        });
    }

    let includes: Vec<Uid> = conn
        .prepare("SELECT incl FROM ClassToInclude WHERE cls = ? ORDER BY ord")?
        .query_map([rowid], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    Ok(Some(Class {
        uid,
        name,
        ordinal,
        manager,
        fields: field_defs,
        includes,
        modstamp,
        checksum: to_checksum(csum)?,
        is_deleted,
    }))
}

/// Tombstone a live class; returns false if it was absent or already deleted
pub fn tombstone_class(db: &Db, uid: Uid, modstamp: Modstamp) -> StoreResult<bool> {
    let changed = db.connection().execute(
        "UPDATE Class SET isDeleted = 1, modst = ?1 WHERE uid = ?2 AND isDeleted = 0",
        params![modstamp, uid],
    )?;
    Ok(changed > 0)
}

/// Modstamp of a class row, tombstoned or not
pub fn class_modstamp(db: &Db, uid: Uid) -> StoreResult<Option<Modstamp>> {
    Ok(db
        .connection()
        .query_row("SELECT modst FROM Class WHERE uid = ?", [uid], |row| row.get(0))
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Db, NameRegistry) {
        (Db::open_in_memory().unwrap(), NameRegistry::new(4096))
    }

    #[test]
    fn test_save_and_load() {
        let (db, mut names) = setup();
        let mut class = Class::named("Task");
        class
            .add_field("title", StoreType::Hot)
            .add_field("notes", StoreType::Cold)
            .add_shared_field("kind", FieldValue::text("task"))
            .include(Uid::from_u128(99));
        class.modstamp = 17;

        save_class(&db, &mut names, &class).unwrap();
        let loaded = load_class(&db, &mut names, class.uid).unwrap().unwrap();
        assert_eq!(loaded, class);
    }

    #[test]
    fn test_save_replaces_children() {
        let (db, mut names) = setup();
        let mut class = Class::named("Task");
        class.add_field("title", StoreType::Hot).add_field("old", StoreType::Cold);
        let first = save_class(&db, &mut names, &class).unwrap();

        class.remove_field("old");
        let second = save_class(&db, &mut names, &class).unwrap();
        assert_eq!(first, second);

        let loaded = load_class(&db, &mut names, class.uid).unwrap().unwrap();
        assert_eq!(loaded.fields.len(), 1);
        assert_eq!(loaded.checksum, class.checksum);
    }

    #[test]
    fn test_missing_manager_is_not_found() {
        let (db, mut names) = setup();
        let mut class = Class::new();
        class.manager = Some(Uid::from_u128(5));
        let err = save_class(&db, &mut names, &class).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(class_rowid(&db, class.uid).unwrap().is_none());
    }

    #[test]
    fn test_tombstone() {
        let (db, mut names) = setup();
        let class = Class::named("Gone");
        save_class(&db, &mut names, &class).unwrap();

        assert!(tombstone_class(&db, class.uid, 50).unwrap());
        assert!(!tombstone_class(&db, class.uid, 60).unwrap());
        assert_eq!(class_modstamp(&db, class.uid).unwrap(), Some(50));

        let loaded = load_class(&db, &mut names, class.uid).unwrap().unwrap();
        assert!(loaded.is_deleted);
        assert!(load_class(&db, &mut names, Uid::new()).unwrap().is_none());
    }
}
