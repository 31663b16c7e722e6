//! SQLite table layout for items, classes, schemas and interned names
//!
//! Uids are 16-byte BLOBs; checksums are 32-byte SHA-256 BLOBs. References
//! that can point back into the same table are deferred so a whole edit can
//! be written in any order inside one transaction.

use rusqlite::{Connection, OptionalExtension, Result};

/// Current store layout version for migrations
pub const STORE_VERSION: i32 = 1;

/// Initialize the database layout
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Layout version tracking
        CREATE TABLE IF NOT EXISTS StoreInfo (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Interned names (field names, class names)
        CREATE TABLE IF NOT EXISTS NameId (
            rowid INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        -- Compiled, immutable schemas
        CREATE TABLE IF NOT EXISTS Schema (
            rowid INTEGER PRIMARY KEY,
            csum BLOB NOT NULL UNIQUE,
            hotCount INTEGER NOT NULL,
            coldCount INTEGER NOT NULL,
            sharedCount INTEGER NOT NULL,
            bare INTEGER REFERENCES Schema(rowid) DEFERRABLE INITIALLY DEFERRED,
            data BLOB NOT NULL
        );

        -- Packed field index per schema: position << 2 | store type
        CREATE TABLE IF NOT EXISTS SchemaToField (
            schema INTEGER NOT NULL REFERENCES Schema(rowid),
            fld INTEGER NOT NULL REFERENCES NameId(rowid),
            idx INTEGER NOT NULL,
            PRIMARY KEY (schema, fld),
            UNIQUE (schema, idx)
        ) WITHOUT ROWID;

        -- Classes a schema was compiled from
        CREATE TABLE IF NOT EXISTS SchemaToClass (
            schema INTEGER NOT NULL REFERENCES Schema(rowid),
            cls INTEGER NOT NULL REFERENCES Class(rowid),
            isDirect INTEGER NOT NULL,
            ord INTEGER NOT NULL,
            PRIMARY KEY (schema, cls)
        ) WITHOUT ROWID;

        -- Tree-shaped items
        CREATE TABLE IF NOT EXISTS Item (
            rowid INTEGER PRIMARY KEY,
            uid BLOB NOT NULL UNIQUE,
            parent INTEGER REFERENCES Item(rowid) DEFERRABLE INITIALLY DEFERRED,
            ord INTEGER NOT NULL DEFAULT 0,
            schema INTEGER NOT NULL REFERENCES Schema(rowid),
            ordModst INTEGER NOT NULL,
            dataModst INTEGER NOT NULL,
            data BLOB,
            isDeleted INTEGER NOT NULL DEFAULT 0
        );

        -- Cold (overflow) field values, keyed by item rowid
        CREATE TABLE IF NOT EXISTS ItemCold (
            item INTEGER PRIMARY KEY REFERENCES Item(rowid) ON DELETE CASCADE,
            data BLOB NOT NULL
        );

        -- Interned field values
        CREATE TABLE IF NOT EXISTS Interned (
            rowid INTEGER PRIMARY KEY,
            csum BLOB NOT NULL UNIQUE,
            typeHint INTEGER NOT NULL,
            data BLOB NOT NULL
        );

        -- Reusable field-set descriptions
        CREATE TABLE IF NOT EXISTS Class (
            rowid INTEGER PRIMARY KEY,
            uid BLOB NOT NULL UNIQUE,
            csum BLOB NOT NULL,
            modst INTEGER NOT NULL,
            ord INTEGER NOT NULL DEFAULT 0,
            manager INTEGER REFERENCES Item(rowid) DEFERRABLE INITIALLY DEFERRED,
            name TEXT,
            isDeleted INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS ClassToField (
            cls INTEGER NOT NULL REFERENCES Class(rowid) ON DELETE CASCADE,
            fld INTEGER NOT NULL REFERENCES NameId(rowid),
            csum BLOB NOT NULL,
            ord INTEGER NOT NULL,
            storeType INTEGER NOT NULL,
            val BLOB,
            PRIMARY KEY (cls, fld)
        ) WITHOUT ROWID;

        -- Included classes by uid; the target may not be stored yet
        CREATE TABLE IF NOT EXISTS ClassToInclude (
            cls INTEGER NOT NULL REFERENCES Class(rowid) ON DELETE CASCADE,
            incl BLOB NOT NULL,
            ord INTEGER NOT NULL,
            PRIMARY KEY (cls, incl)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS idx_item_parent ON Item(parent, ord);
        CREATE INDEX IF NOT EXISTS idx_item_schema ON Item(schema);
        CREATE INDEX IF NOT EXISTS idx_class_to_field_ord ON ClassToField(cls, ord);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO StoreInfo (key, value) VALUES ('version', ?)",
        [STORE_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current layout version from the database
pub fn get_store_version(conn: &Connection) -> Result<Option<i32>> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM StoreInfo WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.and_then(|v| v.parse().ok()))
}

/// Check if the layout needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='StoreInfo'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_store_version(conn) {
        Ok(Some(v)) => v < STORE_VERSION,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "NameId",
            "Item",
            "ItemCold",
            "Interned",
            "Schema",
            "SchemaToField",
            "SchemaToClass",
            "Class",
            "ClassToField",
            "ClassToInclude",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_store_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(needs_init(&conn));

        init_schema(&conn).unwrap();

        assert_eq!(get_store_version(&conn).unwrap(), Some(STORE_VERSION));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_store_version(&conn).unwrap(), Some(STORE_VERSION));
    }
}
