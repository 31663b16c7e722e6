//! Unified storage interface
//!
//! The `Store` ties together one SQLite connection and everything layered on
//! it:
//! - Names (interned field names)
//! - Classes and the schemas compiled from them
//! - Items, their tree position and their hot/cold field data
//! - Interned values
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open(Config::load()?)?;
//!
//! let mut task = Class::named("Task");
//! task.add_field("title", StoreType::Hot);
//! store.put_class(&mut task)?;
//!
//! let item = store.create_item(None, 0, &[task.uid])?;
//! store.set_fields(item.uid, &[("title", FieldValue::text("Write docs"))])?;
//! ```
//!
//! Every write runs inside a [`TransactionNester`]; wrap several calls in
//! [`Store::transaction`] to make them atomic together.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use rusqlite::blob::Blob;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::classes::{class_modstamp, class_rowid, load_class, save_class, tombstone_class};
use crate::codec::fields::{self, FieldValue};
use crate::config::Config;
use crate::models::{Class, Item, SchemaRef, StoreType};
use crate::modstamp::{Modstamp, ModstampClock};
use crate::names::NameRegistry;
use crate::reader::{FieldsReader, HotColdFieldsReader};
use crate::schema::{load_schema, SchemaCompiler, SchemaInfo};
use crate::storage::db::Db;
use crate::storage::error::{is_unique_violation, StoreError, StoreResult};
use crate::storage::txn::TransactionNester;
use crate::uid::Uid;

/// Lazily opens an item's cold blob
pub type ColdOpener<'a> = Box<dyn FnOnce() -> StoreResult<Option<Blob<'a>>> + 'a>;

/// Streaming reader over one item's local fields
pub type ItemFieldsReader<'a> = HotColdFieldsReader<Blob<'a>, Blob<'a>, ColdOpener<'a>>;

const ITEM_SELECT: &str = "SELECT i.rowid, i.uid, p.uid, i.ord, i.schema, i.ordModst, i.dataModst, i.isDeleted
     FROM Item i LEFT JOIN Item p ON p.rowid = i.parent";

fn map_item(row: &Row<'_>) -> rusqlite::Result<(i64, Item)> {
    Ok((
        row.get(0)?,
        Item {
            uid: row.get(1)?,
            parent: row.get(2)?,
            ordinal: row.get(3)?,
            schema: SchemaRef { rowid: row.get(4)? },
            ord_modstamp: row.get(5)?,
            data_modstamp: row.get(6)?,
            is_deleted: row.get(7)?,
        },
    ))
}

/// Value slot `pos` of a bucket sized from the schema's counts
fn slot_mut<'v>(values: &'v mut [FieldValue], pos: usize, bucket: &str) -> StoreResult<&'v mut FieldValue> {
    let count = values.len();
    values.get_mut(pos).ok_or_else(|| {
        StoreError::corrupt(format!(
            "{} field position {} outside schema count {}",
            bucket, pos, count
        ))
    })
}

/// Where a writable field lives
enum LocalSlot {
    Hot(usize),
    Cold(usize),
}

/// Unified storage interface for Arbor
pub struct Store {
    db: Db,
    names: RefCell<NameRegistry>,
    clock: ModstampClock,
    config: Config,
}

impl Store {
    /// Open the store at the configured database path
    pub fn open(config: Config) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.database_path();
        let db = Db::open(&path)?;
        info!(path = %path.display(), "Opened store");
        Ok(Self::from_db(db, config))
    }

    /// Load configuration from the default location and open the store
    pub fn open_default() -> anyhow::Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open(config).context("Failed to open store database")
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::from_db(Db::open_in_memory()?, Config::default()))
    }

    /// Wrap an already open connection
    pub fn from_db(db: Db, config: Config) -> Self {
        Self {
            names: RefCell::new(NameRegistry::new(config.name_cache_size)),
            db,
            clock: ModstampClock::new(),
            config,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Open a transaction scope; store calls made while it is alive join it
    pub fn transaction(&self) -> StoreResult<TransactionNester<'_>> {
        TransactionNester::begin(&self.db)
    }

    // ==================== Names ====================

    /// Id for `name`, allocating one if needed
    pub fn ensure_name_id(&self, name: &str) -> StoreResult<i64> {
        self.names.borrow_mut().ensure_id(&self.db, name)
    }

    /// Id for `name`, if it has one
    pub fn name_id(&self, name: &str) -> StoreResult<Option<i64>> {
        self.names.borrow_mut().id_of(&self.db, name)
    }

    /// Name for `id`
    pub fn name(&self, id: i64) -> StoreResult<Option<Arc<str>>> {
        self.names.borrow_mut().name_of(&self.db, id)
    }

    // ==================== Classes ====================

    /// Insert or update a class
    ///
    /// Recomputes the checksum and issues a new modstamp (above any
    /// tombstone for the same uid). Items whose schema used the class are
    /// recompiled when its layout changed.
    pub fn put_class(&self, class: &mut Class) -> StoreResult<()> {
        let mut tx = self.transaction()?;

        let previous: Option<(Vec<u8>, Modstamp, bool)> = self
            .db
            .connection()
            .query_row(
                "SELECT csum, modst, isDeleted FROM Class WHERE uid = ?",
                [class.uid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        class.checksum = class.compute_checksum();
        let floor = previous.as_ref().map_or(Modstamp::MIN, |(_, modst, _)| *modst);
        class.modstamp = self.clock.next_after(floor);
        save_class(&self.db, &mut self.names.borrow_mut(), class)?;

        let layout_changed = previous.is_some_and(|(csum, _, was_deleted)| {
            csum != class.checksum || was_deleted != class.is_deleted
        });
        if layout_changed {
            self.refresh_items_using(class.uid)?;
        }

        tx.commit()?;
        debug!(uid = %class.uid, modstamp = class.modstamp, "Saved class");
        Ok(())
    }

    /// Get a live class
    pub fn get_class(&self, uid: Uid) -> StoreResult<Option<Class>> {
        let class = load_class(&self.db, &mut self.names.borrow_mut(), uid)?;
        Ok(class.filter(|c| !c.is_deleted))
    }

    /// Tombstone a class and drop its fields from the items using it
    pub fn delete_class(&self, uid: Uid) -> StoreResult<bool> {
        let mut tx = self.transaction()?;
        let Some(modst) = class_modstamp(&self.db, uid)? else {
            tx.commit()?;
            return Ok(false);
        };
        let deleted = tombstone_class(&self.db, uid, self.clock.next_after(modst))?;
        if deleted {
            self.refresh_items_using(uid)?;
            info!(%uid, "Deleted class");
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn is_live_class(&self, uid: Uid) -> StoreResult<bool> {
        Ok(self
            .db
            .connection()
            .query_row(
                "SELECT 1 FROM Class WHERE uid = ? AND isDeleted = 0",
                [uid],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn load_live_classes(&self, uids: &[Uid]) -> StoreResult<Vec<Class>> {
        uids.iter()
            .map(|&uid| {
                self.get_class(uid)?
                    .ok_or_else(|| StoreError::not_found(format!("class {}", uid)))
            })
            .collect()
    }

    /// Recompile every live item whose schema includes `class_uid`
    fn refresh_items_using(&self, class_uid: Uid) -> StoreResult<()> {
        let Some(cls) = class_rowid(&self.db, class_uid)? else {
            return Ok(());
        };
        let affected: Vec<(Uid, i64)> = self
            .db
            .connection()
            .prepare(
                "SELECT DISTINCT i.uid, i.schema FROM Item i
                 JOIN SchemaToClass sc ON sc.schema = i.schema
                 WHERE sc.cls = ? AND i.isDeleted = 0",
            )?
            .query_map([cls], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut schemas: HashMap<i64, Vec<Uid>> = HashMap::new();
        for (uid, schema) in &affected {
            if !schemas.contains_key(schema) {
                let direct = load_schema(&self.db, SchemaRef { rowid: *schema })?.direct_classes();
                let mut live = Vec::with_capacity(direct.len());
                for class in direct {
                    if self.is_live_class(class)? {
                        live.push(class);
                    }
                }
                schemas.insert(*schema, live);
            }
            self.set_item_classes(*uid, &schemas[schema])?;
        }

        if !affected.is_empty() {
            info!(class = %class_uid, items = affected.len(), "Recompiled items after class change");
        }
        Ok(())
    }

    // ==================== Schemas ====================

    /// Compile the given live classes (in order) into a committed schema
    pub fn compile_schema(&self, classes: &[Uid]) -> StoreResult<SchemaRef> {
        let mut tx = self.transaction()?;
        let loaded = self.load_live_classes(classes)?;
        let (schema, _) =
            SchemaCompiler::new(&self.db, &mut self.names.borrow_mut()).compile_and_commit(&loaded)?;
        tx.commit()?;
        Ok(schema)
    }

    /// Read back a committed schema
    pub fn schema(&self, schema: SchemaRef) -> StoreResult<SchemaInfo> {
        load_schema(&self.db, schema)
    }

    // ==================== Items ====================

    /// Create an item with a fresh uid
    pub fn create_item(&self, parent: Option<Uid>, ordinal: i64, classes: &[Uid]) -> StoreResult<Item> {
        self.create_item_with_uid(Uid::new(), parent, ordinal, classes)
    }

    /// Create an item with a caller-chosen uid
    ///
    /// A tombstoned uid is revived with modstamps above the tombstone's;
    /// a live one is an error.
    pub fn create_item_with_uid(
        &self,
        uid: Uid,
        parent: Option<Uid>,
        ordinal: i64,
        classes: &[Uid],
    ) -> StoreResult<Item> {
        let mut tx = self.transaction()?;
        let parent_rowid = match parent {
            Some(p) => Some(self.live_item(p)?.0),
            None => None,
        };
        let schema = self.compile_schema(classes)?;
        let conn = self.db.connection();

        let stamp = match self.item_row(uid)? {
            Some((_, existing)) if !existing.is_deleted => {
                return Err(StoreError::AlreadyExists {
                    what: format!("item {}", uid),
                });
            }
            Some((rowid, tombstone)) => {
                let stamp = self
                    .clock
                    .next_after(tombstone.ord_modstamp.max(tombstone.data_modstamp));
                conn.execute("DELETE FROM ItemCold WHERE item = ?", [rowid])?;
                conn.execute(
                    "UPDATE Item SET parent = ?1, ord = ?2, schema = ?3, ordModst = ?4,
                        dataModst = ?4, data = NULL, isDeleted = 0
                     WHERE rowid = ?5",
                    params![parent_rowid, ordinal, schema.rowid, stamp, rowid],
                )?;
                info!(%uid, "Revived tombstoned item");
                stamp
            }
            None => {
                let stamp = self.clock.next();
                conn.execute(
                    "INSERT INTO Item (uid, parent, ord, schema, ordModst, dataModst)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![uid, parent_rowid, ordinal, schema.rowid, stamp],
                )?;
                stamp
            }
        };

        tx.commit()?;
        debug!(%uid, schema = schema.rowid, "Created item");
        Ok(Item {
            uid,
            parent,
            ordinal,
            schema,
            ord_modstamp: stamp,
            data_modstamp: stamp,
            is_deleted: false,
        })
    }

    fn item_row(&self, uid: Uid) -> StoreResult<Option<(i64, Item)>> {
        Ok(self
            .db
            .connection()
            .query_row(&format!("{} WHERE i.uid = ?", ITEM_SELECT), [uid], map_item)
            .optional()?)
    }

    fn live_item(&self, uid: Uid) -> StoreResult<(i64, Item)> {
        match self.item_row(uid)? {
            Some((rowid, item)) if !item.is_deleted => Ok((rowid, item)),
            _ => Err(StoreError::not_found(format!("item {}", uid))),
        }
    }

    /// Get a live item
    pub fn get_item(&self, uid: Uid) -> StoreResult<Option<Item>> {
        Ok(self
            .item_row(uid)?
            .map(|(_, item)| item)
            .filter(|item| !item.is_deleted))
    }

    /// Live children of `parent` (or root items for `None`), by ordinal
    pub fn children(&self, parent: Option<Uid>) -> StoreResult<Vec<Item>> {
        let parent_rowid = match parent {
            Some(p) => Some(self.live_item(p)?.0),
            None => None,
        };
        let children: Vec<Item> = self
            .db
            .connection()
            .prepare(&format!(
                "{} WHERE i.parent IS ? AND i.isDeleted = 0 ORDER BY i.ord, i.uid",
                ITEM_SELECT
            ))?
            .query_map([parent_rowid], map_item)?
            .map(|row| row.map(|(_, item)| item))
            .collect::<Result<_, _>>()?;
        Ok(children)
    }

    /// Reparent and/or reorder an item; only the ordinal modstamp moves
    pub fn move_item(&self, uid: Uid, parent: Option<Uid>, ordinal: i64) -> StoreResult<Item> {
        let mut tx = self.transaction()?;
        let (rowid, mut item) = self.live_item(uid)?;
        let parent_rowid = match parent {
            Some(p) => {
                let (prow, _) = self.live_item(p)?;
                if self.is_ancestor_or_self(rowid, prow)? {
                    return Err(StoreError::InvalidMove {
                        details: format!("{} would become its own ancestor", uid),
                    });
                }
                Some(prow)
            }
            None => None,
        };

        item.parent = parent;
        item.ordinal = ordinal;
        item.ord_modstamp = self.clock.next_after(item.ord_modstamp);
        self.db.connection().execute(
            "UPDATE Item SET parent = ?1, ord = ?2, ordModst = ?3 WHERE rowid = ?4",
            params![parent_rowid, ordinal, item.ord_modstamp, rowid],
        )?;
        tx.commit()?;
        Ok(item)
    }

    fn is_ancestor_or_self(&self, ancestor: i64, of: i64) -> StoreResult<bool> {
        Ok(self.db.connection().query_row(
            "WITH RECURSIVE anc(r) AS (
                SELECT ?1
                UNION
                SELECT Item.parent FROM Item JOIN anc ON Item.rowid = anc.r
                WHERE Item.parent IS NOT NULL
             )
             SELECT EXISTS (SELECT 1 FROM anc WHERE r = ?2)",
            params![of, ancestor],
            |row| row.get(0),
        )?)
    }

    /// Tombstone an item and its whole subtree
    pub fn delete_item(&self, uid: Uid) -> StoreResult<bool> {
        let mut tx = self.transaction()?;
        let rowid = match self.item_row(uid)? {
            Some((rowid, item)) if !item.is_deleted => rowid,
            _ => {
                tx.commit()?;
                return Ok(false);
            }
        };

        const SUBTREE: &str = "WITH RECURSIVE sub(r) AS (
                SELECT ?1
                UNION
                SELECT Item.rowid FROM Item JOIN sub ON Item.parent = sub.r
             )";
        let conn = self.db.connection();
        let floor: Modstamp = conn.query_row(
            &format!(
                "{} SELECT MAX(MAX(ordModst, dataModst)) FROM Item WHERE rowid IN (SELECT r FROM sub)",
                SUBTREE
            ),
            [rowid],
            |row| row.get(0),
        )?;
        let stamp = self.clock.next_after(floor);

        conn.execute(
            &format!(
                "{} DELETE FROM ItemCold WHERE item IN (SELECT r FROM sub)",
                SUBTREE
            ),
            [rowid],
        )?;
        let count = conn.execute(
            &format!(
                "{} UPDATE Item SET isDeleted = 1, data = NULL, ordModst = ?2, dataModst = ?2
                 WHERE rowid IN (SELECT r FROM sub) AND isDeleted = 0",
                SUBTREE
            ),
            params![rowid, stamp],
        )?;

        tx.commit()?;
        info!(%uid, count, "Deleted item subtree");
        Ok(true)
    }

    /// Write local field values by name; only the data modstamp moves
    pub fn set_fields(&self, uid: Uid, values: &[(&str, FieldValue)]) -> StoreResult<Item> {
        let mut tx = self.transaction()?;
        let (rowid, mut item) = self.live_item(uid)?;
        let info = load_schema(&self.db, item.schema)?;
        let (mut hot, mut cold) = self.read_local(rowid, &info)?;

        for (name, value) in values {
            let slot = self.local_slot(&info, name)?;
            let value = self.maybe_intern(value.clone())?;
            match slot {
                LocalSlot::Hot(pos) => *slot_mut(&mut hot, pos, "hot")? = value,
                LocalSlot::Cold(pos) => *slot_mut(&mut cold, pos, "cold")? = value,
            }
        }

        self.write_local(rowid, hot, cold)?;
        item.data_modstamp = self.clock.next_after(item.data_modstamp);
        self.db.connection().execute(
            "UPDATE Item SET dataModst = ? WHERE rowid = ?",
            params![item.data_modstamp, rowid],
        )?;
        tx.commit()?;
        Ok(item)
    }

    /// Switch an item to a new class list, carrying values over by field name
    ///
    /// Values of fields that the new schema lacks, or declares shared, are
    /// dropped.
    pub fn set_item_classes(&self, uid: Uid, classes: &[Uid]) -> StoreResult<SchemaRef> {
        let mut tx = self.transaction()?;
        let (rowid, item) = self.live_item(uid)?;
        let schema = self.compile_schema(classes)?;
        if schema == item.schema {
            tx.commit()?;
            return Ok(schema);
        }

        let old = load_schema(&self.db, item.schema)?;
        let new = load_schema(&self.db, schema)?;
        let (hot, cold) = self.read_local(rowid, &old)?;

        let mut by_field: HashMap<i64, FieldValue> = old
            .fields
            .iter()
            .filter_map(|(id, index)| {
                let pos = index.position() as usize;
                let value = match index.store_type() {
                    StoreType::Hot => hot.get(pos),
                    StoreType::Cold => cold.get(pos),
                    StoreType::Shared => None,
                }?;
                (!value.is_null()).then(|| (*id, value.clone()))
            })
            .collect();

        let mut new_hot = vec![FieldValue::Null; new.hot_count as usize];
        let mut new_cold = vec![FieldValue::Null; new.cold_count as usize];
        for (id, index) in &new.fields {
            if let Some(value) = by_field.remove(id) {
                let pos = index.position() as usize;
                match index.store_type() {
                    StoreType::Hot => *slot_mut(&mut new_hot, pos, "hot")? = value,
                    StoreType::Cold => *slot_mut(&mut new_cold, pos, "cold")? = value,
                    StoreType::Shared => debug!(field = id, "Field became shared, dropping value"),
                }
            }
        }
        if !by_field.is_empty() {
            debug!(%uid, dropped = by_field.len(), "Fields not in new schema");
        }

        self.write_local(rowid, new_hot, new_cold)?;
        self.db.connection().execute(
            "UPDATE Item SET schema = ?1, dataModst = ?2 WHERE rowid = ?3",
            params![schema.rowid, self.clock.next_after(item.data_modstamp), rowid],
        )?;
        tx.commit()?;
        Ok(schema)
    }

    fn local_slot(&self, info: &SchemaInfo, name: &str) -> StoreResult<LocalSlot> {
        let not_writable = |reason| StoreError::FieldNotWritable {
            name: name.to_string(),
            reason,
        };
        let index = self
            .name_id(name)?
            .and_then(|id| info.index_of(id))
            .ok_or_else(|| not_writable("not in the item's schema"))?;
        let pos = index.position() as usize;
        match index.store_type() {
            StoreType::Hot => Ok(LocalSlot::Hot(pos)),
            StoreType::Cold => Ok(LocalSlot::Cold(pos)),
            StoreType::Shared => Err(not_writable("shared fields are set on the class")),
        }
    }

    /// Current hot and cold values, padded to the schema's counts
    fn read_local(&self, rowid: i64, info: &SchemaInfo) -> StoreResult<(Vec<FieldValue>, Vec<FieldValue>)> {
        let conn = self.db.connection();
        let hot_blob: Option<Vec<u8>> =
            conn.query_row("SELECT data FROM Item WHERE rowid = ?", [rowid], |row| {
                row.get(0)
            })?;
        let cold_blob: Option<Vec<u8>> = conn
            .query_row("SELECT data FROM ItemCold WHERE item = ?", [rowid], |row| {
                row.get(0)
            })
            .optional()?;

        let decode = |blob: Option<Vec<u8>>, count: u32| -> StoreResult<Vec<FieldValue>> {
            let mut values = match blob {
                Some(bytes) => fields::decode_all(&bytes)?,
                None => Vec::new(),
            };
            values.resize(count as usize, FieldValue::Null);
            Ok(values)
        };
        Ok((
            decode(hot_blob, info.hot_count)?,
            decode(cold_blob, info.cold_count)?,
        ))
    }

    /// Store hot and cold values, dropping trailing nulls and empty blobs
    fn write_local(&self, rowid: i64, mut hot: Vec<FieldValue>, mut cold: Vec<FieldValue>) -> StoreResult<()> {
        for values in [&mut hot, &mut cold] {
            while values.last().is_some_and(FieldValue::is_null) {
                values.pop();
            }
        }

        let conn = self.db.connection();
        let hot_data = (!hot.is_empty()).then(|| fields::encode(&hot));
        conn.execute(
            "UPDATE Item SET data = ?1 WHERE rowid = ?2",
            params![hot_data, rowid],
        )?;

        if cold.is_empty() {
            conn.execute("DELETE FROM ItemCold WHERE item = ?", [rowid])?;
        } else {
            conn.execute(
                "INSERT INTO ItemCold (item, data) VALUES (?1, ?2)
                 ON CONFLICT(item) DO UPDATE SET data = excluded.data",
                params![rowid, fields::encode(&cold)],
            )?;
        }
        Ok(())
    }

    // ==================== Field Reads ====================

    /// Value of field `name` on a live item
    ///
    /// Shared fields come from the schema. A name the schema does not
    /// declare reads as `Null`. Interned values are returned unresolved.
    pub fn read_field(&self, uid: Uid, name: &str) -> StoreResult<FieldValue> {
        let (rowid, item) = self.live_item(uid)?;
        let info = load_schema(&self.db, item.schema)?;
        let Some(index) = self.name_id(name)?.and_then(|id| info.index_of(id)) else {
            return Ok(FieldValue::Null);
        };

        let pos = index.position() as usize;
        match index.store_type() {
            StoreType::Shared => info.shared_value(index.position()),
            StoreType::Hot => self.reader_for(rowid, &info)?.read_field_val(pos),
            StoreType::Cold => self
                .reader_for(rowid, &info)?
                .read_field_val(info.hot_count as usize + pos),
        }
    }

    /// Every field of a live item, shared ones included, in schema order
    pub fn read_fields(&self, uid: Uid) -> StoreResult<Vec<(Arc<str>, FieldValue)>> {
        let (rowid, item) = self.live_item(uid)?;
        let info = load_schema(&self.db, item.schema)?;
        let mut reader = self.reader_for(rowid, &info)?;

        let mut out = Vec::with_capacity(info.fields.len());
        for (id, index) in &info.fields {
            let name = self
                .name(*id)?
                .ok_or_else(|| StoreError::corrupt(format!("field name id {} missing", id)))?;
            let pos = index.position() as usize;
            let value = match index.store_type() {
                StoreType::Shared => info.shared_value(index.position())?,
                StoreType::Hot => reader.read_field_val(pos)?,
                StoreType::Cold => reader.read_field_val(info.hot_count as usize + pos)?,
            };
            out.push((name, value));
        }
        Ok(out)
    }

    /// Streaming reader over a live item's hot then cold fields
    pub fn open_fields_reader(&self, uid: Uid) -> StoreResult<ItemFieldsReader<'_>> {
        let (rowid, item) = self.live_item(uid)?;
        let info = load_schema(&self.db, item.schema)?;
        self.reader_for(rowid, &info)
    }

    fn reader_for(&self, rowid: i64, info: &SchemaInfo) -> StoreResult<ItemFieldsReader<'_>> {
        let hot = self.db.open_blob("Item", "data", rowid)?;
        let db = &self.db;
        let open_cold: ColdOpener<'_> = Box::new(move || db.open_blob("ItemCold", "data", rowid));
        HotColdFieldsReader::new(
            hot,
            info.hot_count as usize,
            info.cold_count as usize,
            open_cold,
        )
    }

    // ==================== Interning ====================

    /// Store a value once in the interning table and point at it
    pub fn intern(&self, type_hint: u32, bytes: &[u8]) -> StoreResult<FieldValue> {
        let mut hasher = Sha256::new();
        hasher.update(type_hint.to_be_bytes());
        hasher.update(bytes);
        let csum: [u8; 32] = hasher.finalize().into();

        let mut tx = self.transaction()?;
        let rowid = match self.find_interned(&csum, type_hint, bytes)? {
            Some(rowid) => rowid,
            None => {
                let inserted = self.db.connection().execute(
                    "INSERT INTO Interned (csum, typeHint, data) VALUES (?1, ?2, ?3)",
                    params![&csum[..], type_hint, bytes],
                );
                match inserted {
                    Ok(_) => self.db.connection().last_insert_rowid(),
                    Err(e) if is_unique_violation(&e) => self
                        .find_interned(&csum, type_hint, bytes)?
                        .ok_or_else(|| StoreError::corrupt("interned checksum conflicted but no row matches"))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };
        tx.commit()?;
        Ok(FieldValue::Interned(rowid))
    }

    fn find_interned(&self, csum: &[u8; 32], type_hint: u32, bytes: &[u8]) -> StoreResult<Option<i64>> {
        let row: Option<(i64, u32, Vec<u8>)> = self
            .db
            .connection()
            .query_row(
                "SELECT rowid, typeHint, data FROM Interned WHERE csum = ?",
                [&csum[..]],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((rowid, hint, data)) if hint == type_hint && data == bytes => Ok(Some(rowid)),
            Some((rowid, _, _)) => Err(StoreError::ChecksumCollision { rowid }),
        }
    }

    fn maybe_intern(&self, value: FieldValue) -> StoreResult<FieldValue> {
        let threshold = self.config.intern_threshold;
        match value {
            FieldValue::Raw { type_hint, bytes } if threshold > 0 && bytes.len() >= threshold => {
                self.intern(type_hint, &bytes)
            }
            other => Ok(other),
        }
    }

    /// Replace an interned pointer with the value it points at
    pub fn resolve(&self, value: &FieldValue) -> StoreResult<FieldValue> {
        let FieldValue::Interned(rowid) = value else {
            return Ok(value.clone());
        };
        let (type_hint, bytes): (u32, Vec<u8>) = self
            .db
            .connection()
            .query_row(
                "SELECT typeHint, data FROM Interned WHERE rowid = ?",
                [rowid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::corrupt(format!("interned row {} missing", rowid)))?;
        Ok(FieldValue::Raw { type_hint, bytes })
    }
}
