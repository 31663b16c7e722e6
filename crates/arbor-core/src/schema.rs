//! Schema compilation
//!
//! A schema is the flattened, immutable field layout an item is stored
//! under. Compiling walks the item's classes and everything they include,
//! assigns every field a packed index, and checksums the result. Committing
//! finds or inserts the `Schema` row by that checksum, so compiling the same
//! class set twice lands on the same row.
//!
//! Every schema also has a bare variant: the same layout with no shared
//! values. A schema without shared values is its own bare variant.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::classes::{class_rowid, load_class, to_checksum};
use crate::codec::fields::{self, FieldValue};
use crate::models::{Checksum, Class, FieldIndex, SchemaRef, StoreType};
use crate::names::NameRegistry;
use crate::storage::db::Db;
use crate::storage::error::{is_unique_violation, StoreError, StoreResult};
use crate::storage::txn::TransactionNester;
use crate::uid::Uid;

/// A field's place in a compiled schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledField {
    pub field_id: i64,
    pub name: Arc<str>,
    pub index: FieldIndex,
    pub shared_value: Option<FieldValue>,
}

/// A class that contributed to a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaClass {
    pub uid: Uid,
    /// Listed by the item itself rather than reached through an include
    pub is_direct: bool,
}

/// A compiled schema that has not been committed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSchema {
    fields: Vec<CompiledField>,
    classes: Vec<SchemaClass>,
    hot_count: u32,
    cold_count: u32,
    shared_count: u32,
    shared_data: Vec<u8>,
    checksum: Checksum,
    bare_checksum: Checksum,
}

impl CompiledSchema {
    /// Fields in merge order
    pub fn fields(&self) -> &[CompiledField] {
        &self.fields
    }

    /// Flattened classes in depth-first preorder
    pub fn classes(&self) -> &[SchemaClass] {
        &self.classes
    }

    pub fn field(&self, name: &str) -> Option<&CompiledField> {
        self.fields.iter().find(|f| &*f.name == name)
    }

    pub fn hot_count(&self) -> u32 {
        self.hot_count
    }

    pub fn cold_count(&self) -> u32 {
        self.cold_count
    }

    pub fn shared_count(&self) -> u32 {
        self.shared_count
    }

    /// Hot plus cold fields
    pub fn local_count(&self) -> u32 {
        self.hot_count + self.cold_count
    }

    /// Encoded shared values; empty when no shared field has a value
    pub fn shared_data(&self) -> &[u8] {
        &self.shared_data
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn bare_checksum(&self) -> &Checksum {
        &self.bare_checksum
    }

    /// Whether this schema is its own bare variant
    pub fn is_bare(&self) -> bool {
        self.checksum == self.bare_checksum
    }

    /// Find or insert this schema and its bare variant
    pub fn commit(&self, db: &Db) -> StoreResult<SchemaRef> {
        let mut tx = TransactionNester::begin(db)?;
        let bare = self.ensure_row(db, &self.bare_checksum, &[], None)?;
        let rowid = if self.is_bare() {
            bare
        } else {
            self.ensure_row(db, &self.checksum, &self.shared_data, Some(bare))?
        };
        tx.commit()?;
        Ok(SchemaRef { rowid })
    }

    fn ensure_row(
        &self,
        db: &Db,
        checksum: &Checksum,
        data: &[u8],
        bare: Option<i64>,
    ) -> StoreResult<i64> {
        if let Some(rowid) = self.select_matching(db, checksum, data)? {
            debug!(rowid, "Reusing existing schema");
            return Ok(rowid);
        }

        let conn = db.connection();
        let inserted = conn.execute(
            "INSERT INTO Schema (csum, hotCount, coldCount, sharedCount, bare, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &checksum[..],
                self.hot_count,
                self.cold_count,
                self.shared_count,
                bare,
                data
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                debug!("Schema inserted concurrently, re-reading");
                return self.select_matching(db, checksum, data)?.ok_or_else(|| {
                    StoreError::corrupt("schema checksum conflicted but no row matches")
                });
            }
            Err(e) => return Err(e.into()),
        }
        let rowid = conn.last_insert_rowid();

        if bare.is_none() {
            conn.execute("UPDATE Schema SET bare = rowid WHERE rowid = ?", [rowid])?;
        }

        for field in &self.fields {
            conn.execute(
                "INSERT INTO SchemaToField (schema, fld, idx) VALUES (?1, ?2, ?3)",
                params![rowid, field.field_id, field.index.raw()],
            )?;
        }
        for (ord, class) in self.classes.iter().enumerate() {
            let cls = class_rowid(db, class.uid)?
                .ok_or_else(|| StoreError::not_found(format!("class {}", class.uid)))?;
            conn.execute(
                "INSERT INTO SchemaToClass (schema, cls, isDirect, ord) VALUES (?1, ?2, ?3, ?4)",
                params![rowid, cls, class.is_direct, ord as i64],
            )?;
        }

        info!(
            rowid,
            hot = self.hot_count,
            cold = self.cold_count,
            shared = self.shared_count,
            bare = bare.is_none(),
            "Committed new schema"
        );
        Ok(rowid)
    }

    /// Row with `checksum`, checked against our own layout
    fn select_matching(&self, db: &Db, checksum: &Checksum, data: &[u8]) -> StoreResult<Option<i64>> {
        let row = db
            .connection()
            .query_row(
                "SELECT rowid, hotCount, coldCount, sharedCount, data FROM Schema WHERE csum = ?",
                [&checksum[..]],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((rowid, hot, cold, shared, stored)) => {
                if (hot, cold, shared) != (self.hot_count, self.cold_count, self.shared_count)
                    || stored != data
                {
                    return Err(StoreError::ChecksumCollision { rowid });
                }
                Ok(Some(rowid))
            }
        }
    }
}

/// Turns class sets into schemas
pub struct SchemaCompiler<'a> {
    db: &'a Db,
    names: &'a mut NameRegistry,
}

impl<'a> SchemaCompiler<'a> {
    pub fn new(db: &'a Db, names: &'a mut NameRegistry) -> Self {
        Self { db, names }
    }

    /// Expand `direct` and its includes, depth-first preorder, one entry per uid
    ///
    /// Includes are loaded from the store; missing or tombstoned ones are
    /// skipped. A class reached both directly and through an include is
    /// marked direct and keeps its first position.
    pub fn flatten(&mut self, direct: &[Class]) -> StoreResult<Vec<(Class, bool)>> {
        let mut out = Vec::new();
        let mut seen = HashMap::new();
        for class in direct {
            self.visit(class.clone(), true, &mut out, &mut seen)?;
        }
        Ok(out)
    }

    fn visit(
        &mut self,
        class: Class,
        is_direct: bool,
        out: &mut Vec<(Class, bool)>,
        seen: &mut HashMap<Uid, usize>,
    ) -> StoreResult<()> {
        if let Some(&at) = seen.get(&class.uid) {
            if is_direct {
                out[at].1 = true;
            }
            return Ok(());
        }
        seen.insert(class.uid, out.len());
        let includes = class.includes.clone();
        out.push((class, is_direct));

        for uid in includes {
            if seen.contains_key(&uid) {
                continue;
            }
            match load_class(self.db, self.names, uid)? {
                Some(included) if !included.is_deleted => {
                    self.visit(included, false, out, seen)?;
                }
                _ => debug!(%uid, "Skipping missing or deleted included class"),
            }
        }
        Ok(())
    }

    /// Compile `direct` (in order) into a draft schema
    pub fn compile(&mut self, direct: &[Class]) -> StoreResult<CompiledSchema> {
        let flat = self.flatten(direct)?;

        let mut fields = Vec::new();
        let mut seen_fields = HashSet::new();
        let mut counts = [0u32; 3];
        for (class, _) in &flat {
            for def in &class.fields {
                let field_id = self.names.ensure_id(self.db, &def.name)?;
                if !seen_fields.insert(field_id) {
                    debug!(
                        field = %def.name,
                        class = %class.uid,
                        "Field already declared by an earlier class, ignoring"
                    );
                    continue;
                }
                let bucket = &mut counts[def.store_type.code() as usize];
                let index = FieldIndex::new(def.store_type, *bucket);
                *bucket += 1;
                fields.push(CompiledField {
                    field_id,
                    name: Arc::from(def.name.as_str()),
                    index,
                    shared_value: match def.store_type {
                        StoreType::Shared => def.shared_value.clone(),
                        _ => None,
                    },
                });
            }
        }

        let classes: Vec<SchemaClass> = flat
            .iter()
            .map(|(class, is_direct)| SchemaClass {
                uid: class.uid,
                is_direct: *is_direct,
            })
            .collect();

        let shared_count = counts[StoreType::Shared.code() as usize];
        let shared_data = encode_shared(&fields, shared_count);
        let checksum = layout_checksum(&fields, &classes, &shared_data);
        let bare_checksum = layout_checksum(&fields, &classes, &[]);

        debug!(
            classes = classes.len(),
            fields = fields.len(),
            "Compiled schema"
        );

        Ok(CompiledSchema {
            fields,
            classes,
            hot_count: counts[StoreType::Hot.code() as usize],
            cold_count: counts[StoreType::Cold.code() as usize],
            shared_count,
            shared_data,
            checksum,
            bare_checksum,
        })
    }

    /// Compile and commit in one transaction
    pub fn compile_and_commit(&mut self, direct: &[Class]) -> StoreResult<(SchemaRef, CompiledSchema)> {
        let mut tx = TransactionNester::begin(self.db)?;
        let compiled = self.compile(direct)?;
        let schema = compiled.commit(self.db)?;
        tx.commit()?;
        Ok((schema, compiled))
    }
}

fn encode_shared(fields: &[CompiledField], shared_count: u32) -> Vec<u8> {
    let mut values = vec![FieldValue::Null; shared_count as usize];
    for field in fields {
        if let (StoreType::Shared, Some(value)) = (field.index.store_type(), &field.shared_value) {
            values[field.index.position() as usize] = value.clone();
        }
    }
    if values.iter().all(FieldValue::is_null) {
        Vec::new()
    } else {
        fields::encode(&values)
    }
}

fn layout_checksum(fields: &[CompiledField], classes: &[SchemaClass], shared: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update((fields.len() as u64).to_be_bytes());
    for field in fields {
        hasher.update(field.field_id.to_be_bytes());
        hasher.update([field.index.store_type().code()]);
        hasher.update(field.index.position().to_be_bytes());
    }
    hasher.update((classes.len() as u64).to_be_bytes());
    for class in classes {
        hasher.update(class.uid.to_bytes());
        hasher.update([class.is_direct as u8]);
    }
    hasher.update((shared.len() as u64).to_be_bytes());
    hasher.update(shared);
    hasher.finalize().into()
}

// ==================== Committed Schemas ====================

/// A committed schema as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    pub rowid: i64,
    pub checksum: Checksum,
    pub hot_count: u32,
    pub cold_count: u32,
    pub shared_count: u32,
    pub bare: i64,
    pub shared_data: Vec<u8>,
    /// `(field name id, packed index)` pairs
    pub fields: Vec<(i64, FieldIndex)>,
    pub classes: Vec<SchemaClass>,
}

impl SchemaInfo {
    pub fn local_count(&self) -> u32 {
        self.hot_count + self.cold_count
    }

    pub fn index_of(&self, field_id: i64) -> Option<FieldIndex> {
        self.fields
            .iter()
            .find(|(id, _)| *id == field_id)
            .map(|(_, index)| *index)
    }

    /// Uids of the classes listed directly, in flattened order
    pub fn direct_classes(&self) -> Vec<Uid> {
        self.classes
            .iter()
            .filter(|c| c.is_direct)
            .map(|c| c.uid)
            .collect()
    }

    /// Shared value at `position`; `Null` when absent
    pub fn shared_value(&self, position: u32) -> StoreResult<FieldValue> {
        if self.shared_data.is_empty() {
            return Ok(FieldValue::Null);
        }
        fields::decode(std::io::Cursor::new(&self.shared_data), position as usize)
    }
}

/// Load a committed schema by row id
pub fn load_schema(db: &Db, schema: SchemaRef) -> StoreResult<SchemaInfo> {
    let conn = db.connection();
    let row = conn
        .query_row(
            "SELECT csum, hotCount, coldCount, sharedCount, bare, data FROM Schema WHERE rowid = ?",
            [schema.rowid],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found(format!("schema {}", schema.rowid)))?;
    let (csum, hot_count, cold_count, shared_count, bare, shared_data) = row;

    let raw_fields: Vec<(i64, u32)> = conn
        .prepare("SELECT fld, idx FROM SchemaToField WHERE schema = ? ORDER BY idx")?
        .query_map([schema.rowid], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    let fields = raw_fields
        .into_iter()
        .map(|(fld, raw)| {
            FieldIndex::from_raw(raw)
                .map(|index| (fld, index))
                .ok_or_else(|| StoreError::corrupt(format!("bad packed field index {}", raw)))
        })
        .collect::<StoreResult<Vec<_>>>()?;

    let classes: Vec<SchemaClass> = conn
        .prepare(
            "SELECT c.uid, sc.isDirect FROM SchemaToClass sc
             JOIN Class c ON c.rowid = sc.cls
             WHERE sc.schema = ? ORDER BY sc.ord",
        )?
        .query_map([schema.rowid], |row| {
            Ok(SchemaClass {
                uid: row.get(0)?,
                is_direct: row.get(1)?,
            })
        })?
        .collect::<Result<_, _>>()?;

    Ok(SchemaInfo {
        rowid: schema.rowid,
        checksum: to_checksum(csum)?,
        hot_count,
        cold_count,
        shared_count,
        bare: bare.unwrap_or(schema.rowid),
        shared_data,
        fields,
        classes,
    })
}
