//! Data models for Arbor
//!
//! Defines classes, their field definitions, and items. Checksums are
//! SHA-256 over a fixed binary rendering so they are stable across runs
//! and machines.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::fields::{self, FieldValue};
use crate::modstamp::Modstamp;
use crate::uid::Uid;

/// SHA-256 digest
pub type Checksum = [u8; 32];

/// Where a field's value is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreType {
    /// One value per schema, kept in the schema row
    Shared = 0,
    /// Inline in the item row
    Hot = 1,
    /// In the item's overflow row
    Cold = 2,
}

impl StoreType {
    pub const ALL: [StoreType; 3] = [StoreType::Shared, StoreType::Hot, StoreType::Cold];

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StoreType::Shared),
            1 => Some(StoreType::Hot),
            2 => Some(StoreType::Cold),
            _ => None,
        }
    }
}

/// Packed `(position << 2) | store type` index of a field within a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldIndex(u32);

impl FieldIndex {
    pub const fn new(store_type: StoreType, position: u32) -> Self {
        Self((position << 2) | store_type as u32)
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        StoreType::from_code((raw & 0x3) as u8).map(|_| Self(raw))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn store_type(self) -> StoreType {
        match self.0 & 0x3 {
            0 => StoreType::Shared,
            1 => StoreType::Hot,
            _ => StoreType::Cold,
        }
    }

    pub const fn position(self) -> u32 {
        self.0 >> 2
    }
}

/// A named field declared by a class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub store_type: StoreType,
    /// Value every item of the schema sees (shared fields only)
    #[serde(skip)]
    pub shared_value: Option<FieldValue>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, store_type: StoreType) -> Self {
        Self {
            name: name.into(),
            store_type,
            shared_value: None,
        }
    }

    pub fn shared(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            store_type: StoreType::Shared,
            shared_value: Some(value),
        }
    }

    /// Checksum over name, store type and shared value
    pub fn checksum(&self) -> Checksum {
        let mut hasher = Sha256::new();
        hasher.update((self.name.len() as u64).to_be_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update([self.store_type.code()]);
        match &self.shared_value {
            Some(value) if !value.is_null() => {
                let encoded = fields::encode(std::slice::from_ref(value));
                hasher.update([1]);
                hasher.update((encoded.len() as u64).to_be_bytes());
                hasher.update(&encoded);
            }
            _ => hasher.update([0]),
        }
        hasher.finalize().into()
    }
}

/// A reusable, versioned description of a set of fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub uid: Uid,
    pub name: Option<String>,
    /// Sibling order among classes
    pub ordinal: i64,
    /// Item that manages this class, if any
    pub manager: Option<Uid>,
    pub fields: Vec<FieldDef>,
    /// Uids of included classes, in order
    pub includes: Vec<Uid>,
    pub modstamp: Modstamp,
    #[serde(skip)]
    pub checksum: Checksum,
    pub is_deleted: bool,
}

impl Class {
    /// Create an empty class with a fresh uid
    pub fn new() -> Self {
        Self::with_uid(Uid::new())
    }

    /// Create an empty class with a specific uid (for loading from storage)
    pub fn with_uid(uid: Uid) -> Self {
        let mut class = Self {
            uid,
            name: None,
            ordinal: 0,
            manager: None,
            fields: Vec::new(),
            includes: Vec::new(),
            modstamp: 0,
            checksum: [0; 32],
            is_deleted: false,
        };
        class.checksum = class.compute_checksum();
        class
    }

    /// Create a named class
    pub fn named(name: impl Into<String>) -> Self {
        let mut class = Self::new();
        class.name = Some(name.into());
        class
    }

    /// Declare a field; a redeclared name replaces the earlier definition
    pub fn add_field(&mut self, name: impl Into<String>, store_type: StoreType) -> &mut Self {
        self.put_field(FieldDef::new(name, store_type))
    }

    /// Declare a shared field carrying `value`
    pub fn add_shared_field(&mut self, name: impl Into<String>, value: FieldValue) -> &mut Self {
        self.put_field(FieldDef::shared(name, value))
    }

    fn put_field(&mut self, def: FieldDef) -> &mut Self {
        match self.fields.iter_mut().find(|f| f.name == def.name) {
            Some(existing) => *existing = def,
            None => self.fields.push(def),
        }
        self.checksum = self.compute_checksum();
        self
    }

    /// Remove a field
    pub fn remove_field(&mut self, name: &str) -> &mut Self {
        self.fields.retain(|f| f.name != name);
        self.checksum = self.compute_checksum();
        self
    }

    /// Include another class's fields
    pub fn include(&mut self, uid: Uid) -> &mut Self {
        if !self.includes.contains(&uid) && uid != self.uid {
            self.includes.push(uid);
            self.checksum = self.compute_checksum();
        }
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checksum over field definitions and included uids
    ///
    /// Name, ordinal, manager and modstamp are deliberately excluded.
    pub fn compute_checksum(&self) -> Checksum {
        let mut hasher = Sha256::new();
        hasher.update((self.fields.len() as u64).to_be_bytes());
        for field in &self.fields {
            hasher.update(field.checksum());
        }
        hasher.update((self.includes.len() as u64).to_be_bytes());
        for uid in &self.includes {
            hasher.update(uid.to_bytes());
        }
        hasher.finalize().into()
    }
}

impl Default for Class {
    fn default() -> Self {
        Self::new()
    }
}

/// A committed schema, as referenced by items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaRef {
    pub rowid: i64,
}

/// A tree node carrying field values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub uid: Uid,
    pub parent: Option<Uid>,
    /// Sibling order under the parent
    pub ordinal: i64,
    pub schema: SchemaRef,
    /// Last change to parent/ordinal
    pub ord_modstamp: Modstamp,
    /// Last change to field data or schema
    pub data_modstamp: Modstamp,
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_index_packing() {
        let index = FieldIndex::new(StoreType::Cold, 5);
        assert_eq!(index.raw(), (5 << 2) | 2);
        assert_eq!(index.store_type(), StoreType::Cold);
        assert_eq!(index.position(), 5);
        assert_eq!(FieldIndex::from_raw(index.raw()), Some(index));
        assert_eq!(FieldIndex::from_raw(3), None);
    }

    #[test]
    fn test_store_type_codes() {
        for store_type in StoreType::ALL {
            assert_eq!(StoreType::from_code(store_type.code()), Some(store_type));
        }
        assert_eq!(StoreType::from_code(3), None);
    }

    #[test]
    fn test_class_checksum_ignores_metadata() {
        let mut a = Class::named("Task");
        a.add_field("title", StoreType::Hot);
        let mut b = Class::named("Renamed");
        b.add_field("title", StoreType::Hot);
        b.ordinal = 9;
        b.modstamp = 1234;

        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_class_checksum_tracks_fields_and_includes() {
        let mut class = Class::named("Task");
        let empty = class.checksum;

        class.add_field("title", StoreType::Hot);
        let with_title = class.checksum;
        assert_ne!(empty, with_title);

        class.add_field("title", StoreType::Cold);
        assert_ne!(class.checksum, with_title);

        let cold_title = class.checksum;
        class.include(Uid::from_u128(7));
        assert_ne!(class.checksum, cold_title);

        class.include(Uid::from_u128(7));
        assert_eq!(class.includes.len(), 1);
    }

    #[test]
    fn test_redeclared_field_replaces() {
        let mut class = Class::new();
        class.add_field("title", StoreType::Hot);
        class.add_shared_field("title", FieldValue::text("x"));
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.field("title").unwrap().store_type, StoreType::Shared);
    }

    #[test]
    fn test_field_checksum_covers_shared_value() {
        let a = FieldDef::shared("kind", FieldValue::text("a"));
        let b = FieldDef::shared("kind", FieldValue::text("b"));
        let none = FieldDef::new("kind", StoreType::Shared);
        assert_ne!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), none.checksum());
    }

    #[test]
    fn test_class_serialization() {
        let mut class = Class::named("Note");
        class.add_field("body", StoreType::Cold);
        let json = serde_json::to_string(&class).unwrap();
        let mut back: Class = serde_json::from_str(&json).unwrap();
        back.checksum = back.compute_checksum();
        assert_eq!(class, back);
    }
}
