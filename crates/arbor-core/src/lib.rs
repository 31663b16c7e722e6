//! Arbor Core Library
//!
//! This crate provides the storage core for Arbor, a local-first store of
//! tree-shaped items whose fields are described by reusable classes.
//!
//! # Architecture
//!
//! - **SQLite**: Items, classes, compiled schemas and interned values
//! - **Field blobs**: Each item's values are packed into a hot blob (read
//!   often) and an optional cold blob (opened lazily)
//! - **Schemas**: Immutable, checksummed layouts compiled from class lists
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open(Config::load()?)?;
//!
//! let mut note = Class::named("Note");
//! note.add_field("title", StoreType::Hot).add_field("body", StoreType::Cold);
//! store.put_class(&mut note)?;
//!
//! let item = store.create_item(None, 0, &[note.uid])?;
//! store.set_fields(item.uid, &[("title", FieldValue::text("Hello"))])?;
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point)
//! - `models`: Classes, field definitions, items
//! - `codec`: Varints and the packed field blob format
//! - `reader`: Streaming field readers over hot and cold blobs
//! - `schema`: Compiling class lists into committed schemas
//! - `names`: Name ⇄ id registry with LRU caches
//! - `cache`: Size-bounded LRU cache
//! - `pool`: Bounded object pool and SQLite connection pool
//! - `dispose`: Lock-free dispose coordination
//! - `storage`: SQLite connection, layout, errors and nested transactions
//! - `config`: Store configuration

pub mod cache;
pub mod classes;
pub mod codec;
pub mod config;
pub mod dispose;
pub mod models;
pub mod modstamp;
pub mod names;
pub mod pool;
pub mod reader;
pub mod schema;
pub mod storage;
pub mod store;
pub mod uid;

pub use cache::{CacheStats, IdentifierCache};
pub use codec::FieldValue;
pub use config::Config;
pub use dispose::{DisposeCoordinator, DisposeState};
pub use models::{Class, FieldDef, FieldIndex, Item, SchemaRef, StoreType};
pub use modstamp::{Modstamp, ModstampClock};
pub use names::NameRegistry;
pub use pool::{BoundedPool, ConnectionPool, PooledDb};
pub use reader::{BlobFieldsReader, FieldsReader, HotColdFieldsReader, ReaderState};
pub use schema::{CompiledSchema, SchemaCompiler, SchemaInfo};
pub use storage::{Db, StoreError, StoreResult, TransactionNester};
pub use store::Store;
pub use uid::Uid;
