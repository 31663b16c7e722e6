//! Storage layer
//!
//! Everything that talks to SQLite directly.
//!
//! ## Architecture
//!
//! - **db**: one connection plus transaction depth and rollback bookkeeping
//! - **txn**: savepoint-based nested transactions
//! - **schema**: table layout and version tracking
//! - **error**: the crate-wide error type

pub mod db;
pub mod error;
pub mod schema;
pub mod txn;

pub use db::{CoherencyToken, Db};
pub use error::{StoreError, StoreResult};
pub use schema::{init_schema, needs_init, STORE_VERSION};
pub use txn::{with_transaction, TransactionNester};
