//! Binary encodings
//!
//! - `varint`: LEB128 varints and fixed-width big-endian integers
//! - `fields`: the field-list blob layout used for hot, cold and shared data

pub mod fields;
pub mod varint;

pub use fields::{decode, decode_all, encode, encode_with_modstamps, FieldValue};
