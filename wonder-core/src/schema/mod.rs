//! Schema manager: JSONSchema -> DDL/DML + validator (spec §4.1).

pub mod ddl;
pub mod dml;
pub mod ir;
pub mod path;
pub mod validate;

pub use ir::SchemaNode;
