//! Pure planning functions (spec §4.5): no I/O, no store access, just
//! `(token, definitions, snapshot, counts) -> (Decision[], WorkflowEventKind[])`.
//! This is the layer exercised directly by the test suite, independent of
//! any `RunStore` implementation.

pub mod condition;
pub mod lifecycle;
pub mod routing;
pub mod sync;
