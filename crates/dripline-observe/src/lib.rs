//! Observability for Dripline: tracing subscriber setup and the shared
//! span-field vocabulary.

pub mod fields;
pub mod tracing_setup;
