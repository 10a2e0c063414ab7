//! Shared domain types for Dripline.
//!
//! This crate contains the core domain types used across the Dripline
//! engine: flow definitions and their two encodings, enrollments and their
//! event trail, subjects and engagement records, and the shared error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod enrollment;
pub mod error;
pub mod flow;
pub mod subject;
