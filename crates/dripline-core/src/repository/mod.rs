//! Repository trait definitions ("ports").
//!
//! The infrastructure layer (dripline-infra) implements these traits with
//! SQLite persistence. Uses native async fn in traits (Rust 2024 edition,
//! no async_trait macro).

pub mod enrollment;
pub mod flow;
pub mod subject;
