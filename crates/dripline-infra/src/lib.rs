//! Infrastructure implementations for Dripline.
//!
//! - `sqlite` -- sqlx-backed repositories over a split reader/writer pool
//! - `messaging` -- reqwest-backed collaborators: the messaging provider
//!   gateway, the ExternalCall HTTP executor, and the stored-segment
//!   evaluator

pub mod messaging;
pub mod sqlite;
