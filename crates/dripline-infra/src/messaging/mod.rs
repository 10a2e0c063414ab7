//! Collaborator implementations over the network and the local store.
//!
//! - `gateway` -- the messaging provider HTTP gateway
//! - `http_caller` -- bounded-timeout executor for ExternalCall steps
//! - `segment` -- stored-segment evaluator over subject attributes

pub mod gateway;
pub mod http_caller;
pub mod segment;
