//! Service layer over the repository traits.
//!
//! Thin orchestration consumed by the REST API: flow lifecycle (save,
//! activate, archive, delete) and enrollment administration (manual enroll,
//! bulk enroll, pause/resume/remove, status reads).

pub mod enrollment;
pub mod flow;
