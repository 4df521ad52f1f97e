//! Append-only persistence for the run audit trail.

mod error;
pub mod events;

pub use error::ArtifactError;
pub use events::{AuditReader, AuditRecord, AuditWriter};
