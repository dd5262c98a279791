//! Domain types
//!
//! This module contains the core value types for docsync:
//! - Newtypes for validated paths, identifiers and checksums
//! - Sync items correlating a local and a remote path
//! - Change-store records and retry bookkeeping
//! - The closed remote object model
//! - Domain-specific error types

pub mod errors;
pub mod newtypes;
pub mod record;
pub mod remote;
pub mod sync_item;

// Re-export commonly used types
pub use errors::DomainError;
pub use newtypes::*;
pub use record::{ChangeRecord, OperationKind, RecordUpdate};
pub use remote::{
    ChangeSet, DocumentMetadata, RemoteCapabilities, RemoteChange, RemoteChangeKind,
    RemoteDescendant, RemoteEntry, RemoteKind,
};
pub use sync_item::{FolderRoots, PartialItem, PathOrigin, SyncItem};
