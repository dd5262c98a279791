//! docsync Mirror - Directory-backed remote repository
//!
//! Implements the [`IRemoteRepository`] and [`IRemoteConnector`] ports on
//! top of a plain directory, so a mounted share (SMB, NFS, WebDAV via davfs)
//! can act as the remote side of a folder pair.
//!
//! [`IRemoteRepository`]: docsync_core::ports::IRemoteRepository
//! [`IRemoteConnector`]: docsync_core::ports::IRemoteConnector

pub mod connector;
pub mod error;
pub mod repository;

pub use connector::MirrorConnector;
pub use error::MirrorError;
pub use repository::MirrorRepository;
