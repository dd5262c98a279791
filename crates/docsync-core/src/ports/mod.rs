//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the engine depends on,
//! but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteRepository`] - Session against a remote document repository
//! - [`IRemoteConnector`] - Opens remote sessions
//! - [`IChangeStore`] - Persisted last-synchronized state of a folder pair
//! - [`INotificationService`] - User-visible notices

pub mod change_store;
pub mod notification;
pub mod remote_repository;

pub use change_store::IChangeStore;
pub use notification::{INotificationService, LogNotifier, NoticeKind, Notification};
pub use remote_repository::{ContentStream, IRemoteConnector, IRemoteRepository, RemoteError};
