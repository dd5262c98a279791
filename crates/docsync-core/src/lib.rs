//! docsync Core - Domain types and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain types** - `SyncItem`, `PartialItem`, `ChangeRecord`, `RemoteEntry`
//!   and the validated newtypes they are built from
//! - **Port definitions** - Traits for adapters: `IRemoteRepository`,
//!   `IRemoteConnector`, `IChangeStore`, `INotificationService`
//! - **Configuration** - YAML configuration with one `RepoInfo` per folder pair
//!
//! # Architecture
//!
//! The domain module contains pure value types with no I/O.
//! Ports define trait interfaces that adapter crates implement; the
//! synchronization engine in `docsync-sync` drives them.

pub mod config;
pub mod domain;
pub mod ports;
