//! docsync Conflict - Divergence detection and keep-both resolution
//!
//! Provides:
//! - Classification of a tracked item as in sync, changed on one side,
//!   or changed on both sides
//! - Deterministic, collision-free conflict-copy names
//! - User-visible notices for conflicts and checked-out documents
//!
//! Resolution never discards data: the local version is renamed and the
//! remote version keeps the original name.

pub mod detector;
pub mod error;
pub mod namer;
pub mod notice;

pub use detector::{ConflictDetector, Divergence};
pub use error::ConflictError;
pub use namer::ConflictNamer;
pub use notice::{checked_out_notice, conflict_notice};
