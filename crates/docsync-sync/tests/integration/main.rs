//! Integration tests for docsync-sync
//!
//! Runs the engines against an in-memory remote repository, a temporary
//! local root and an in-memory SQLite change store, and checks the
//! resulting trees, records and remote call counts.

mod common;

mod test_crawl;
mod test_orchestrator;
