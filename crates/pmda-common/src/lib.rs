//! Shared plumbing for the pmda-load workspace.
//!
//! - **Logging**: tracing subscriber initialization shared by the CLI and tests
//! - **Checksums**: SHA-256 helpers used for cache keys and record provenance

pub mod checksum;
pub mod logging;
