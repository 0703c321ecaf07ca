//! PGCR Common Library
//!
//! Shared utilities for the PGCR dataset workspace.
//!
//! - **Logging**: `tracing` subscriber bootstrap shared by every binary
//! - **Compression**: gzip helpers for the blobs stored in the database
//! - **Errors**: the error type returned by the helpers above
//!
//! # Example
//!
//! ```no_run
//! use pgcr_common::compression::{gzip, gunzip};
//!
//! fn roundtrip(doc: &[u8]) -> pgcr_common::Result<()> {
//!     let blob = gzip(doc)?;
//!     assert_eq!(gunzip(&blob)?, doc);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod compression;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
