//! PGCR Ingest Library
//!
//! Loads a directory tree of compressed, line-delimited PGCR dumps into
//! PostgreSQL under batched transactions, reporting per-file progress as it
//! goes.
//!
//! # Stages
//!
//! - [`discovery`]: walk the input tree and build the [`FileRegistry`]
//! - [`ingest`]: decompress each file and push its lines onto the work queue
//! - [`worker`]: decode and serialize records, then hand them on
//! - [`transaction`]: commit every `batch_size` records, roll back on cancel
//! - [`progress`]: per-file progress channels and observers
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pgcr_ingest::{discover, LogObserver, MemorySink, Pipeline, PipelineSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(discover(Path::new("./data"), ".zst")?);
//!     let pipeline = Pipeline::new(MemorySink::new(), PipelineSettings::default());
//!     let summary = pipeline
//!         .run(registry, Arc::new(LogObserver::default()), &CancellationToken::new())
//!         .await?;
//!     println!("{} records persisted", summary.records_persisted);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod console;
pub mod discovery;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod record;
pub mod registry;
pub mod store;
pub mod transaction;
pub mod worker;

pub use config::{ConfigOverrides, DatasourceConfig, IngestConfig};
pub use console::ConsoleObserver;
pub use discovery::discover;
pub use error::{IngestError, Result};
pub use pipeline::{Pipeline, PipelineSettings, RunSummary};
pub use progress::{LogObserver, NoopObserver, ProgressObserver};
pub use reader::InputCompression;
pub use record::{PersistRequest, PgcrCodec, Record, RecordCodec};
pub use registry::{FileEntry, FileId, FileRegistry};
pub use store::{MemorySink, PgSink, TransactionSink};
pub use transaction::{BatchStatsSnapshot, TransactionManager};
pub use worker::DecodePolicy;
