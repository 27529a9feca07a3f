//! Botica vault library
//!
//! Keeps pharmacy sales exports sealed at rest (AES-256-GCM) and runs them
//! through an extract/transform/aggregate pipeline whose plaintext exists
//! only in memory, for one dataset at a time, for the duration of its run.

pub mod config;
pub mod error;
pub mod metrics;

// Encrypted data lifecycle
pub mod buffer;
pub mod cipher;
pub mod key_provider;
pub mod store;

// Processing pipeline
pub mod aggregate;
pub mod extract;
pub mod model;
pub mod pipeline;
pub mod transform;

// Re-export commonly used types
pub use aggregate::{AggregateResult, Aggregator, Period, Rollup};
pub use buffer::UnsealedBuffer;
pub use cipher::{CipherEngine, SealedRecord};
pub use config::VaultConfig;
pub use error::{FailureReason, Result, VaultError};
pub use extract::{Delimiter, Extractor, RecordStream};
pub use key_provider::{EncryptionKey, KeyProvider, KeySource};
pub use metrics::MetricsCollector;
pub use pipeline::{BatchOutcome, DatasetOutcome, DatasetState, PipelineOrchestrator, ProcessingReport};
pub use store::SealedStore;
pub use transform::Transformer;
