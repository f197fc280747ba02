//! vaultflow-core - batched, retrying, concurrency-bounded vault operations
//!
//! One engine serves every call site: tokenization, detokenization and the
//! fetch-then-delete bulk workflow.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  BulkDeleteController (fetch phase ─▶ delete phase, repeated)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  BatchEngine                                                    │
//! │  ├── split_into_batches   group by kind + destination, slice    │
//! │  ├── WorkerPool           N workers over a bounded queue        │
//! │  ├── Retrier              backoff, jitter, Retry-After          │
//! │  └── ResultCollector      write-once slot per index             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  VaultApi                                                       │
//! │  └── HttpVaultClient      reqwest pool + BufferPool + semaphore │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use vaultflow_core::{AppConfig, BatchEngine, Destination, EngineOptions, HttpVaultClient};
//!
//! let config = AppConfig::from_file("vaultflow.yaml")?;
//! let client = Arc::new(HttpVaultClient::from_app_config(&config)?);
//! let engine = BatchEngine::new(client, EngineOptions::from_config(&config.engine));
//!
//! let dest = Destination::new(&config.vault.vault_id, "persons", "email");
//! let report = engine.tokenize_values(emails, &dest, &cancel).await?;
//! for result in &report.results {
//!     println!("{}: {:?}", result.index, result.outcome);
//! }
//! ```

pub mod batch;
pub mod buffer_pool;
pub mod client;
pub mod collector;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod pool;
pub mod retry;
pub mod testing;
pub mod types;

pub use batch::{split_into_batches, Batch, BatchKey};
pub use client::{ClientConfig, HttpVaultClient, VaultApi};
pub use collector::{ResultCollector, RunStatsSnapshot};
pub use config::AppConfig;
pub use controller::{BulkDeleteController, BulkDeleteOptions, DrainState, ResourceReport};
pub use engine::{BatchEngine, EngineOptions, RunReport};
pub use error::{ErrorKind, ItemError, Result, VaultError};
pub use pool::{PoolConfig, WorkerPool};
pub use retry::{Retrier, RetryConfig};
pub use types::{
    Destination, Operation, OperationKind, OperationResult, OperationValue, Payload,
    RecordOutcome, SensitiveString,
};
