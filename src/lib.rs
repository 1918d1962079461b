// ============================================================================
// rustingest library
// ============================================================================

pub mod batch;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod gateway;
pub mod monitor;
pub mod queue;
pub mod result;
pub mod sizing;
pub mod stats;

// Re-export main types for convenience
pub use batch::{Batch, CollectionBatch};
pub use config::{BatchConfig, BatchMode, MonitorPolicy, RetryPolicy};
pub use crate::core::{
    BatchError, ConsistencyLevel, ObjectInput, ObjectWrite, Operation, ReferenceInput,
    ReferenceTarget, ReferenceWrite, Result,
};
pub use gateway::{ClusterStatus, Gateway, InMemoryGateway, ItemErrors};
pub use result::{BatchFailure, BatchResult, BatchResults, FailureKind};
pub use sizing::{SizeController, SizingMode};
pub use stats::BatchStats;

use crate::dispatch::Dispatcher;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ============================================================================
// High-level Client API
// ============================================================================

/// Batch ingestion client
///
/// Wraps a [`Gateway`] and opens batch sessions that size, send and retry
/// writes on their own.
///
/// # Examples
///
/// ```
/// use rustingest::{BatchClient, BatchConfig, InMemoryGateway, ObjectInput};
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let gateway = InMemoryGateway::new();
/// let client = BatchClient::new(gateway.clone(), BatchConfig::fixed_size(100, 2))?;
///
/// let batch = client.batch().await?;
/// for i in 0..250 {
///     batch
///         .add_object(ObjectInput::new("Article").properties(json!({ "n": i })))
///         .await?;
/// }
/// let results = batch.finish().await?;
///
/// assert_eq!(results.object_uuids.len(), 250);
/// assert!(client.failed_objects().is_empty());
/// # Ok(())
/// # }
/// ```
pub struct BatchClient {
    gateway: Arc<dyn Gateway>,
    config: BatchConfig,
    last_results: Arc<Mutex<BatchResults>>,
}

impl BatchClient {
    /// Create a client; sessions opened with [`batch`](Self::batch) use `config`.
    pub fn new<G>(gateway: G, config: BatchConfig) -> Result<Self>
    where
        G: Gateway + 'static,
    {
        Self::with_shared_gateway(Arc::new(gateway), config)
    }

    pub fn with_shared_gateway(gateway: Arc<dyn Gateway>, config: BatchConfig) -> Result<Self> {
        config.validate().map_err(BatchError::Config)?;
        Ok(Self {
            gateway,
            config,
            last_results: Arc::new(Mutex::new(BatchResults::new())),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn lock_results(&self) -> MutexGuard<'_, BatchResults> {
        self.last_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session with the client's configuration.
    pub async fn batch(&self) -> Result<Batch> {
        self.open(self.config.clone())
    }

    /// Open a session with adaptive sizing.
    pub async fn dynamic(&self) -> Result<Batch> {
        self.open(self.config.clone().mode(BatchMode::Dynamic))
    }

    /// Open a session with constant batch size and concurrency.
    ///
    /// # Examples
    ///
    /// ```
    /// # use rustingest::{BatchClient, BatchConfig, InMemoryGateway, ObjectInput};
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let gateway = InMemoryGateway::new();
    /// let client = BatchClient::new(gateway.clone(), BatchConfig::default())?;
    ///
    /// let batch = client.fixed_size(50, 1).await?;
    /// for _ in 0..120 {
    ///     batch.add_object(ObjectInput::new("Article")).await?;
    /// }
    /// batch.finish().await?;
    ///
    /// assert_eq!(gateway.object_batch_sizes(), vec![50, 50, 20]);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn fixed_size(&self, batch_size: usize, concurrent_requests: usize) -> Result<Batch> {
        self.open(self.config.clone().mode(BatchMode::FixedSize {
            batch_size,
            concurrent_requests,
        }))
    }

    /// Open a session sending at most `requests_per_minute` objects a minute.
    pub async fn rate_limit(&self, requests_per_minute: usize) -> Result<Batch> {
        self.open(self.config.clone().mode(BatchMode::RateLimit {
            requests_per_minute,
        }))
    }

    fn open(&self, config: BatchConfig) -> Result<Batch> {
        let dispatcher = Dispatcher::new(Arc::clone(&self.gateway), config)?;
        *self.lock_results() = BatchResults::new();
        Ok(Batch::start(dispatcher, Arc::clone(&self.last_results)))
    }

    /// Results of the last finished session.
    pub fn results(&self) -> BatchResults {
        self.lock_results().clone()
    }

    /// Objects the last finished session could not write.
    pub fn failed_objects(&self) -> Vec<BatchFailure<ObjectWrite>> {
        self.lock_results().failed_objects.clone()
    }

    /// References the last finished session could not add.
    pub fn failed_references(&self) -> Vec<BatchFailure<ReferenceWrite>> {
        self.lock_results().failed_references.clone()
    }
}
