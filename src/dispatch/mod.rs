//! Turns queued operations into gateway calls.

use crate::config::{BatchConfig, BatchMode};
use crate::core::{BatchError, BatchItem, ConsistencyLevel, ObjectWrite, ReferenceWrite, Result};
use crate::gateway::{Gateway, ItemErrors};
use crate::monitor::{CongestionMonitor, MonitorState};
use crate::queue::{BatchQueue, OperationQueue, Pending};
use crate::result::{BatchFailure, BatchResult, BatchResults};
use crate::sizing::{BatchCategory, RESUME_BATCH_SIZE, SizeController};
use crate::stats::{BatchCounters, BatchStats};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

mod pool;
mod rate_limit;
mod retry;

pub use pool::{PoolState, WorkerPool};
pub use rate_limit::{RATE_WINDOW, RateWindow};
pub use retry::{RequeueOutcome, RetryReinjector};

/// Everything a flush task needs once it leaves the dispatcher.
struct DispatchContext {
    gateway: Arc<dyn Gateway>,
    queue: Arc<OperationQueue>,
    sizes: Arc<SizeController>,
    reinjector: RetryReinjector,
    results: Mutex<BatchResults>,
    counters: Arc<BatchCounters>,
    consistency: Option<ConsistencyLevel>,
}

impl DispatchContext {
    fn lock_results(&self) -> MutexGuard<'_, BatchResults> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed a finished call to sizing, counters and the reinjector. Returns
    /// the failures that will not be retried.
    fn settle<T: BatchItem>(
        &self,
        category: BatchCategory,
        result: &BatchResult<T>,
        queue: &BatchQueue<T>,
    ) -> Vec<BatchFailure<T>> {
        self.sizes.record_result(category, result);
        self.counters.record_batch(category, result);

        if !result.has_errors() {
            return Vec::new();
        }
        let outcome = self.reinjector.requeue(result, queue);
        self.counters
            .record_requeue(outcome.requeued, outcome.abandoned.len());
        if !outcome.abandoned.is_empty() {
            event!(
                Level::WARN,
                kind = T::KIND,
                abandoned = outcome.abandoned.len(),
                "failed items will not be retried"
            );
        }
        outcome.abandoned
    }
}

fn to_result<T: BatchItem>(
    batch: &[Pending<T>],
    sent: Result<ItemErrors>,
    elapsed: Duration,
) -> BatchResult<T> {
    match sent {
        Ok(errors) => {
            if errors.is_empty() {
                event!(Level::DEBUG, elapsed_ms = elapsed.as_millis() as u64, "batch sent");
            } else {
                event!(Level::WARN, rejected = errors.len(), "batch partially rejected");
            }
            BatchResult::from_item_errors(batch, errors, elapsed)
        }
        Err(err) => {
            event!(Level::WARN, error = %err, "batch send failed");
            BatchResult::from_transport_error(batch, &err, elapsed)
        }
    }
}

async fn send_object_batch(context: Arc<DispatchContext>, batch: Vec<Pending<ObjectWrite>>) {
    let writes: Vec<ObjectWrite> = batch.iter().map(|p| p.operation.clone()).collect();
    let started = Instant::now();
    let sent = context.gateway.send_objects(&writes, context.consistency).await;
    let result = to_result(&batch, sent, started.elapsed());

    let abandoned = context.settle(BatchCategory::Objects, &result, &context.queue.objects);
    context.lock_results().record_objects(&result, abandoned);
}

async fn send_reference_batch(context: Arc<DispatchContext>, batch: Vec<Pending<ReferenceWrite>>) {
    let writes: Vec<ReferenceWrite> = batch.iter().map(|p| p.operation.clone()).collect();
    let started = Instant::now();
    let sent = context
        .gateway
        .send_references(&writes, context.consistency)
        .await;
    let result = to_result(&batch, sent, started.elapsed());

    let abandoned =
        context.settle(BatchCategory::References, &result, &context.queue.references);
    context.lock_results().record_references(&result, abandoned);
}

/// Split `items` into consecutive chunks of at most `size`, keeping order.
pub fn into_chunks<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    while items.len() > size {
        let rest = items.split_off(size);
        chunks.push(std::mem::replace(&mut items, rest));
    }
    if !items.is_empty() {
        chunks.push(items);
    }
    chunks
}

/// Chunk size for a drained snapshot. A size stopped at zero by backpressure
/// still sends forced work in resume-sized batches.
fn send_size(recommended: usize) -> usize {
    if recommended == 0 {
        RESUME_BATCH_SIZE
    } else {
        recommended
    }
}

/// Drains the operation queue into sized batches and runs them on a bounded
/// worker pool.
pub struct Dispatcher {
    context: Arc<DispatchContext>,
    pool: WorkerPool,
    config: BatchConfig,
    rate_window: Option<Mutex<RateWindow>>,
    monitor: Mutex<Option<CongestionMonitor>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.config.mode)
            .field("pool", &self.pool)
            .field("sizes", &self.context.sizes)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn Gateway>, config: BatchConfig) -> Result<Self> {
        config.validate().map_err(BatchError::Config)?;

        let rate_window = match &config.mode {
            BatchMode::RateLimit {
                requests_per_minute,
            } => Some(Mutex::new(RateWindow::per_minute(*requests_per_minute))),
            _ => None,
        };

        let context = DispatchContext {
            gateway,
            queue: Arc::new(OperationQueue::new()),
            sizes: Arc::new(SizeController::from_config(&config)),
            reinjector: RetryReinjector::new(config.retry.clone()),
            results: Mutex::new(BatchResults::new()),
            counters: Arc::new(BatchCounters::new()),
            consistency: config.consistency_level,
        };

        Ok(Self {
            context: Arc::new(context),
            pool: WorkerPool::new(config.effective_concurrency()),
            config,
            rate_window,
            monitor: Mutex::new(None),
        })
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.context.queue
    }

    pub fn sizes(&self) -> &Arc<SizeController> {
        &self.context.sizes
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn pool_state(&self) -> PoolState {
        self.pool.state()
    }

    pub fn stats(&self) -> BatchStats {
        self.context.counters.snapshot(&self.context.sizes)
    }

    /// Copy of the results collected so far.
    pub fn results(&self) -> BatchResults {
        self.context.lock_results().clone()
    }

    /// Hand out the collected results, stamped as finished, and start over.
    pub fn take_results(&self) -> BatchResults {
        let mut results = std::mem::take(&mut *self.context.lock_results());
        results.finish();
        results
    }

    fn lock_monitor(&self) -> MutexGuard<'_, Option<CongestionMonitor>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.lock_monitor()
            .as_ref()
            .map_or(MonitorState::Stopped, CongestionMonitor::state)
    }

    /// Start the congestion monitor in dynamic mode. The worker pool starts
    /// with the first submitted batch.
    pub fn start(&self) {
        if self.config.mode != BatchMode::Dynamic {
            return;
        }

        let mut monitor = self.lock_monitor();
        if monitor.is_none() {
            *monitor = Some(CongestionMonitor::spawn(
                Arc::clone(&self.context.gateway),
                Arc::clone(&self.context.sizes),
                Arc::clone(&self.context.counters),
                self.config.monitor.clone(),
                self.config.effective_concurrency(),
            ));
        }
    }

    /// Signal the monitor without waiting for it.
    pub fn stop_monitor(&self) {
        // Dropping the handle fires the stop signal.
        drop(self.lock_monitor().take());
    }

    /// Stop the monitor, then wait for in-flight batches.
    pub async fn shutdown(&self) -> Result<()> {
        let monitor = self.lock_monitor().take();
        if let Some(monitor) = monitor {
            monitor.stop().await?;
        }
        self.pool.shutdown().await
    }

    /// Send queued work if a recommended size was reached, or unconditionally
    /// when `force_wait` is set.
    ///
    /// Without `force_wait` this returns as soon as the pool has a free slot;
    /// otherwise it waits for every in-flight batch.
    pub async fn try_flush(&self, force_wait: bool) -> Result<()> {
        let queue = &self.context.queue;
        let (object_size, reference_size) = self.context.sizes.sizes();
        if !force_wait && !queue.reached(object_size, reference_size) {
            return Ok(());
        }

        if !force_wait {
            self.wait_while_overloaded().await;
        }

        let (object_size, reference_size) = self.context.sizes.sizes();
        let (object_size, reference_size) = (send_size(object_size), send_size(reference_size));
        let objects = queue.objects.drain();
        let references = queue.references.drain();

        if !objects.is_empty() || !references.is_empty() {
            self.context.counters.record_flush();
            let span = info_span!(
                "batch.flush",
                force_wait,
                objects = objects.len(),
                references = references.len(),
                object_batch_size = object_size,
                reference_batch_size = reference_size
            );
            self.submit_all(objects, references, object_size, reference_size)
                .instrument(span)
                .await;
        }

        if !force_wait && self.pool.inflight() < self.pool.capacity() {
            return Ok(());
        }
        self.pool.join_all().await
    }

    /// Force flush passes until nothing is queued, backing off between passes
    /// that left requeued work behind.
    pub async fn flush(&self) -> Result<()> {
        let mut pass = 0u32;
        loop {
            self.try_flush(true).await?;
            if self.context.queue.is_empty() {
                return Ok(());
            }

            pass = pass.saturating_add(1);
            let backoff_ms = self.config.retry.backoff_ms(pass);
            event!(
                Level::DEBUG,
                pass,
                backoff_ms,
                pending_objects = self.context.queue.objects.len(),
                pending_references = self.context.queue.references.len(),
                "work left after forced flush"
            );
            sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    async fn submit_all(
        &self,
        objects: Vec<Pending<ObjectWrite>>,
        references: Vec<Pending<ReferenceWrite>>,
        object_size: usize,
        reference_size: usize,
    ) {
        for chunk in into_chunks(objects, object_size) {
            self.wait_for_rate_budget(chunk.len()).await;
            let span = info_span!("batch.send", kind = ObjectWrite::KIND, size = chunk.len());
            self.pool.submit(
                send_object_batch(Arc::clone(&self.context), chunk).instrument(span),
            );
        }
        for chunk in into_chunks(references, reference_size) {
            let span =
                info_span!("batch.send", kind = ReferenceWrite::KIND, size = chunk.len());
            self.pool.submit(
                send_reference_batch(Arc::clone(&self.context), chunk).instrument(span),
            );
        }
    }

    async fn wait_while_overloaded(&self) {
        let mut warned = false;
        while self.context.sizes.is_overloaded() {
            if !warned {
                log::warn!(
                    "Server batch queue is overloaded; pausing producers for {:?} at a time",
                    self.config.overload_sleep_duration()
                );
                warned = true;
            }
            self.context.counters.record_backpressure_wait();
            sleep(self.config.overload_sleep_duration()).await;
        }
    }

    async fn wait_for_rate_budget(&self, count: usize) {
        let Some(window) = &self.rate_window else {
            return;
        };
        loop {
            let wait = window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reserve(Instant::now(), count);
            match wait {
                None => return,
                Some(wait) => {
                    event!(Level::DEBUG, wait_ms = wait.as_millis() as u64, "rate limit reached");
                    sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ObjectInput, Operation, ReferenceInput};
    use crate::gateway::{ClusterStatus, InMemoryGateway};
    use serde_json::json;

    fn object(n: usize) -> Operation {
        ObjectInput::new("Article")
            .properties(json!({ "n": n }))
            .into_write()
            .unwrap()
            .into()
    }

    fn dispatcher(gateway: &InMemoryGateway, config: BatchConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(gateway.clone()), config).unwrap()
    }

    #[test]
    fn chunks_keep_order_and_bound() {
        let chunks = into_chunks((0..7).collect(), 3);
        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert_eq!(into_chunks(vec![1, 2], 0), vec![vec![1], vec![2]]);
        assert!(into_chunks(Vec::<u8>::new(), 5).is_empty());
    }

    #[tokio::test]
    async fn below_threshold_is_a_noop() {
        let gateway = InMemoryGateway::new();
        let dispatcher = dispatcher(&gateway, BatchConfig::fixed_size(10, 1));
        for n in 0..9 {
            dispatcher.queue().push(object(n));
        }

        dispatcher.try_flush(false).await.unwrap();

        assert_eq!(dispatcher.queue().objects.len(), 9);
        assert!(gateway.object_batch_sizes().is_empty());
        assert_eq!(dispatcher.pool_state(), PoolState::Idle);
    }

    #[tokio::test]
    async fn forced_flush_chunks_by_recommended_size() {
        let gateway = InMemoryGateway::new();
        let dispatcher = dispatcher(&gateway, BatchConfig::fixed_size(50, 1));
        for n in 0..120 {
            dispatcher.queue().push(object(n));
        }

        dispatcher.try_flush(true).await.unwrap();

        assert_eq!(gateway.object_batch_sizes(), vec![50, 50, 20]);
        assert!(dispatcher.queue().is_empty());
        assert_eq!(dispatcher.results().object_uuids.len(), 120);
    }

    #[tokio::test]
    async fn partial_failure_requeues_only_failed_items() {
        let gateway = InMemoryGateway::new();
        gateway.reject_objects_where(|object| {
            (object.properties["n"].as_u64().unwrap_or(0) % 2 == 0)
                .then(|| "shard busy".to_string())
        });
        let config = BatchConfig::fixed_size(10, 1).retry_application_errors(true);
        let dispatcher = dispatcher(&gateway, config);
        for n in 0..6 {
            dispatcher.queue().push(object(n));
        }

        dispatcher.try_flush(true).await.unwrap();

        let requeued = dispatcher.queue().objects.drain();
        assert_eq!(requeued.len(), 3);
        assert!(requeued.iter().all(|p| p.attempt == 1));
        let numbers: Vec<u64> = requeued
            .iter()
            .map(|p| p.operation.properties["n"].as_u64().unwrap())
            .collect();
        assert_eq!(numbers, vec![0, 2, 4]);
        assert_eq!(gateway.object_count(), 3);
        assert_eq!(dispatcher.stats().requeued, 3);
    }

    #[tokio::test]
    async fn flush_gives_up_after_max_attempts() {
        let gateway = InMemoryGateway::new();
        gateway.fail_all_sends("connection refused");
        let mut config = BatchConfig::fixed_size(5, 1).max_attempts(3);
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        let dispatcher = dispatcher(&gateway, config);
        for n in 0..5 {
            dispatcher.queue().push(object(n));
        }

        dispatcher.flush().await.unwrap();

        assert!(dispatcher.queue().is_empty());
        assert_eq!(gateway.object_batch_sizes(), vec![5, 5, 5]);
        let results = dispatcher.take_results();
        assert_eq!(results.failed_objects.len(), 5);
        assert!(results.failed_objects.iter().all(|f| f.attempt == 2));
        assert!(results.finished_at.is_some());
    }

    #[tokio::test]
    async fn objects_and_references_flush_independently() {
        let gateway = InMemoryGateway::new();
        let dispatcher = dispatcher(&gateway, BatchConfig::fixed_size(2, 2));
        let source = ObjectInput::new("Article").into_write().unwrap();
        let reference = ReferenceInput::new("Article", source.uuid, "cites", source.uuid)
            .into_write()
            .unwrap();
        dispatcher.queue().push(source.into());
        dispatcher.queue().push(reference.clone().into());
        dispatcher.queue().push(reference.into());

        // references reached their size; objects ride along
        dispatcher.try_flush(false).await.unwrap();
        dispatcher.try_flush(true).await.unwrap();

        assert_eq!(gateway.object_batch_sizes(), vec![1]);
        assert_eq!(gateway.reference_batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn threshold_flush_waits_out_overload() {
        let gateway = InMemoryGateway::new();
        let config = BatchConfig::dynamic()
            .initial_batch_size(1)
            .overload_sleep(Duration::from_millis(5));
        let dispatcher = dispatcher(&gateway, config);
        dispatcher.sizes().apply_cluster_status(
            &ClusterStatus {
                queue_length: 10_000,
                rate_per_second: 1.0,
                worker_count: 1,
            },
            1,
        );
        assert!(dispatcher.sizes().is_overloaded());

        let sizes = Arc::clone(dispatcher.sizes());
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            sizes.release_backpressure();
        });

        dispatcher.queue().push(object(0));
        dispatcher.try_flush(false).await.unwrap();
        dispatcher.try_flush(true).await.unwrap();

        assert!(dispatcher.stats().backpressure_waits > 0);
        assert_eq!(gateway.object_count(), 1);
    }

    #[tokio::test]
    async fn forced_flush_while_overloaded_sends_resume_sized_batches() {
        let gateway = InMemoryGateway::new();
        let dispatcher = dispatcher(&gateway, BatchConfig::dynamic().initial_batch_size(50));
        dispatcher.sizes().apply_cluster_status(
            &ClusterStatus {
                queue_length: 10_000,
                rate_per_second: 1.0,
                worker_count: 1,
            },
            1,
        );
        assert_eq!(dispatcher.sizes().object_batch_size(), 0);
        for n in 0..30 {
            dispatcher.queue().push(object(n));
        }

        dispatcher.try_flush(true).await.unwrap();

        assert_eq!(
            gateway.object_batch_sizes(),
            vec![RESUME_BATCH_SIZE, RESUME_BATCH_SIZE, RESUME_BATCH_SIZE]
        );
        assert_eq!(dispatcher.stats().backpressure_waits, 0);
    }

    #[tokio::test]
    async fn rate_limit_holds_back_chunks_over_budget() {
        let gateway = InMemoryGateway::new();
        let mut dispatcher = dispatcher(
            &gateway,
            BatchConfig::dynamic().mode(BatchMode::RateLimit {
                requests_per_minute: 50,
            }),
        );
        dispatcher.rate_window = Some(Mutex::new(RateWindow::new(5, Duration::from_millis(60))));
        for n in 0..15 {
            dispatcher.queue().push(object(n));
        }

        let started = Instant::now();
        dispatcher.try_flush(true).await.unwrap();

        // chunks of 5 against 5 per window: the second and third wait
        assert_eq!(gateway.object_batch_sizes(), vec![5, 5, 5]);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn dynamic_start_runs_monitor_until_shutdown() {
        let gateway = InMemoryGateway::new();
        gateway.set_cluster_status(Some(ClusterStatus {
            queue_length: 0,
            rate_per_second: 100.0,
            worker_count: 1,
        }));
        let dispatcher = dispatcher(&gateway, BatchConfig::dynamic());

        dispatcher.start();
        assert_eq!(dispatcher.monitor_state(), MonitorState::Running);
        assert_eq!(dispatcher.pool_state(), PoolState::Idle);
        dispatcher.shutdown().await.unwrap();
        assert_eq!(dispatcher.monitor_state(), MonitorState::Stopped);
        assert_eq!(dispatcher.pool_state(), PoolState::Shutdown);

        let fixed = Dispatcher::new(Arc::new(gateway), BatchConfig::fixed_size(5, 1)).unwrap();
        fixed.start();
        assert_eq!(fixed.monitor_state(), MonitorState::Stopped);
    }
}
