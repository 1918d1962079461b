//! Background polling of server congestion telemetry.

use crate::config::MonitorPolicy;
use crate::core::{BatchError, Result};
use crate::gateway::Gateway;
use crate::sizing::SizeController;
use crate::stats::BatchCounters;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Lifecycle of a [`CongestionMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Stopped,
}

/// Why the polling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The stop signal fired or its sender went away.
    Stopped,
    /// The server publishes no telemetry; sizing fell back to the reactive rule.
    Unsupported,
}

/// Handle to the polling task.
pub struct CongestionMonitor {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<MonitorExit>>,
}

impl std::fmt::Debug for CongestionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CongestionMonitor")
            .field("state", &self.state())
            .finish()
    }
}

impl CongestionMonitor {
    /// Starts polling `gateway` and feeding `sizes`.
    ///
    /// `concurrency` is the client worker count used to split the server rate.
    pub fn spawn(
        gateway: Arc<dyn Gateway>,
        sizes: Arc<SizeController>,
        counters: Arc<BatchCounters>,
        policy: MonitorPolicy,
        concurrency: usize,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let join_handle = tokio::spawn(run_monitor(
            gateway,
            sizes,
            counters,
            policy,
            concurrency,
            stop_rx,
        ));

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn state(&self) -> MonitorState {
        match &self.join_handle {
            Some(handle) if !handle.is_finished() => MonitorState::Running,
            _ => MonitorState::Stopped,
        }
    }

    /// Signals the loop to stop and waits for it to finish. An in-flight poll
    /// completes first.
    pub async fn stop(mut self) -> Result<MonitorExit> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        match self.join_handle.take() {
            Some(join_handle) => join_handle
                .await
                .map_err(|err| {
                    BatchError::ExecutionError(format!("congestion monitor join: {}", err))
                }),
            None => Ok(MonitorExit::Stopped),
        }
    }
}

impl Drop for CongestionMonitor {
    fn drop(&mut self) {
        // The loop still runs its exit path and lifts a zero size.
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

async fn run_monitor(
    gateway: Arc<dyn Gateway>,
    sizes: Arc<SizeController>,
    counters: Arc<BatchCounters>,
    policy: MonitorPolicy,
    concurrency: usize,
    mut stop_rx: oneshot::Receiver<()>,
) -> MonitorExit {
    event!(Level::DEBUG, concurrency, "congestion monitor started");

    let exit = loop {
        if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
            break MonitorExit::Stopped;
        }

        let interval = match gateway.cluster_status().await {
            Ok(Some(status)) => {
                counters.record_monitor_poll();
                sizes.apply_cluster_status(&status, concurrency);
                event!(
                    Level::DEBUG,
                    queue_length = status.queue_length,
                    rate = status.rate_per_second,
                    object_batch_size = sizes.object_batch_size(),
                    "cluster status applied"
                );
                policy.poll_interval()
            }
            Ok(None) => {
                counters.record_monitor_poll();
                if sizes.fall_back_to_reactive() {
                    event!(
                        Level::INFO,
                        "server reports no batch telemetry; using local throughput sizing"
                    );
                }
                break MonitorExit::Unsupported;
            }
            Err(err) if err.is_transient() => {
                counters.record_monitor_error();
                event!(Level::WARN, error = %err, "cluster status poll failed, retrying");
                policy.fast_retry_interval()
            }
            Err(err) => {
                counters.record_monitor_error();
                log::warn!("Congestion monitor poll failed: {}", err);
                policy.slow_backoff_interval()
            }
        };

        tokio::select! {
            _ = &mut stop_rx => {
                break MonitorExit::Stopped;
            }
            _ = sleep(interval) => {}
        }
    };

    sizes.release_backpressure();
    event!(Level::DEBUG, ?exit, "congestion monitor stopped");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ClusterStatus, InMemoryGateway};
    use crate::sizing::{BatchCategory, RESUME_BATCH_SIZE, SizingMode};
    use std::time::Duration;

    fn fast_policy() -> MonitorPolicy {
        MonitorPolicy {
            poll_interval_ms: 5,
            fast_retry_interval_ms: 1,
            slow_backoff_interval_ms: 20,
        }
    }

    fn status(queue_length: u64, rate_per_second: f64) -> ClusterStatus {
        ClusterStatus {
            queue_length,
            rate_per_second,
            worker_count: 1,
        }
    }

    async fn wait_for_polls(gateway: &InMemoryGateway, polls: usize) {
        for _ in 0..500 {
            if gateway.status_polls() >= polls {
                return;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("monitor did not poll {} times", polls);
    }

    #[tokio::test]
    async fn missing_telemetry_falls_back_and_exits() {
        let gateway = InMemoryGateway::new();
        let sizes = Arc::new(SizeController::congestion_aware(50, Duration::from_secs(2)));
        let monitor = CongestionMonitor::spawn(
            Arc::new(gateway.clone()),
            Arc::clone(&sizes),
            Arc::new(BatchCounters::new()),
            fast_policy(),
            1,
        );

        wait_for_polls(&gateway, 1).await;
        assert_eq!(monitor.stop().await.unwrap(), MonitorExit::Unsupported);
        assert_eq!(sizes.mode(), SizingMode::Reactive);
        assert_eq!(gateway.status_polls(), 1);
    }

    #[tokio::test]
    async fn polls_grow_size_on_empty_server_queue() {
        let gateway = InMemoryGateway::new();
        gateway.set_cluster_status(Some(status(0, 100.0)));
        let sizes = Arc::new(SizeController::congestion_aware(5, Duration::from_secs(2)));
        let monitor = CongestionMonitor::spawn(
            Arc::new(gateway.clone()),
            Arc::clone(&sizes),
            Arc::new(BatchCounters::new()),
            fast_policy(),
            1,
        );

        wait_for_polls(&gateway, 3).await;
        assert_eq!(monitor.state(), MonitorState::Running);
        assert_eq!(monitor.stop().await.unwrap(), MonitorExit::Stopped);
        assert!(sizes.object_batch_size() > 5);
        assert_eq!(sizes.mode(), SizingMode::CongestionAware);
    }

    #[tokio::test]
    async fn poll_errors_are_counted_not_fatal() {
        let gateway = InMemoryGateway::new();
        gateway.script_cluster_polls([
            Err(BatchError::Transport("timeout".into())),
            Err(BatchError::Server("internal".into())),
        ]);
        gateway.set_cluster_status(Some(status(100, 100.0)));
        let counters = Arc::new(BatchCounters::new());
        let sizes = Arc::new(SizeController::congestion_aware(40, Duration::from_secs(2)));
        let monitor = CongestionMonitor::spawn(
            Arc::new(gateway.clone()),
            Arc::clone(&sizes),
            Arc::clone(&counters),
            fast_policy(),
            1,
        );

        wait_for_polls(&gateway, 3).await;
        monitor.stop().await.unwrap();

        assert_eq!(counters.monitor_errors(), 2);
        // ratio 1.0: min(40 * 1.5, 100 * 2) = 60
        assert!(sizes.size(BatchCategory::Objects) >= 60);
    }

    #[tokio::test]
    async fn stopping_lifts_zero_sizes() {
        let gateway = InMemoryGateway::new();
        gateway.set_cluster_status(Some(status(10_000, 10.0)));
        let sizes = Arc::new(SizeController::congestion_aware(50, Duration::from_secs(2)));
        let monitor = CongestionMonitor::spawn(
            Arc::new(gateway.clone()),
            Arc::clone(&sizes),
            Arc::new(BatchCounters::new()),
            fast_policy(),
            1,
        );

        wait_for_polls(&gateway, 1).await;
        monitor.stop().await.unwrap();

        assert_eq!(sizes.sizes(), (RESUME_BATCH_SIZE, RESUME_BATCH_SIZE));
    }
}
