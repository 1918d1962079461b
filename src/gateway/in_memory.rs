use super::{ClusterStatus, Gateway, ItemErrors};
use crate::core::{BatchError, ConsistencyLevel, ObjectWrite, ReferenceWrite, Result};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type ObjectRule = Arc<dyn Fn(&ObjectWrite) -> Option<String> + Send + Sync>;
type ReferenceRule = Arc<dyn Fn(&ReferenceWrite) -> Option<String> + Send + Sync>;

/// An object as held by the in-memory store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub collection: String,
    pub tenant: Option<String>,
    pub properties: Map<String, JsonValue>,
    pub vector: Option<Vec<f32>>,
}

impl From<&ObjectWrite> for StoredObject {
    fn from(object: &ObjectWrite) -> Self {
        Self {
            collection: object.collection.clone(),
            tenant: object.tenant.clone(),
            properties: object.properties.clone(),
            vector: object.vector.clone(),
        }
    }
}

#[derive(Default)]
struct GatewayState {
    objects: HashMap<uuid::Uuid, StoredObject>,
    references: HashMap<(uuid::Uuid, String), Vec<uuid::Uuid>>,
    object_batches: Vec<usize>,
    reference_batches: Vec<usize>,
    consistency_seen: Vec<Option<ConsistencyLevel>>,
    next_transport_failures: VecDeque<String>,
    persistent_transport_failure: Option<String>,
    object_rule: Option<ObjectRule>,
    reference_rule: Option<ReferenceRule>,
    require_reference_sources: bool,
    latency: Option<Duration>,
    cluster: Option<ClusterStatus>,
    scripted_polls: VecDeque<Result<Option<ClusterStatus>>>,
    status_polls: usize,
}

impl GatewayState {
    fn take_transport_failure(&mut self) -> Option<String> {
        self.next_transport_failures
            .pop_front()
            .or_else(|| self.persistent_transport_failure.clone())
    }
}

/// A [`Gateway`] backed by process memory.
///
/// Simulates a store for tests and local runs: it keeps what it receives,
/// records the size of every call and can be told to fail whole calls, reject
/// single items, add latency or report congestion telemetry.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<GatewayState>>,
    inflight: Arc<AtomicUsize>,
    peak_inflight: Arc<AtomicUsize>,
}

struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self) -> InflightGuard {
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_inflight.fetch_max(now, Ordering::SeqCst);
        InflightGuard {
            inflight: Arc::clone(&self.inflight),
        }
    }

    /// Delay every send by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = Some(latency);
        self
    }

    /// The next `count` sends fail with a transport error.
    pub fn fail_next_sends(&self, count: usize, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock();
        for _ in 0..count {
            state.next_transport_failures.push_back(message.clone());
        }
    }

    /// Every send fails with a transport error until [`heal`](Self::heal).
    pub fn fail_all_sends(&self, message: impl Into<String>) {
        self.lock().persistent_transport_failure = Some(message.into());
    }

    pub fn heal(&self) {
        let mut state = self.lock();
        state.persistent_transport_failure = None;
        state.next_transport_failures.clear();
    }

    /// Reject objects for which `rule` returns an error message.
    pub fn reject_objects_where<F>(&self, rule: F)
    where
        F: Fn(&ObjectWrite) -> Option<String> + Send + Sync + 'static,
    {
        self.lock().object_rule = Some(Arc::new(rule));
    }

    /// Reject references for which `rule` returns an error message.
    pub fn reject_references_where<F>(&self, rule: F)
    where
        F: Fn(&ReferenceWrite) -> Option<String> + Send + Sync + 'static,
    {
        self.lock().reference_rule = Some(Arc::new(rule));
    }

    /// Reject references whose source object has not been stored yet.
    pub fn require_reference_sources(&self, required: bool) {
        self.lock().require_reference_sources = required;
    }

    /// Telemetry returned by polls once scripted answers run out.
    pub fn set_cluster_status(&self, status: Option<ClusterStatus>) {
        self.lock().cluster = status;
    }

    /// Answers returned by the next polls, in order.
    pub fn script_cluster_polls(
        &self,
        polls: impl IntoIterator<Item = Result<Option<ClusterStatus>>>,
    ) {
        self.lock().scripted_polls.extend(polls);
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn object(&self, uuid: &uuid::Uuid) -> Option<StoredObject> {
        self.lock().objects.get(uuid).cloned()
    }

    /// Targets stored for `property` of the object `from`.
    pub fn references_of(&self, from: &uuid::Uuid, property: &str) -> Vec<uuid::Uuid> {
        self.lock()
            .references
            .get(&(*from, property.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn reference_count(&self) -> usize {
        self.lock().references.values().map(Vec::len).sum()
    }

    /// Size of every object call received, in arrival order.
    pub fn object_batch_sizes(&self) -> Vec<usize> {
        self.lock().object_batches.clone()
    }

    /// Size of every reference call received, in arrival order.
    pub fn reference_batch_sizes(&self) -> Vec<usize> {
        self.lock().reference_batches.clone()
    }

    pub fn consistency_levels_seen(&self) -> Vec<Option<ConsistencyLevel>> {
        self.lock().consistency_seen.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.lock().status_polls
    }

    /// Highest number of sends that were in progress at the same time.
    pub fn peak_concurrent_sends(&self) -> usize {
        self.peak_inflight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn send_objects(
        &self,
        objects: &[ObjectWrite],
        consistency: Option<ConsistencyLevel>,
    ) -> Result<ItemErrors> {
        let _inflight = self.enter();
        {
            let mut state = self.lock();
            state.object_batches.push(objects.len());
            state.consistency_seen.push(consistency);
        }
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(message) = state.take_transport_failure() {
            return Err(BatchError::Transport(message));
        }

        let rule = state.object_rule.clone();
        let mut errors = ItemErrors::new();
        for (index, object) in objects.iter().enumerate() {
            if let Some(message) = rule.as_ref().and_then(|rule| rule(object)) {
                errors.insert(index, message);
                continue;
            }
            state.objects.insert(object.uuid, StoredObject::from(object));
        }
        Ok(errors)
    }

    async fn send_references(
        &self,
        references: &[ReferenceWrite],
        consistency: Option<ConsistencyLevel>,
    ) -> Result<ItemErrors> {
        let _inflight = self.enter();
        {
            let mut state = self.lock();
            state.reference_batches.push(references.len());
            state.consistency_seen.push(consistency);
        }
        self.simulate_latency().await;

        let mut state = self.lock();
        if let Some(message) = state.take_transport_failure() {
            return Err(BatchError::Transport(message));
        }

        let rule = state.reference_rule.clone();
        let mut errors = ItemErrors::new();
        for (index, reference) in references.iter().enumerate() {
            if let Some(message) = rule.as_ref().and_then(|rule| rule(reference)) {
                errors.insert(index, message);
                continue;
            }
            if state.require_reference_sources && !state.objects.contains_key(&reference.from_uuid)
            {
                errors.insert(
                    index,
                    format!("source object {} not found", reference.from_uuid),
                );
                continue;
            }
            state
                .references
                .entry((reference.from_uuid, reference.from_property.clone()))
                .or_default()
                .extend(reference.to.uuids.iter().copied());
        }
        Ok(errors)
    }

    async fn cluster_status(&self) -> Result<Option<ClusterStatus>> {
        let mut state = self.lock();
        state.status_polls += 1;
        if let Some(answer) = state.scripted_polls.pop_front() {
            return answer;
        }
        Ok(state.cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ObjectInput, ReferenceInput};
    use serde_json::json;

    fn object(name: &str) -> ObjectWrite {
        ObjectInput::new("Article")
            .properties(json!({ "name": name }))
            .into_write()
            .unwrap()
    }

    #[tokio::test]
    async fn stores_objects_and_records_calls() {
        let gateway = InMemoryGateway::new();
        let batch = vec![object("a"), object("b")];

        let errors = gateway
            .send_objects(&batch, Some(ConsistencyLevel::Quorum))
            .await
            .unwrap();

        assert!(errors.is_empty());
        assert_eq!(gateway.object_count(), 2);
        assert_eq!(gateway.object_batch_sizes(), vec![2]);
        assert_eq!(
            gateway.consistency_levels_seen(),
            vec![Some(ConsistencyLevel::Quorum)]
        );
        let stored = gateway.object(&batch[1].uuid).unwrap();
        assert_eq!(stored.properties["name"], json!("b"));
    }

    #[tokio::test]
    async fn rejection_rule_reports_indexes() {
        let gateway = InMemoryGateway::new();
        gateway.reject_objects_where(|object| {
            (object.properties["name"] == json!("bad")).then(|| "schema violation".to_string())
        });

        let batch = vec![object("bad"), object("ok"), object("bad")];
        let errors = gateway.send_objects(&batch, None).await.unwrap();

        assert_eq!(errors.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(gateway.object_count(), 1);
    }

    #[tokio::test]
    async fn transport_failures_are_consumed_in_order() {
        let gateway = InMemoryGateway::new();
        gateway.fail_next_sends(1, "connection reset");

        let first = gateway.send_objects(&[object("a")], None).await;
        assert_eq!(
            first.unwrap_err(),
            BatchError::Transport("connection reset".into())
        );
        assert!(gateway.send_objects(&[object("a")], None).await.is_ok());

        gateway.fail_all_sends("down");
        assert!(gateway.send_objects(&[object("a")], None).await.is_err());
        assert!(gateway.send_objects(&[object("a")], None).await.is_err());
        gateway.heal();
        assert!(gateway.send_objects(&[object("a")], None).await.is_ok());
    }

    #[tokio::test]
    async fn references_require_sources_when_asked() {
        let gateway = InMemoryGateway::new();
        gateway.require_reference_sources(true);
        let source = object("src");
        let target = object("dst");
        let reference = ReferenceInput::new("Article", source.uuid, "cites", target.uuid)
            .into_write()
            .unwrap();

        let errors = gateway
            .send_references(std::slice::from_ref(&reference), None)
            .await
            .unwrap();
        assert!(errors[&0].contains("not found"));

        gateway.send_objects(&[source.clone()], None).await.unwrap();
        let errors = gateway
            .send_references(std::slice::from_ref(&reference), None)
            .await
            .unwrap();
        assert!(errors.is_empty());
        assert_eq!(gateway.references_of(&source.uuid, "cites"), vec![target.uuid]);
        assert_eq!(gateway.reference_count(), 1);
    }

    #[tokio::test]
    async fn cluster_polls_follow_script_then_static_status() {
        let gateway = InMemoryGateway::new();
        assert_eq!(gateway.cluster_status().await.unwrap(), None);

        let status = ClusterStatus {
            queue_length: 10,
            rate_per_second: 100.0,
            worker_count: 2,
        };
        gateway.set_cluster_status(Some(status));
        gateway.script_cluster_polls([Err(BatchError::Transport("timeout".into()))]);

        assert!(gateway.cluster_status().await.is_err());
        assert_eq!(gateway.cluster_status().await.unwrap(), Some(status));
        assert_eq!(gateway.status_polls(), 3);
    }
}
