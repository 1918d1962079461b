use crate::core::{ObjectInput, Operation, ReferenceInput, Result};
use crate::dispatch::Dispatcher;
use crate::result::BatchResults;
use crate::stats::BatchStats;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// An open batch session.
///
/// Operations are validated on `add_*`, queued and sent in the background as
/// soon as a recommended batch size is reached. Call [`finish`](Batch::finish)
/// to send the rest and collect the results.
pub struct Batch {
    dispatcher: Dispatcher,
    last_results: Arc<Mutex<BatchResults>>,
    finished: bool,
}

impl Batch {
    pub(crate) fn start(dispatcher: Dispatcher, last_results: Arc<Mutex<BatchResults>>) -> Self {
        dispatcher.start();
        Self {
            dispatcher,
            last_results,
            finished: false,
        }
    }

    /// Queue an object upsert and return its id.
    pub async fn add_object(&self, object: ObjectInput) -> Result<Uuid> {
        let write = object.into_write()?;
        let uuid = write.uuid;
        self.add(write.into()).await?;
        Ok(uuid)
    }

    /// Queue a cross-reference.
    pub async fn add_reference(&self, reference: ReferenceInput) -> Result<()> {
        let write = reference.into_write()?;
        self.add(write.into()).await
    }

    /// Queue an already validated operation.
    pub async fn add(&self, operation: Operation) -> Result<()> {
        self.dispatcher.queue().push(operation);
        self.dispatcher.try_flush(false).await
    }

    /// Session bound to one collection.
    pub fn collection(&self, name: impl Into<String>) -> CollectionBatch<'_> {
        CollectionBatch {
            batch: self,
            collection: name.into(),
            tenant: None,
        }
    }

    /// Send everything queued and wait for it, retries included.
    pub async fn flush(&self) -> Result<()> {
        self.dispatcher.flush().await
    }

    pub fn pending_objects(&self) -> usize {
        self.dispatcher.queue().objects.len()
    }

    pub fn pending_references(&self) -> usize {
        self.dispatcher.queue().references.len()
    }

    pub fn stats(&self) -> BatchStats {
        self.dispatcher.stats()
    }

    /// Results collected so far.
    pub fn results(&self) -> BatchResults {
        self.dispatcher.results()
    }

    /// Flush, stop background work and return the session results.
    pub async fn finish(mut self) -> Result<BatchResults> {
        self.dispatcher.flush().await?;
        self.dispatcher.shutdown().await?;
        self.finished = true;

        let results = self.dispatcher.take_results();
        *self
            .last_results
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = results.clone();
        log::info!("{}", results);
        Ok(results)
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pending = self.pending_objects() + self.pending_references();
        log::warn!(
            "Batch session dropped without finish(); {} queued operations were not sent",
            pending
        );
        self.dispatcher.stop_monitor();
    }
}

/// Batch session scoped to one collection and, optionally, one tenant.
pub struct CollectionBatch<'a> {
    batch: &'a Batch,
    collection: String,
    tenant: Option<String>,
}

impl CollectionBatch<'_> {
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.collection
    }

    /// Queue an object with `properties` and a generated id.
    pub async fn add_object(&self, properties: JsonValue) -> Result<Uuid> {
        self.add(ObjectInput::default().properties(properties)).await
    }

    /// Queue an object; collection and tenant are filled in when unset.
    pub async fn add(&self, mut object: ObjectInput) -> Result<Uuid> {
        object.set_collection_if_empty(&self.collection);
        object.set_tenant_if_absent(self.tenant.as_deref());
        self.batch.add_object(object).await
    }

    /// Queue a reference from an object of this collection.
    pub async fn add_reference(
        &self,
        from_uuid: impl ToString,
        from_property: impl Into<String>,
        to: impl ToString,
    ) -> Result<()> {
        self.add_reference_input(ReferenceInput::new(
            self.collection.as_str(),
            from_uuid,
            from_property,
            to,
        ))
        .await
    }

    pub async fn add_reference_input(&self, mut reference: ReferenceInput) -> Result<()> {
        reference.set_collection_if_empty(&self.collection);
        reference.set_tenant_if_absent(self.tenant.as_deref());
        self.batch.add_reference(reference).await
    }
}
