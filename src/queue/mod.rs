use crate::core::{ObjectWrite, Operation, ReferenceWrite};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A queued operation together with the number of deliveries already tried.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending<T> {
    pub operation: T,
    pub attempt: u32,
}

impl<T> Pending<T> {
    /// A never-sent operation.
    pub fn fresh(operation: T) -> Self {
        Self {
            operation,
            attempt: 0,
        }
    }
}

/// FIFO buffer shared by producers and the dispatcher.
///
/// `push` and `drain` take the same short lock, so a push either lands in the
/// snapshot being drained or in the next one, never half in both.
#[derive(Debug)]
pub struct BatchQueue<T> {
    items: Mutex<Vec<Pending<T>>>,
}

impl<T> Default for BatchQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> BatchQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // Plain data: a poisoned lock still holds a consistent Vec.
    fn lock(&self) -> MutexGuard<'_, Vec<Pending<T>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, operation: T) {
        self.lock().push(Pending::fresh(operation));
    }

    /// Re-queue an operation that already went out at least once.
    pub fn push_pending(&self, pending: Pending<T>) {
        self.lock().push(pending);
    }

    pub fn extend_pending(&self, pending: impl IntoIterator<Item = Pending<T>>) {
        self.lock().extend(pending);
    }

    /// Point-in-time number of queued operations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything queued so far, leaving the queue empty.
    pub fn drain(&self) -> Vec<Pending<T>> {
        std::mem::take(&mut *self.lock())
    }
}

/// Pending writes, split by category because each is flushed and sized on its own.
#[derive(Debug, Default)]
pub struct OperationQueue {
    pub objects: BatchQueue<ObjectWrite>,
    pub references: BatchQueue<ReferenceWrite>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, operation: Operation) {
        match operation {
            Operation::Object(object) => self.objects.push(object),
            Operation::Reference(reference) => self.references.push(reference),
        }
    }

    /// True when either category reached its recommended size.
    pub fn reached(&self, object_size: usize, reference_size: usize) -> bool {
        self.objects.len() >= object_size || self.references.len() >= reference_size
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.references.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ObjectInput, ReferenceInput};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn drain_preserves_insertion_order() {
        let queue = BatchQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        let drained: Vec<i32> = queue.drain().into_iter().map(|p| p.operation).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn draining_empty_queue_is_a_noop() {
        let queue: BatchQueue<u32> = BatchQueue::new();
        assert!(queue.drain().is_empty());
        assert!(queue.drain().is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn requeued_items_keep_their_attempt() {
        let queue = BatchQueue::new();
        queue.push("a");
        queue.push_pending(Pending {
            operation: "b",
            attempt: 2,
        });
        let drained = queue.drain();
        assert_eq!(drained[0].attempt, 0);
        assert_eq!(drained[1].attempt, 2);
    }

    #[test]
    fn concurrent_pushes_and_drains_lose_nothing() {
        let queue = Arc::new(BatchQueue::new());
        let producers = 8;
        let per_producer = 2_000;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        queue.push(p * per_producer + i);
                    }
                })
            })
            .collect();

        let drainer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..500 {
                    seen.extend(queue.drain().into_iter().map(|p| p.operation));
                    thread::yield_now();
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = drainer.join().unwrap();
        seen.extend(queue.drain().into_iter().map(|p| p.operation));

        assert_eq!(seen.len(), producers * per_producer);
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), producers * per_producer);
    }

    #[test]
    fn operation_queue_routes_by_category() {
        let queue = OperationQueue::new();
        let object = ObjectInput::new("A").into_write().unwrap();
        let reference = ReferenceInput::new("A", object.uuid, "p", object.uuid)
            .into_write()
            .unwrap();

        queue.push(object.into());
        queue.push(reference.into());
        queue.push(ObjectInput::new("A").into_write().unwrap().into());

        assert_eq!(queue.objects.len(), 2);
        assert_eq!(queue.references.len(), 1);
        assert!(queue.reached(2, 10));
        assert!(queue.reached(10, 1));
        assert!(!queue.reached(3, 2));
    }
}
