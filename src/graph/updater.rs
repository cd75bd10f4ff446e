//! Serialisation of inbound value updates onto a single apply thread.
//!
//! Transport callbacks and polling ticks run on arbitrary threads; they
//! must not mutate the graph directly. They rent a buffer from the
//! [`BufferPool`], fill it, and hand it to the [`SubjectUpdater`], whose
//! apply thread owns the order in which mutation units reach the graph.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use smallvec::SmallVec;
use tracing::debug;

use crate::graph::store::{GraphStore, SourceId};
use crate::graph::subject::PropertyRef;
use crate::graph::value::Value;

/// One inbound value update.
#[derive(Debug, Clone)]
pub struct ValueUpdate {
    pub property: PropertyRef,
    pub value: Value,
    pub source_timestamp: Option<SystemTime>,
    pub received_at: SystemTime,
}

/// A reusable batch of updates delivered as one mutation unit.
pub type UpdateBuffer = SmallVec<[ValueUpdate; 16]>;

/// Pool of notification buffers used on the fast data-change path.
///
/// Bounded so pathological traffic cannot grow it without limit; excess
/// returns are dropped.
pub struct BufferPool {
    free: Mutex<Vec<UpdateBuffer>>,
    max: usize,
}

impl BufferPool {
    pub fn new(max: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            max,
        }
    }

    pub fn rent(&self) -> UpdateBuffer {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn give(&self, mut buffer: UpdateBuffer) {
        buffer.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.max {
            free.push(buffer);
        }
    }
}

/// Applies update batches to the graph in arrival order.
pub struct SubjectUpdater {
    tx: mpsc::Sender<UpdateBuffer>,
    pool: Arc<BufferPool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SubjectUpdater {
    /// Spawn the apply thread. Updates are applied on behalf of
    /// `source`, so they are not echoed back through its write tap.
    pub fn spawn(
        graph: GraphStore,
        source: SourceId,
        pool: Arc<BufferPool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<UpdateBuffer>();
        let worker_pool = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            while let Ok(buffer) = rx.recv() {
                for update in &buffer {
                    let result = graph.set_value_from_source(
                        source,
                        &update.property,
                        update.value.clone(),
                        update.source_timestamp,
                        update.received_at,
                    );
                    if let Err(reason) = result {
                        debug!(
                            property = %update.property,
                            reason,
                            "dropping update"
                        );
                    }
                }
                worker_pool.give(buffer);
            }
        });
        SubjectUpdater {
            tx,
            pool,
            handle: Some(handle),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Queue a mutation unit. The buffer returns to the pool after it is
    /// applied; an empty buffer returns immediately.
    pub fn enqueue(&self, buffer: UpdateBuffer) {
        if buffer.is_empty() {
            self.pool.give(buffer);
            return;
        }
        if let Err(mpsc::SendError(buffer)) = self.tx.send(buffer) {
            self.pool.give(buffer);
        }
    }

    /// A cloneable enqueue handle for callbacks.
    pub fn sender(&self) -> UpdateSender {
        UpdateSender {
            tx: self.tx.clone(),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for SubjectUpdater {
    /// Drain outstanding batches and stop the apply thread.
    fn drop(&mut self) {
        drop(std::mem::replace(&mut self.tx, mpsc::channel().0));
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Cheaply cloneable handle for enqueueing update batches.
#[derive(Clone)]
pub struct UpdateSender {
    tx: mpsc::Sender<UpdateBuffer>,
    pool: Arc<BufferPool>,
}

impl UpdateSender {
    pub fn rent(&self) -> UpdateBuffer {
        self.pool.rent()
    }

    /// Return a rented buffer without enqueueing it.
    pub fn give(&self, buffer: UpdateBuffer) {
        self.pool.give(buffer);
    }

    pub fn enqueue(&self, buffer: UpdateBuffer) {
        if buffer.is_empty() {
            self.pool.give(buffer);
            return;
        }
        if let Err(mpsc::SendError(buffer)) = self.tx.send(buffer) {
            self.pool.give(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::subject::Property;
    use crate::graph::value::ScalarType;

    #[test]
    fn updates_apply_in_order() {
        let graph = GraphStore::new();
        let (tap, _rx) = mpsc::channel();
        let source = graph.register_source(tap);
        let subject = graph.create_subject("Motor");
        graph.define_property(
            subject,
            Property::scalar("Speed", ScalarType::Double),
        );
        let speed = PropertyRef::property(subject, "Speed");

        let updater = SubjectUpdater::spawn(
            graph.clone(),
            source,
            Arc::new(BufferPool::new(8)),
        );
        for step in 0..10 {
            let mut buffer = updater.pool().rent();
            buffer.push(ValueUpdate {
                property: speed.clone(),
                value: Value::Int(step),
                source_timestamp: None,
                received_at: SystemTime::now(),
            });
            updater.enqueue(buffer);
        }
        drop(updater);

        assert_eq!(graph.value(&speed), Some(Value::Int(9)));
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(1);
        let a = pool.rent();
        let b = pool.rent();
        pool.give(a);
        pool.give(b);
        assert_eq!(pool.free.lock().unwrap().len(), 1);
    }
}
