//! Polling fallback for nodes that cannot be subscribed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::background::Ticker;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::convert;
use crate::graph::updater::{UpdateSender, ValueUpdate};
use crate::graph::{PropertyRef, ScalarType, Value};
use crate::session::SessionSlot;
use crate::ua::{NodeId, SessionId};

/// A node served by the polling loop.
#[derive(Debug, Clone)]
pub struct PollItem {
    pub node_id: NodeId,
    pub property: PropertyRef,
    pub scalar: ScalarType,
}

struct PollEntry {
    property: PropertyRef,
    scalar: ScalarType,
    last: Mutex<Option<Value>>,
}

/// Counters exposed through the metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollMetrics {
    pub total_reads: u64,
    pub failed_reads: u64,
    pub value_changes: u64,
    pub slow_polls: u64,
    pub trips: u64,
}

#[derive(Default)]
struct Counters {
    total_reads: AtomicU64,
    failed_reads: AtomicU64,
    value_changes: AtomicU64,
    slow_polls: AtomicU64,
    trips: AtomicU64,
}

/// Settings for [`PollingManager`].
#[derive(Debug, Clone)]
pub struct PollingOptions {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: usize,
    pub disposal_timeout: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

struct Inner {
    items: Mutex<HashMap<NodeId, Arc<PollEntry>>>,
    slot: Arc<SessionSlot>,
    updates: UpdateSender,
    breaker: CircuitBreaker,
    options: PollingOptions,
    last_session: Mutex<Option<SessionId>>,
    disposed: AtomicBool,
    counters: Counters,
}

/// Periodically reads a set of nodes and delivers changed values through
/// the updater.
///
/// Polling is suspended while no connected session is available, and a
/// session change resets every cached value so each polled property
/// re-emits its next observed value exactly once.
pub struct PollingManager {
    inner: Arc<Inner>,
    ticker: Mutex<Option<Ticker>>,
}

impl PollingManager {
    pub fn new(
        slot: Arc<SessionSlot>,
        updates: UpdateSender,
        options: PollingOptions,
    ) -> Self {
        PollingManager {
            inner: Arc::new(Inner {
                items: Mutex::new(HashMap::new()),
                slot,
                updates,
                breaker: CircuitBreaker::new(
                    options.breaker_threshold,
                    options.breaker_cooldown,
                ),
                options,
                last_session: Mutex::new(None),
                disposed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.options.enabled
    }

    /// Add a node to the polling set. Re-adding an already-polled node
    /// keeps the existing entry.
    pub fn add(&self, item: PollItem) {
        let mut items = self.inner.items.lock().unwrap();
        items.entry(item.node_id.clone()).or_insert_with(|| {
            debug!(node = %item.node_id, "polling node");
            Arc::new(PollEntry {
                property: item.property,
                scalar: item.scalar,
                last: Mutex::new(None),
            })
        });
    }

    /// Remove a node from the polling set. Unknown nodes are ignored.
    pub fn remove(&self, node_id: &NodeId) {
        self.inner.items.lock().unwrap().remove(node_id);
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the polling loop. Does nothing when polling is disabled or
    /// the loop is already running.
    pub fn start(&self) {
        if !self.inner.options.enabled
            || self.inner.disposed.load(Ordering::Acquire)
        {
            return;
        }
        let mut ticker = self.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *ticker = Some(Ticker::spawn(
            "uamirror-polling",
            self.inner.options.interval,
            move || inner.tick(),
        ));
    }

    /// Stop the loop and mark the manager disposed. Bounded by the
    /// configured disposal timeout so a hung read cannot block teardown.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        if let Some(mut ticker) = self.ticker.lock().unwrap().take() {
            ticker.stop(Some(self.inner.options.disposal_timeout));
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.breaker.state()
    }

    pub fn metrics(&self) -> PollMetrics {
        let counters = &self.inner.counters;
        PollMetrics {
            total_reads: counters.total_reads.load(Ordering::Relaxed),
            failed_reads: counters.failed_reads.load(Ordering::Relaxed),
            value_changes: counters.value_changes.load(Ordering::Relaxed),
            slow_polls: counters.slow_polls.load(Ordering::Relaxed),
            trips: counters.trips.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn tick_now(&self) {
        self.inner.tick();
    }
}

impl Inner {
    fn tick(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if !self.breaker.should_attempt() {
            return;
        }

        // The session reference is re-read every tick; a cached one could
        // outlive a reconnect.
        let session = match self.slot.load() {
            Some(session) if session.is_connected() => session,
            _ => {
                *self.last_session.lock().unwrap() = None;
                return;
            }
        };

        // Session identity is the freshness boundary: a new session means
        // every cached value is stale.
        {
            let mut last_session = self.last_session.lock().unwrap();
            if *last_session != Some(session.id()) {
                for entry in self.items.lock().unwrap().values() {
                    *entry.last.lock().unwrap() = None;
                }
                self.breaker.record_success();
                *last_session = Some(session.id());
            }
        }

        let snapshot: Vec<(NodeId, Arc<PollEntry>)> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .map(|(node_id, entry)| (node_id.clone(), Arc::clone(entry)))
            .collect();
        if snapshot.is_empty() {
            return;
        }

        let started = Instant::now();
        let mut transport_failed = false;
        let mut buffer = self.updates.rent();
        for chunk in snapshot.chunks(self.options.batch_size.max(1)) {
            if self.disposed.load(Ordering::Acquire) {
                break;
            }
            let nodes: Vec<NodeId> =
                chunk.iter().map(|(node_id, _)| node_id.clone()).collect();
            self.counters
                .total_reads
                .fetch_add(nodes.len() as u64, Ordering::Relaxed);
            let results = match session.read(&nodes) {
                Ok(results) => results,
                Err(status) => {
                    self.counters
                        .failed_reads
                        .fetch_add(nodes.len() as u64, Ordering::Relaxed);
                    debug!(%status, "poll read failed");
                    transport_failed = true;
                    continue;
                }
            };
            for ((node_id, entry), result) in chunk.iter().zip(results) {
                if !result.status.is_good() {
                    self.counters
                        .failed_reads
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(node = %node_id, status = %result.status,
                        "bad poll result");
                    continue;
                }
                let value = convert::from_wire(&result.value, &entry.scalar);
                let changed = {
                    // Swap only while the entry is still the one we
                    // snapshotted, so a concurrently-removed node is not
                    // resurrected.
                    let items = self.items.lock().unwrap();
                    let still_current = matches!(
                        items.get(node_id),
                        Some(current) if Arc::ptr_eq(current, entry)
                    );
                    if !still_current {
                        false
                    } else {
                        let mut last = entry.last.lock().unwrap();
                        if last.as_ref() == Some(&value) {
                            false
                        } else {
                            *last = Some(value.clone());
                            true
                        }
                    }
                };
                if changed {
                    self.counters
                        .value_changes
                        .fetch_add(1, Ordering::Relaxed);
                    buffer.push(ValueUpdate {
                        property: entry.property.clone(),
                        value,
                        source_timestamp: result.source_timestamp,
                        received_at: SystemTime::now(),
                    });
                }
            }
        }
        self.updates.enqueue(buffer);

        let elapsed = started.elapsed();
        if elapsed > self.options.interval {
            self.counters.slow_polls.fetch_add(1, Ordering::Relaxed);
            warn!(?elapsed, interval = ?self.options.interval,
                "poll took longer than the polling interval");
        }

        if transport_failed {
            if self.breaker.record_failure() {
                self.counters.trips.fetch_add(1, Ordering::Relaxed);
                warn!("polling circuit breaker opened");
            }
        } else {
            self.breaker.record_success();
        }
    }
}
