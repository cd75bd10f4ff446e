//! The OPC UA client source: wiring, health loop, recovery, teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::background::Ticker;
use crate::breaker::BreakerState;
use crate::convert;
use crate::graph::updater::{BufferPool, SubjectUpdater, ValueUpdate};
use crate::graph::{
    GraphStore, PropertyKind, PropertyRef, SourceId, StructuralChange,
    SubjectId, WriteChange,
};
use crate::health::HealthMonitor;
use crate::loader::{
    LoaderPolicy, RemoteChangeWindow, SubjectLoader, NODE_DATA_KEY,
};
use crate::monitored_item::{MonitoredItemFactory, MonitoringParams};
use crate::polling::{PollMetrics, PollingManager, PollingOptions};
use crate::reconcile::ChangeReceiver;
use crate::registry::SubjectRegistry;
use crate::session::{
    ReconnectOutcome, SessionManager, SessionRef, SessionSlot,
};
use crate::subscription::{SubscriptionConfig, SubscriptionManager};
use crate::ua::{
    Connector, EndpointOptions, ModelChangeEvent, NodeId, SessionId,
};
use crate::write_queue::WriteQueue;
use crate::writer::WritePipeline;

/// Data-bag key prefix this source uses; cleared on dispose.
const DATA_PREFIX: &str = "opcua.";

/// Everything needed to run one client source.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: EndpointOptions,
    pub root_node: NodeId,
    pub subscription: SubscriptionConfig,
    pub monitoring_defaults: MonitoringParams,
    pub monitoring_overrides: HashMap<NodeId, MonitoringParams>,
    pub polling: PollingOptions,
    pub write_queue_size: usize,
    pub write_flush_interval: Duration,
    pub health_check_interval: Duration,
    /// Health ticks an unfinished reconnect may span before manual
    /// recovery takes over.
    pub stall_threshold: u32,
    pub enable_graph_change_publishing: bool,
    pub loader: LoaderPolicy,
}

/// Point-in-time view of the source, for operators and tests.
#[derive(Debug, Clone)]
pub struct Metrics {
    pub connected: bool,
    pub session_id: Option<SessionId>,
    pub reconnecting: bool,
    pub subscription_count: usize,
    pub monitored_item_count: usize,
    pub polling_item_count: usize,
    pub polling_breaker: BreakerState,
    pub polling: PollMetrics,
    pub write_queue_depth: usize,
    pub dropped_writes: u64,
    pub tracked_subjects: usize,
    pub session_recreations: u64,
    pub reconnects_completed: u64,
}

enum Task {
    ModelChange(ModelChangeEvent),
    ReconnectCompleted(ReconnectOutcome),
    HealthTick,
}

struct Inner {
    graph: GraphStore,
    registry: Arc<SubjectRegistry>,
    loader: Arc<SubjectLoader>,
    receiver: ChangeReceiver,
    sessions: SessionManager,
    subscriptions: Arc<SubscriptionManager>,
    polling: Arc<PollingManager>,
    pipeline: Arc<WritePipeline>,
    queue: Arc<WriteQueue>,
    health: HealthMonitor,
    slot: Arc<SessionSlot>,
    source: SourceId,
    stall_threshold: u32,
    publishing: bool,
    worker_tx: Mutex<Option<mpsc::Sender<Task>>>,
    reconnected_observers: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
    session_recreations: AtomicU64,
    reconnects_completed: AtomicU64,
    disposed: AtomicBool,
}

/// A running OPC UA client source. Dropping it tears everything down in
/// dependency order.
pub struct ClientSource {
    inner: Arc<Inner>,
    health_loop: Mutex<Option<Ticker>>,
    flush_loop: Mutex<Option<Ticker>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    updater: Mutex<Option<SubjectUpdater>>,
    disposed: AtomicBool,
}

impl ClientSource {
    /// Connect, discover the hierarchy under `root_node` into `root`,
    /// and start the background loops.
    pub fn start(
        connector: Arc<dyn Connector>,
        graph: GraphStore,
        root: SubjectId,
        options: ClientOptions,
    ) -> Result<ClientSource> {
        let (write_tap_tx, write_tap_rx) = mpsc::channel::<WriteChange>();
        let source = graph.register_source(write_tap_tx);
        let (structural_tx, structural_rx) =
            mpsc::channel::<StructuralChange>();
        graph.set_structural_tap(structural_tx);

        let pool = Arc::new(BufferPool::new(64));
        let updater = SubjectUpdater::spawn(graph.clone(), source, pool);

        let slot = Arc::new(SessionSlot::new());
        let polling = Arc::new(PollingManager::new(
            Arc::clone(&slot),
            updater.sender(),
            options.polling.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            updater.sender(),
            Arc::clone(&polling),
            options.subscription.clone(),
        ));
        let registry = Arc::new(SubjectRegistry::new());
        let loader = Arc::new(SubjectLoader::new(
            graph.clone(),
            Arc::clone(&registry),
            Arc::clone(&subscriptions),
            Arc::clone(&polling),
            MonitoredItemFactory::new(
                options.monitoring_defaults.clone(),
                options.monitoring_overrides.clone(),
            ),
            options.loader.clone(),
            source,
            Arc::new(RemoteChangeWindow::default()),
        ));
        let receiver = ChangeReceiver::new(
            graph.clone(),
            Arc::clone(&registry),
            Arc::clone(&loader),
            Arc::clone(&slot),
            options.enable_graph_change_publishing,
        );
        let queue = Arc::new(WriteQueue::new(options.write_queue_size));
        let pipeline = Arc::new(WritePipeline::new(
            graph.clone(),
            Arc::clone(&queue),
            Arc::clone(&slot),
            Arc::clone(&subscriptions),
        ));
        let sessions = SessionManager::new(
            connector,
            options.endpoint.clone(),
            Arc::clone(&slot),
            Arc::clone(&subscriptions),
            Arc::clone(&polling),
        );
        let health =
            HealthMonitor::new(Arc::clone(&subscriptions), Arc::clone(&slot));

        let inner = Arc::new(Inner {
            graph: graph.clone(),
            registry,
            loader,
            receiver,
            sessions,
            subscriptions,
            polling,
            pipeline,
            queue,
            health,
            slot,
            source,
            stall_threshold: options.stall_threshold,
            publishing: options.enable_graph_change_publishing,
            worker_tx: Mutex::new(None),
            reconnected_observers: Mutex::new(Vec::new()),
            session_recreations: AtomicU64::new(0),
            reconnects_completed: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        });

        // Worker channel: serialises structural work, reconnect
        // follow-up and health checks so they never interleave. The
        // thread itself starts only once setup cannot fail anymore;
        // tasks sent before that queue up.
        let (worker_tx, worker_rx) = mpsc::channel::<Task>();
        *inner.worker_tx.lock().unwrap() = Some(worker_tx);

        // Read-after-write: nodes with server-revised sampling will not
        // report a write promptly, so read them back explicitly.
        {
            let graph = graph.clone();
            let slot = Arc::clone(&inner.slot);
            let updates = updater.sender();
            inner.pipeline.set_read_after_write_hook(Arc::new(
                move |nodes: &[NodeId]| {
                    let Some(session) = slot.load() else {
                        return;
                    };
                    let Ok(results) = session.read(nodes) else {
                        return;
                    };
                    let mut buffer = updates.rent();
                    for (node_id, result) in nodes.iter().zip(results) {
                        if !result.status.is_good() {
                            continue;
                        }
                        let Some((property, scalar)) =
                            find_mapped_property(&graph, node_id)
                        else {
                            continue;
                        };
                        buffer.push(ValueUpdate {
                            property,
                            value: convert::from_wire(&result.value, &scalar),
                            source_timestamp: result.source_timestamp,
                            received_at: SystemTime::now(),
                        });
                    }
                    updates.enqueue(buffer);
                },
            ));
        }

        let session = inner
            .sessions
            .create()
            .map_err(|status| anyhow!("connecting failed: {status}"))?;
        inner.install_model_change_handler(&session);

        let mut planned = Vec::new();
        inner
            .loader
            .load(&session, root, &options.root_node, &mut planned)
            .map_err(|status| anyhow!("initial discovery failed: {status}"))?;
        info!(items = planned.len(), "initial discovery complete");
        inner
            .subscriptions
            .create_all(&session, planned)
            .map_err(|status| {
                anyhow!("creating subscriptions failed: {status}")
            })?;
        inner.polling.start();

        {
            let observer_inner = Arc::downgrade(&inner);
            inner.sessions.set_reconnect_observer(Arc::new(
                move |outcome| {
                    let Some(inner) = observer_inner.upgrade() else {
                        return;
                    };
                    inner.send(Task::ReconnectCompleted(outcome));
                },
            ));
        }

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("uamirror-worker".into())
            .spawn(move || {
                while let Ok(task) = worker_rx.recv() {
                    worker_inner.handle(task);
                }
            })
            .expect("failed to spawn worker thread");

        // Flush loop: drains outbound changes and local structural
        // notices on a fixed cadence.
        let flush_inner = Arc::clone(&inner);
        let flush_loop = Ticker::spawn(
            "uamirror-flush",
            options.write_flush_interval,
            move || {
                while let Ok(change) = structural_rx.try_recv() {
                    flush_inner.on_local_structural_change(change);
                }
                let mut changes = Vec::new();
                while let Ok(change) = write_tap_rx.try_recv() {
                    changes.push(change);
                }
                if !changes.is_empty() || !flush_inner.queue.is_empty() {
                    flush_inner.pipeline.flush(changes);
                }
            },
        );

        let health_inner = Arc::clone(&inner);
        let health_loop = Ticker::spawn(
            "uamirror-health",
            options.health_check_interval,
            move || health_inner.send(Task::HealthTick),
        );

        Ok(ClientSource {
            inner,
            health_loop: Mutex::new(Some(health_loop)),
            flush_loop: Mutex::new(Some(flush_loop)),
            worker: Mutex::new(Some(worker)),
            updater: Mutex::new(Some(updater)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Register an observer fired after every completed reconnection,
    /// once queued writes are flushed and the resync has run.
    pub fn on_reconnected(&self, observer: Arc<dyn Fn() + Send + Sync>) {
        self.inner
            .reconnected_observers
            .lock()
            .unwrap()
            .push(observer);
    }

    pub fn metrics(&self) -> Metrics {
        let session = self.inner.slot.load();
        Metrics {
            connected: session
                .as_ref()
                .map(|session| session.is_connected())
                .unwrap_or(false),
            session_id: session.map(|session| session.id()),
            reconnecting: self.inner.sessions.is_reconnecting(),
            subscription_count: self.inner.subscriptions.subscription_count(),
            monitored_item_count: self
                .inner
                .subscriptions
                .monitored_item_count(),
            polling_item_count: self.inner.polling.len(),
            polling_breaker: self.inner.polling.breaker_state(),
            polling: self.inner.polling.metrics(),
            write_queue_depth: self.inner.queue.len(),
            dropped_writes: self.inner.queue.dropped_count(),
            tracked_subjects: self.inner.registry.tracked_count(),
            session_recreations: self
                .inner
                .session_recreations
                .load(Ordering::Relaxed),
            reconnects_completed: self
                .inner
                .reconnects_completed
                .load(Ordering::Relaxed),
        }
    }

    /// Tear down in strict order: loops, subscriptions, polling,
    /// reconnect handler and session, property data. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.disposed.store(true, Ordering::Release);

        if let Some(mut ticker) = self.health_loop.lock().unwrap().take() {
            ticker.stop(None);
        }
        if let Some(mut ticker) = self.flush_loop.lock().unwrap().take() {
            ticker.stop(None);
        }
        drop(self.inner.worker_tx.lock().unwrap().take());
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }

        self.inner.subscriptions.dispose();
        self.inner.polling.dispose();
        // The reconnect handler is cancelled before the session closes,
        // so its callbacks cannot touch a closed session.
        self.inner.sessions.dispose();

        let source = self.inner.source;
        self.inner.graph.with(|graph| {
            graph.release_all(source);
            graph.clear_data_with_prefix(DATA_PREFIX);
        });
        drop(self.updater.lock().unwrap().take());
        info!("client source disposed");
    }
}

impl Drop for ClientSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn send(&self, task: Task) {
        if let Some(tx) = self.worker_tx.lock().unwrap().as_ref() {
            let _ = tx.send(task);
        }
    }

    fn handle(&self, task: Task) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        match task {
            Task::ModelChange(event) => self.receiver.handle_event(&event),
            Task::ReconnectCompleted(outcome) => {
                self.on_reconnect_completed(outcome)
            }
            Task::HealthTick => self.on_health_tick(),
        }
    }

    fn install_model_change_handler(&self, session: &Arc<SessionRef>) {
        let tx = self.worker_tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            return;
        };
        session.set_model_change_handler(Some(Arc::new(
            move |event: &ModelChangeEvent| {
                let _ = tx.send(Task::ModelChange(event.clone()));
            },
        )));
    }

    fn on_reconnect_completed(&self, outcome: ReconnectOutcome) {
        self.reconnects_completed.fetch_add(1, Ordering::Relaxed);
        // Writes buffered during the outage go out first, in order.
        self.pipeline.flush(Vec::new());
        if outcome == ReconnectOutcome::Replaced {
            if let Some(session) = self.slot.load() {
                self.install_model_change_handler(&session);
            }
        }
        // Structural changes missed during the outage.
        self.receiver.resync();
        let observers = self.reconnected_observers.lock().unwrap().clone();
        for observer in observers {
            observer();
        }
    }

    fn on_health_tick(&self) {
        self.health.tick();

        let connected = self
            .slot
            .load()
            .map(|session| session.is_connected())
            .unwrap_or(false);
        if !connected && !self.sessions.is_reconnecting() {
            // Dead session and nobody working on it: the automatic
            // handler has given up.
            self.recover();
            return;
        }
        let stalled_for = self.sessions.note_health_tick();
        if stalled_for > self.stall_threshold
            && self.sessions.try_force_reset_if_stalled()
        {
            self.recover();
        }
    }

    /// Manual recovery: fresh session, fresh subscriptions, resumed
    /// polling, flushed queue.
    fn recover(&self) {
        self.session_recreations.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.reset();
        let session = match self.sessions.create() {
            Ok(session) => session,
            Err(status) => {
                warn!(%status, "session recreation failed, will retry");
                return;
            }
        };
        self.install_model_change_handler(&session);
        let planned = self.loader.replan();
        info!(items = planned.len(), "recreating subscriptions");
        if let Err(status) = self.subscriptions.create_all(&session, planned)
        {
            warn!(%status, "recreating subscriptions failed");
        }
        self.polling.start();
        self.pipeline.flush(Vec::new());
    }

    /// A structural change made by local code. With publishing enabled,
    /// a detached subject's node is remembered so a resync does not
    /// re-materialise it before the server catches up.
    fn on_local_structural_change(&self, change: StructuralChange) {
        if !self.publishing {
            return;
        }
        match change {
            StructuralChange::Detached { child, .. } => {
                let Some(node_id) = self.registry.get_external_id(child)
                else {
                    return;
                };
                let orphaned = self.graph.with(|graph| {
                    graph
                        .subject(child)
                        .map(|entry| entry.parents().is_empty())
                        .unwrap_or(true)
                });
                if !orphaned {
                    return;
                }
                info!(node = %node_id, "local deletion, suppressing re-add");
                self.registry.mark_recently_deleted(node_id);
                self.loader.unregister(child);
            }
            StructuralChange::Attached { child, property, .. } => {
                debug!(
                    subject = %child,
                    property,
                    "local attach is not propagated to the server"
                );
            }
        }
    }
}

/// Find the property slot a node id is mapped to, with its scalar type.
fn find_mapped_property(
    graph: &GraphStore,
    node_id: &NodeId,
) -> Option<(PropertyRef, crate::graph::ScalarType)> {
    graph.with(|inner| {
        let subjects: Vec<SubjectId> =
            inner.subjects().map(|subject| subject.id()).collect();
        for subject in subjects {
            let entry = inner.subject(subject)?;
            for property in entry.properties() {
                if property.node_id(NODE_DATA_KEY) == Some(node_id) {
                    if let PropertyKind::Scalar(scalar) = property.kind() {
                        return Some((
                            PropertyRef::property(subject, property.name()),
                            scalar.clone(),
                        ));
                    }
                }
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Property, Value};
    use crate::sim::{SimConnector, SimServer};
    use crate::ua::{SubscriptionOptions, Variant};

    fn options() -> ClientOptions {
        ClientOptions {
            endpoint: EndpointOptions {
                server_url: "opc.tcp://sim".into(),
                application_name: "test".into(),
                session_timeout: Duration::from_secs(30),
                reconnect_interval: Duration::from_secs(1),
            },
            root_node: NodeId::numeric(0, 85),
            subscription: SubscriptionConfig {
                max_items_per_subscription: 100,
                options: SubscriptionOptions {
                    publishing_interval: Duration::from_millis(50),
                    keep_alive_count: 10,
                    lifetime_count: 30,
                    priority: 0,
                    max_notifications_per_publish: 0,
                },
            },
            monitoring_defaults: MonitoringParams::default(),
            monitoring_overrides: HashMap::new(),
            polling: PollingOptions {
                enabled: true,
                interval: Duration::from_millis(25),
                batch_size: 10,
                disposal_timeout: Duration::from_secs(1),
                breaker_threshold: 3,
                breaker_cooldown: Duration::from_secs(30),
            },
            write_queue_size: 32,
            write_flush_interval: Duration::from_millis(20),
            health_check_interval: Duration::from_secs(3600),
            stall_threshold: 3,
            enable_graph_change_publishing: false,
            loader: LoaderPolicy {
                add_dynamic_properties: true,
                add_dynamic_attributes: false,
            },
        }
    }

    struct Fixture {
        server: SimServer,
        connector: Arc<SimConnector>,
        graph: GraphStore,
        root: SubjectId,
        speed_node: NodeId,
    }

    fn plant() -> Fixture {
        let server = SimServer::new();
        let root_node = NodeId::numeric(0, 85);
        server.add_object(None, root_node.clone(), "Objects");
        let speed_node = NodeId::string(2, "Objects/Speed");
        server.add_variable(
            Some(&root_node),
            speed_node.clone(),
            "Speed",
            Variant::Double(1.0),
        );
        let connector = Arc::new(server.connector());
        let graph = GraphStore::new();
        let root = graph.create_subject("Root");
        Fixture {
            server,
            connector,
            graph,
            root,
            speed_node,
        }
    }

    fn start(fixture: &Fixture) -> ClientSource {
        ClientSource::start(
            Arc::clone(&fixture.connector) as Arc<dyn Connector>,
            fixture.graph.clone(),
            fixture.root,
            options(),
        )
        .unwrap()
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn mirrors_server_values_and_writes_back() {
        let fixture = plant();
        let source = start(&fixture);
        let speed = PropertyRef::property(fixture.root, "Speed");

        // Inbound: the initial value and a later change arrive.
        wait_for("initial value", || {
            fixture.graph.value(&speed) == Some(Value::Float(1.0))
        });
        fixture
            .server
            .set_value(&fixture.speed_node, Variant::Double(2.0));
        wait_for("changed value", || {
            fixture.graph.value(&speed) == Some(Value::Float(2.0))
        });

        // Outbound: a local set flows through the pipeline.
        fixture.graph.set_value(&speed, Value::Float(7.5)).unwrap();
        wait_for("server write", || {
            fixture.server.value(&fixture.speed_node)
                == Some(Variant::Double(7.5))
        });

        let metrics = source.metrics();
        assert!(metrics.connected);
        assert_eq!(metrics.subscription_count, 1);
        assert_eq!(metrics.monitored_item_count, 1);
        assert_eq!(metrics.write_queue_depth, 0);
        source.dispose();
    }

    #[test]
    fn reconnect_with_transfer_flushes_queued_writes() {
        let fixture = plant();
        let source = start(&fixture);
        let speed = PropertyRef::property(fixture.root, "Speed");
        wait_for("initial value", || {
            fixture.graph.value(&speed) == Some(Value::Float(1.0))
        });

        let (reconnected_tx, reconnected_rx) = mpsc::channel();
        source.on_reconnected(Arc::new(move || {
            let _ = reconnected_tx.send(());
        }));

        fixture.server.drop_session();
        wait_for("reconnecting", || source.metrics().reconnecting);

        // Writes during the outage are buffered, in order.
        fixture.graph.set_value(&speed, Value::Float(10.0)).unwrap();
        fixture.graph.set_value(&speed, Value::Float(11.0)).unwrap();
        wait_for("queued writes", || {
            source.metrics().write_queue_depth > 0
        });

        fixture
            .connector
            .sim_reconnect_handler()
            .complete_with_transfer();
        reconnected_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reconnection observer");

        wait_for("flushed queue", || {
            source.metrics().write_queue_depth == 0
        });
        wait_for("last write applied", || {
            fixture.server.value(&fixture.speed_node)
                == Some(Variant::Double(11.0))
        });
        let metrics = source.metrics();
        assert!(!metrics.reconnecting);
        // The transferred subscription was adopted, not recreated.
        assert_eq!(metrics.subscription_count, 1);
        assert_eq!(metrics.session_recreations, 0);
        assert_eq!(metrics.reconnects_completed, 1);

        // The fast path is rebound on the new session.
        fixture
            .server
            .set_value(&fixture.speed_node, Variant::Double(12.0));
        wait_for("post-transfer value", || {
            fixture.graph.value(&speed) == Some(Value::Float(12.0))
        });
        source.dispose();
    }

    #[test]
    fn stalled_reconnect_triggers_manual_recovery_once() {
        let fixture = plant();
        let source = start(&fixture);
        let speed = PropertyRef::property(fixture.root, "Speed");
        wait_for("initial value", || {
            fixture.graph.value(&speed) == Some(Value::Float(1.0))
        });

        fixture.server.drop_session();
        wait_for("reconnecting", || source.metrics().reconnecting);

        // The handler never completes; drive health ticks directly.
        for _ in 0..source.inner.stall_threshold {
            source.inner.on_health_tick();
        }
        assert_eq!(source.metrics().session_recreations, 0);
        source.inner.on_health_tick();

        let metrics = source.metrics();
        assert_eq!(metrics.session_recreations, 1);
        assert!(!metrics.reconnecting);
        assert!(metrics.connected);
        assert_eq!(metrics.subscription_count, 1);
        assert_eq!(metrics.monitored_item_count, 1);

        // The fresh stack is live.
        fixture
            .server
            .set_value(&fixture.speed_node, Variant::Double(4.0));
        wait_for("post-recovery value", || {
            fixture.graph.value(&speed) == Some(Value::Float(4.0))
        });
        source.dispose();
    }

    #[test]
    fn dead_session_without_reconnect_recovers() {
        let fixture = plant();
        let source = start(&fixture);
        wait_for("connected", || source.metrics().connected);

        fixture.server.drop_session();
        wait_for("reconnecting", || source.metrics().reconnecting);
        fixture.connector.sim_reconnect_handler().complete_failed();
        wait_for("not reconnecting", || !source.metrics().reconnecting);

        source.inner.on_health_tick();
        let metrics = source.metrics();
        assert_eq!(metrics.session_recreations, 1);
        assert!(metrics.connected);
        source.dispose();
    }

    #[test]
    fn model_change_events_flow_through_the_worker() {
        let fixture = plant();
        fixture
            .graph
            .define_property(fixture.root, Property::collection("Motors"));
        let motors = NodeId::string(2, "Objects/Motors");
        fixture.server.add_object(
            Some(&NodeId::numeric(0, 85)),
            motors.clone(),
            "Motors",
        );
        let source = start(&fixture);
        wait_for("connected", || source.metrics().connected);

        // Growing the collection on the live server announces the node;
        // the worker materialises it.
        let motor = NodeId::string(2, "Objects/Motors[0]");
        fixture
            .server
            .add_object(Some(&motors), motor.clone(), "Motors[0]");
        let property = PropertyRef::property(fixture.root, "Motors");
        wait_for("element materialised", || {
            fixture
                .graph
                .with(|graph| graph.collection_items(&property))
                .map(|items| items.len() == 1)
                .unwrap_or(false)
        });
        source.dispose();
    }

    #[test]
    fn initial_connection_failure_surfaces() {
        let fixture = plant();
        fixture.connector.fail_next_connects(1);
        let result = ClientSource::start(
            Arc::clone(&fixture.connector) as Arc<dyn Connector>,
            fixture.graph.clone(),
            fixture.root,
            options(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn dispose_is_idempotent_and_clears_property_data() {
        let fixture = plant();
        let source = start(&fixture);
        let speed = PropertyRef::property(fixture.root, "Speed");
        wait_for("initial value", || {
            fixture.graph.value(&speed) == Some(Value::Float(1.0))
        });

        source.dispose();
        source.dispose();
        fixture.graph.with(|graph| {
            let slot = graph.property(&speed).unwrap();
            assert!(slot.node_id(NODE_DATA_KEY).is_none());
            assert!(slot.owner().is_none());
        });
    }
}
