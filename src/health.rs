//! Periodic monitored-item health sweep.

use std::sync::Arc;

use crate::session::SessionSlot;
use crate::subscription::SubscriptionManager;

/// Walks the subscriptions on a timer and lets the subscription manager
/// evict or replace items that went bad after creation.
///
/// Classification is the subscription manager's: resource-exhaustion
/// failures stay in place so the server can recover, permanent failures
/// are evicted, transient ones are re-placed.
pub struct HealthMonitor {
    subscriptions: Arc<SubscriptionManager>,
    slot: Arc<SessionSlot>,
}

impl HealthMonitor {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        slot: Arc<SessionSlot>,
    ) -> Self {
        HealthMonitor {
            subscriptions,
            slot,
        }
    }

    /// One sweep. Driven by the coordinator's health loop.
    pub fn tick(&self) {
        let session = self.slot.load();
        let session = match &session {
            Some(session) if session.is_connected() => Some(session),
            _ => None,
        };
        self.subscriptions.heal(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::updater::{BufferPool, SubjectUpdater};
    use crate::graph::{GraphStore, Property, PropertyRef, ScalarType};
    use crate::polling::{PollingManager, PollingOptions};
    use crate::sim::SimServer;
    use crate::subscription::{PlannedItem, SubscriptionConfig};
    use crate::ua::{
        Connector, EndpointOptions, MonitoredItemRequest, NodeId, StatusCode,
        SubscriptionOptions, Variant,
    };
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn sweep_heals_items_that_failed_after_creation() {
        let server = SimServer::new();
        server.add_object(None, NodeId::numeric(0, 85), "Objects");
        let node = NodeId::string(2, "Plant/Pressure");
        server.add_variable(None, node.clone(), "Pressure", Variant::Double(5.0));

        let graph = GraphStore::new();
        let (tap, _rx) = mpsc::channel();
        let source = graph.register_source(tap);
        let updater = SubjectUpdater::spawn(
            graph.clone(),
            source,
            Arc::new(BufferPool::new(8)),
        );
        let subject = graph.create_subject("Pressure");
        graph.define_property(
            subject,
            Property::scalar("Pressure", ScalarType::Double),
        );

        let slot = Arc::new(SessionSlot::new());
        let polling = Arc::new(PollingManager::new(
            Arc::clone(&slot),
            updater.sender(),
            PollingOptions {
                enabled: false,
                interval: Duration::from_millis(100),
                batch_size: 10,
                disposal_timeout: Duration::from_secs(1),
                breaker_threshold: 3,
                breaker_cooldown: Duration::from_secs(30),
            },
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            updater.sender(),
            polling,
            SubscriptionConfig {
                max_items_per_subscription: 10,
                options: SubscriptionOptions {
                    publishing_interval: Duration::from_millis(100),
                    keep_alive_count: 10,
                    lifetime_count: 30,
                    priority: 0,
                    max_notifications_per_publish: 0,
                },
            },
        ));

        let endpoint = EndpointOptions {
            server_url: "opc.tcp://sim".into(),
            application_name: "test".into(),
            session_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
        };
        let session = server.connector().connect(&endpoint).unwrap();
        slot.replace(Some(session));
        let session = slot.load().unwrap();

        server.set_monitor_status(&node, StatusCode::BadOutOfService);
        subscriptions
            .create_all(
                &session,
                vec![PlannedItem {
                    property: PropertyRef::property(subject, "Pressure"),
                    scalar: ScalarType::Double,
                    request: MonitoredItemRequest {
                        node_id: node.clone(),
                        sampling_interval: Duration::from_millis(100),
                        queue_size: 1,
                        discard_oldest: true,
                        filter: None,
                    },
                }],
            )
            .unwrap();
        assert_eq!(subscriptions.monitored_item_count(), 0);

        let monitor =
            HealthMonitor::new(Arc::clone(&subscriptions), Arc::clone(&slot));
        // Still failing: the sweep changes nothing.
        monitor.tick();
        assert_eq!(subscriptions.monitored_item_count(), 0);

        server.set_monitor_status(&node, StatusCode::Good);
        monitor.tick();
        assert_eq!(subscriptions.monitored_item_count(), 1);
    }
}
