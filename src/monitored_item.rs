//! Construction of monitored-item descriptors.

use std::collections::HashMap;
use std::time::Duration;

use crate::ua::{
    DataChangeFilter, DataChangeTrigger, DeadbandType, MonitoredItemRequest,
    NodeId,
};

/// Baked-in fallbacks, used only where neither the node override nor the
/// global defaults say anything.
const LIBRARY_SAMPLING_INTERVAL: Duration = Duration::from_secs(1);
const LIBRARY_QUEUE_SIZE: u32 = 1;
const LIBRARY_DISCARD_OLDEST: bool = true;

/// Monitoring parameters, each field optional so that unset fields defer
/// to the next tier.
#[derive(Debug, Clone, Default)]
pub struct MonitoringParams {
    pub sampling_interval: Option<Duration>,
    pub queue_size: Option<u32>,
    pub discard_oldest: Option<bool>,
    pub trigger: Option<DataChangeTrigger>,
    pub deadband_type: Option<DeadbandType>,
    pub deadband_value: Option<f64>,
}

/// Builds [`MonitoredItemRequest`]s by layering per-node configuration
/// over global defaults over library defaults.
pub struct MonitoredItemFactory {
    defaults: MonitoringParams,
    overrides: HashMap<NodeId, MonitoringParams>,
}

impl MonitoredItemFactory {
    pub fn new(
        defaults: MonitoringParams,
        overrides: HashMap<NodeId, MonitoringParams>,
    ) -> Self {
        MonitoredItemFactory {
            defaults,
            overrides,
        }
    }

    pub fn build(&self, node: &NodeId) -> MonitoredItemRequest {
        let node_params = self.overrides.get(node);
        let pick = |f: fn(&MonitoringParams) -> Option<Duration>| {
            node_params.and_then(f).or_else(|| f(&self.defaults))
        };
        let sampling_interval = pick(|p| p.sampling_interval)
            .unwrap_or(LIBRARY_SAMPLING_INTERVAL);
        let queue_size = node_params
            .and_then(|p| p.queue_size)
            .or(self.defaults.queue_size)
            .unwrap_or(LIBRARY_QUEUE_SIZE);
        let discard_oldest = node_params
            .and_then(|p| p.discard_oldest)
            .or(self.defaults.discard_oldest)
            .unwrap_or(LIBRARY_DISCARD_OLDEST);

        let trigger = node_params
            .and_then(|p| p.trigger)
            .or(self.defaults.trigger);
        let deadband_type = node_params
            .and_then(|p| p.deadband_type)
            .or(self.defaults.deadband_type);
        let deadband_value = node_params
            .and_then(|p| p.deadband_value)
            .or(self.defaults.deadband_value);

        // A filter is attached only when some filter option is set.
        let filter = if trigger.is_some()
            || deadband_type.is_some()
            || deadband_value.is_some()
        {
            Some(DataChangeFilter {
                trigger: trigger.unwrap_or(DataChangeTrigger::StatusValue),
                deadband_type: deadband_type.unwrap_or(DeadbandType::None),
                deadband_value: deadband_value.unwrap_or(0.0),
            })
        } else {
            None
        };

        MonitoredItemRequest {
            node_id: node.clone(),
            sampling_interval,
            queue_size,
            discard_oldest,
            filter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::string(2, "Plant/Motor/Speed")
    }

    #[test]
    fn library_defaults_apply_when_nothing_is_configured() {
        let factory =
            MonitoredItemFactory::new(MonitoringParams::default(), [].into());
        let request = factory.build(&node());
        assert_eq!(request.sampling_interval, LIBRARY_SAMPLING_INTERVAL);
        assert_eq!(request.queue_size, LIBRARY_QUEUE_SIZE);
        assert!(request.discard_oldest);
        assert!(request.filter.is_none());
    }

    #[test]
    fn node_overrides_win_over_global_defaults() {
        let defaults = MonitoringParams {
            sampling_interval: Some(Duration::from_millis(500)),
            queue_size: Some(10),
            ..Default::default()
        };
        let overrides = HashMap::from([(
            node(),
            MonitoringParams {
                sampling_interval: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )]);
        let factory = MonitoredItemFactory::new(defaults, overrides);
        let request = factory.build(&node());
        assert_eq!(request.sampling_interval, Duration::from_millis(100));
        // Unset override fields fall through to the globals.
        assert_eq!(request.queue_size, 10);
    }

    #[test]
    fn any_filter_option_produces_a_filter() {
        let defaults = MonitoringParams {
            deadband_value: Some(0.5),
            ..Default::default()
        };
        let factory = MonitoredItemFactory::new(defaults, [].into());
        let filter = factory.build(&node()).filter.unwrap();
        assert_eq!(filter.trigger, DataChangeTrigger::StatusValue);
        assert_eq!(filter.deadband_type, DeadbandType::None);
        assert_eq!(filter.deadband_value, 0.5);
    }
}
