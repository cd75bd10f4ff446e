//! Runtime configuration.
//!
//! A `ConfigFile` is what `uamirror.toml` deserialises into; it gets
//! baked into [`Config`], which carries the strongly-typed options the
//! client source consumes. Command-line arguments override file values.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::client::ClientOptions;
use crate::loader::LoaderPolicy;
use crate::monitored_item::MonitoringParams;
use crate::opt::Opt;
use crate::polling::PollingOptions;
use crate::subscription::SubscriptionConfig;
use crate::ua::{
    DataChangeTrigger, DeadbandType, EndpointOptions, NodeId,
    SubscriptionOptions,
};

/// Baked runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub client: ClientOptions,
}

/// Represents a configuration deserialized from a file. This gets baked
/// into a [`Config`], which, for example, has durations instead of
/// millisecond counts and parsed node identifiers.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    server_url: Option<String>,
    #[serde(default = "default_application_name")]
    application_name: String,
    #[serde(default = "default_root_node")]
    root_node: String,
    #[serde(default = "default_session_timeout_ms")]
    session_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    reconnect_interval_ms: u64,
    #[serde(default = "default_reconnect_handler_timeout_ms")]
    reconnect_handler_timeout_ms: u64,
    #[serde(default = "default_maximum_items_per_subscription")]
    maximum_items_per_subscription: usize,
    #[serde(default = "default_publishing_interval_ms")]
    default_publishing_interval_ms: u64,
    default_sampling_interval_ms: Option<u64>,
    default_queue_size: Option<u32>,
    default_discard_oldest: Option<bool>,
    default_data_change_trigger: Option<DataChangeTrigger>,
    default_deadband_type: Option<DeadbandType>,
    default_deadband_value: Option<f64>,
    #[serde(default = "default_keep_alive_count")]
    subscription_keep_alive_count: u32,
    #[serde(default = "default_lifetime_count")]
    subscription_lifetime_count: u32,
    #[serde(default)]
    subscription_priority: u8,
    #[serde(default)]
    subscription_max_notifications_per_publish: u32,
    #[serde(default = "default_write_queue_size")]
    write_queue_size: usize,
    #[serde(default = "default_write_flush_interval_ms")]
    write_flush_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    subscription_health_check_interval_ms: u64,
    #[serde(default = "default_true")]
    enable_polling_fallback: bool,
    #[serde(default = "default_polling_interval_ms")]
    polling_interval_ms: u64,
    #[serde(default = "default_polling_batch_size")]
    polling_batch_size: usize,
    #[serde(default = "default_polling_disposal_timeout_ms")]
    polling_disposal_timeout_ms: u64,
    #[serde(default = "default_polling_breaker_threshold")]
    polling_circuit_breaker_threshold: u32,
    #[serde(default = "default_polling_breaker_cooldown_ms")]
    polling_circuit_breaker_cooldown_ms: u64,
    #[serde(default)]
    enable_graph_change_publishing: bool,
    #[serde(default = "default_true")]
    add_dynamic_properties: bool,
    #[serde(default = "default_true")]
    add_dynamic_attributes: bool,
    /// Per-node monitoring overrides, keyed by node id string.
    #[serde(default)]
    nodes: HashMap<String, NodeOverrides>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct NodeOverrides {
    sampling_interval_ms: Option<u64>,
    queue_size: Option<u32>,
    discard_oldest: Option<bool>,
    data_change_trigger: Option<DataChangeTrigger>,
    deadband_type: Option<DeadbandType>,
    deadband_value: Option<f64>,
}

fn default_application_name() -> String {
    String::from("uamirror")
}

fn default_root_node() -> String {
    // The standard Objects folder.
    String::from("ns=0;i=85")
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_reconnect_handler_timeout_ms() -> u64 {
    100_000
}

fn default_maximum_items_per_subscription() -> usize {
    1_000
}

fn default_publishing_interval_ms() -> u64 {
    500
}

fn default_keep_alive_count() -> u32 {
    10
}

fn default_lifetime_count() -> u32 {
    1_000
}

fn default_write_queue_size() -> usize {
    1_000
}

fn default_write_flush_interval_ms() -> u64 {
    100
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_polling_interval_ms() -> u64 {
    1_000
}

fn default_polling_batch_size() -> usize {
    100
}

fn default_polling_disposal_timeout_ms() -> u64 {
    5_000
}

fn default_polling_breaker_threshold() -> u32 {
    5
}

fn default_polling_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for ConfigFile {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

/// Default config file path: `$XDG_CONFIG_HOME/uamirror/uamirror.toml`
/// or `~/.config/uamirror/uamirror.toml`.
fn default_path() -> Option<PathBuf> {
    let base = env::var_os("XDG_CONFIG_HOME").map(PathBuf::from).or_else(
        || {
            env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
        },
    )?;
    Some(base.join("uamirror").join("uamirror.toml"))
}

impl Config {
    /// Load the config file (if any) and apply command-line overrides.
    pub fn load(opt: &Opt) -> anyhow::Result<Config> {
        let file = match &opt.config {
            Some(path) => {
                let contents = fs::read_to_string(path).with_context(|| {
                    format!("cannot read {}", path.display())
                })?;
                toml::from_str(&contents).with_context(|| {
                    format!("cannot parse {}", path.display())
                })?
            }
            None => match default_path().filter(|path| path.exists()) {
                Some(path) => {
                    let contents = fs::read_to_string(&path)
                        .with_context(|| {
                            format!("cannot read {}", path.display())
                        })?;
                    toml::from_str(&contents).with_context(|| {
                        format!("cannot parse {}", path.display())
                    })?
                }
                None => ConfigFile::default(),
            },
        };
        Config::bake(file, opt)
    }

    fn bake(file: ConfigFile, opt: &Opt) -> anyhow::Result<Config> {
        let server_url = opt
            .url
            .clone()
            .or(file.server_url)
            .ok_or_else(|| anyhow!("no server url configured"))?;
        let application_name = opt
            .application_name
            .clone()
            .unwrap_or(file.application_name);
        let root_node = NodeId::parse(&file.root_node)
            .ok_or_else(|| anyhow!("invalid root node {}", file.root_node))?;

        let mut monitoring_overrides = HashMap::new();
        for (key, overrides) in file.nodes {
            let node = NodeId::parse(&key)
                .ok_or_else(|| anyhow!("invalid node id {}", key))?;
            monitoring_overrides.insert(
                node,
                MonitoringParams {
                    sampling_interval: overrides
                        .sampling_interval_ms
                        .map(Duration::from_millis),
                    queue_size: overrides.queue_size,
                    discard_oldest: overrides.discard_oldest,
                    trigger: overrides.data_change_trigger,
                    deadband_type: overrides.deadband_type,
                    deadband_value: overrides.deadband_value,
                },
            );
        }

        // The handler timeout translates into whole health ticks.
        let stall_threshold = (file
            .reconnect_handler_timeout_ms
            .div_ceil(file.subscription_health_check_interval_ms.max(1))
            as u32)
            .max(1);

        Ok(Config {
            client: ClientOptions {
                endpoint: EndpointOptions {
                    server_url,
                    application_name,
                    session_timeout: Duration::from_millis(
                        file.session_timeout_ms,
                    ),
                    reconnect_interval: Duration::from_millis(
                        file.reconnect_interval_ms,
                    ),
                },
                root_node,
                subscription: SubscriptionConfig {
                    max_items_per_subscription: file
                        .maximum_items_per_subscription,
                    options: SubscriptionOptions {
                        publishing_interval: Duration::from_millis(
                            file.default_publishing_interval_ms,
                        ),
                        keep_alive_count: file.subscription_keep_alive_count,
                        lifetime_count: file.subscription_lifetime_count,
                        priority: file.subscription_priority,
                        max_notifications_per_publish: file
                            .subscription_max_notifications_per_publish,
                    },
                },
                monitoring_defaults: MonitoringParams {
                    sampling_interval: file
                        .default_sampling_interval_ms
                        .map(Duration::from_millis),
                    queue_size: file.default_queue_size,
                    discard_oldest: file.default_discard_oldest,
                    trigger: file.default_data_change_trigger,
                    deadband_type: file.default_deadband_type,
                    deadband_value: file.default_deadband_value,
                },
                monitoring_overrides,
                polling: PollingOptions {
                    enabled: file.enable_polling_fallback,
                    interval: Duration::from_millis(file.polling_interval_ms),
                    batch_size: file.polling_batch_size,
                    disposal_timeout: Duration::from_millis(
                        file.polling_disposal_timeout_ms,
                    ),
                    breaker_threshold: file.polling_circuit_breaker_threshold,
                    breaker_cooldown: Duration::from_millis(
                        file.polling_circuit_breaker_cooldown_ms,
                    ),
                },
                write_queue_size: file.write_queue_size,
                write_flush_interval: Duration::from_millis(
                    file.write_flush_interval_ms,
                ),
                health_check_interval: Duration::from_millis(
                    file.subscription_health_check_interval_ms,
                ),
                stall_threshold,
                enable_graph_change_publishing: file
                    .enable_graph_change_publishing,
                loader: LoaderPolicy {
                    add_dynamic_properties: file.add_dynamic_properties,
                    add_dynamic_attributes: file.add_dynamic_attributes,
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt_with_url() -> Opt {
        Opt {
            config: None,
            url: Some(String::from("opc.tcp://demo:4840")),
            application_name: None,
            simulate: false,
        }
    }

    #[test]
    fn defaults_bake() {
        let config =
            Config::bake(ConfigFile::default(), &opt_with_url()).unwrap();
        let client = &config.client;
        assert_eq!(client.endpoint.server_url, "opc.tcp://demo:4840");
        assert_eq!(client.root_node, NodeId::numeric(0, 85));
        assert_eq!(client.subscription.max_items_per_subscription, 1_000);
        assert!(client.polling.enabled);
        assert_eq!(client.write_queue_size, 1_000);
        // 100 s handler timeout over 10 s health ticks.
        assert_eq!(client.stall_threshold, 10);
        assert!(client.monitoring_defaults.sampling_interval.is_none());
    }

    #[test]
    fn file_values_and_node_overrides() {
        let file: ConfigFile = toml::from_str(
            r#"
            server_url = "opc.tcp://plant:4840"
            default_sampling_interval_ms = 250
            default_deadband_type = "absolute"
            default_deadband_value = 0.5
            enable_polling_fallback = false

            [nodes."ns=2;s=Plant/Motors[0]/Speed"]
            sampling_interval_ms = 50
            queue_size = 10
            "#,
        )
        .unwrap();
        let mut opt = opt_with_url();
        opt.url = None;
        let config = Config::bake(file, &opt).unwrap();
        let client = &config.client;
        assert_eq!(client.endpoint.server_url, "opc.tcp://plant:4840");
        assert_eq!(
            client.monitoring_defaults.sampling_interval,
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            client.monitoring_defaults.deadband_type,
            Some(DeadbandType::Absolute)
        );
        assert!(!client.polling.enabled);
        let node = NodeId::string(2, "Plant/Motors[0]/Speed");
        let overrides = client.monitoring_overrides.get(&node).unwrap();
        assert_eq!(
            overrides.sampling_interval,
            Some(Duration::from_millis(50))
        );
        assert_eq!(overrides.queue_size, Some(10));
    }

    #[test]
    fn cli_url_wins_over_file() {
        let file: ConfigFile =
            toml::from_str(r#"server_url = "opc.tcp://file:4840""#).unwrap();
        let config = Config::bake(file, &opt_with_url()).unwrap();
        assert_eq!(config.client.endpoint.server_url, "opc.tcp://demo:4840");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<ConfigFile, _> =
            toml::from_str(r#"server_uri = "typo""#);
        assert!(result.is_err());
    }

    #[test]
    fn missing_url_is_an_error() {
        let mut opt = opt_with_url();
        opt.url = None;
        assert!(Config::bake(ConfigFile::default(), &opt).is_err());
    }
}
