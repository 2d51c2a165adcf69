use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::framer::FlattenOptions;
use crate::sink::OverflowPolicy;

// ═══════════════════════════════════════════════════════════════
//  Datasource settings — raw jsonData as stored by Grafana
// ═══════════════════════════════════════════════════════════════

/// Datasource `jsonData` exactly as the config editor stores it.
///
/// Converted into [`BridgeConfig`] by [`BridgeConfig::from_settings`];
/// nothing outside this module reads the raw form.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasourceSettings {
    #[serde(default)]
    host: String,
    #[serde(default = "default_stream_port")]
    stream_port: u16,
    #[serde(default = "default_amqp_port")]
    amqp_port: u16,
    #[serde(default = "default_vhost")]
    v_host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    tls_connection: bool,
    /// Seconds.
    #[serde(default = "default_heartbeat_secs")]
    requested_heartbeat: u64,
    #[serde(default)]
    requested_max_frame_size: u32,
    #[serde(default)]
    write_buffer: usize,
    #[serde(default)]
    read_buffer: usize,
    #[serde(default)]
    no_delay: bool,
    #[serde(default)]
    load_balancer_mode: bool,
    #[serde(default)]
    stream_options: StreamSettings,
    #[serde(default)]
    exchanges_options: Vec<ExchangeOptions>,
    #[serde(default)]
    bindings_options: Vec<BindingOptions>,
    #[serde(default = "default_flatten_depth")]
    flatten_depth: usize,
    #[serde(default = "default_flatten_separator")]
    flatten_separator: String,
    #[serde(default = "default_delivery_buffer")]
    delivery_buffer: usize,
    #[serde(default = "default_overflow")]
    overflow: OverflowPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamSettings {
    #[serde(default)]
    stream_name: String,
    /// Nanoseconds, 0 = unlimited.
    #[serde(default)]
    max_age: u64,
    #[serde(default)]
    max_length_bytes: u64,
    #[serde(default)]
    max_segment_size_bytes: u64,
    #[serde(default)]
    consumer_name: String,
    #[serde(default)]
    offset_from_start: bool,
    #[serde(default)]
    crc: bool,
    #[serde(default)]
    should_dispose_stream: bool,
}

fn default_stream_port() -> u16 {
    5552
}
fn default_amqp_port() -> u16 {
    5672
}
fn default_vhost() -> String {
    "/".into()
}
fn default_heartbeat_secs() -> u64 {
    60
}
fn default_flatten_depth() -> usize {
    1
}
fn default_flatten_separator() -> String {
    ".".into()
}
fn default_delivery_buffer() -> usize {
    1024
}
fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::BackPressure
}

/// Fixed pause between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ═══════════════════════════════════════════════════════════════
//  Connection
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    /// Stream protocol port (data plane).
    pub stream_port: u16,
    /// AMQP 0.9.1 port (control plane: exchanges, bindings).
    pub amqp_port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub heartbeat: Duration,
    pub max_frame_size: u32,
    pub write_buffer: usize,
    pub read_buffer: usize,
    pub no_delay: bool,
    /// Broker sits behind a load balancer: stream clients reconnect until
    /// they land on the node that owns the stream.
    pub load_balancer_mode: bool,
}

impl ConnectionConfig {
    /// AMQP URI for the control-plane connection.
    pub fn amqp_uri(&self) -> String {
        let scheme = if self.tls { "amqps" } else { "amqp" };
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!(
            "{scheme}://{}:{}@{}:{}/{vhost}",
            self.username, self.password, self.host, self.amqp_port,
        )
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("stream_port", &self.stream_port)
            .field("amqp_port", &self.amqp_port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"***")
            .field("tls", &self.tls)
            .field("heartbeat", &self.heartbeat)
            .field("load_balancer_mode", &self.load_balancer_mode)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Stream
// ═══════════════════════════════════════════════════════════════

/// Where a fresh subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetPolicy {
    FromStart,
    FromLatest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub name: String,
    pub max_age: Option<Duration>,
    pub max_length_bytes: Option<u64>,
    pub max_segment_bytes: Option<u64>,
    pub consumer_name: String,
    pub offset: OffsetPolicy,
    /// Verify chunk checksums on delivery.
    pub crc: bool,
    /// Delete the stream when the supervisor is disposed.
    pub dispose_on_close: bool,
}

impl StreamDescriptor {
    /// Descriptor with no retention limits and the default consumer name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            consumer_name: format!("{name}_consumer"),
            name,
            max_age: None,
            max_length_bytes: None,
            max_segment_bytes: None,
            offset: OffsetPolicy::FromLatest,
            crc: false,
            dispose_on_close: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Topology
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOptions {
    pub name: String,
    /// `direct`, `fanout`, `topic`, `headers` or any custom plugin type.
    #[serde(default = "default_exchange_kind", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_deleted: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub should_dispose_exchange: bool,
    #[serde(default)]
    pub dispose_if_unused: bool,
}

fn default_exchange_kind() -> String {
    "direct".into()
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingOptions {
    /// Source exchange.
    pub sender_name: String,
    #[serde(default)]
    pub routing_key: String,
    /// Destination queue or exchange.
    pub receiver_name: String,
    #[serde(default)]
    pub no_wait: bool,
    #[serde(default)]
    pub is_queue_binding: bool,
    #[serde(default)]
    pub should_dispose_binding: bool,
}

impl BindingOptions {
    pub fn receiver_kind(&self) -> &'static str {
        if self.is_queue_binding { "queue" } else { "exchange" }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeOptions>,
    pub bindings: Vec<BindingOptions>,
}

// ═══════════════════════════════════════════════════════════════
//  BridgeConfig
// ═══════════════════════════════════════════════════════════════

/// Всё, что нужно супервизору и ingestion loop'у для одного datasource.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub connection: ConnectionConfig,
    pub stream: StreamDescriptor,
    pub topology: Topology,
    pub flatten: FlattenOptions,
    pub reconnect_delay: Duration,
    /// Capacity of the delivery channel between the consumer and the loop.
    pub delivery_buffer: usize,
    pub overflow: OverflowPolicy,
}

impl BridgeConfig {
    /// Build from Grafana's `jsonData` and the decrypted secure password.
    pub fn from_settings(
        json_data: &serde_json::Value,
        password: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let raw: DatasourceSettings = serde_json::from_value(json_data.clone())?;

        if raw.host.trim().is_empty() {
            return Err(ConfigError::Missing("host"));
        }
        let stream = raw.stream_options;
        if stream.stream_name.trim().is_empty() {
            return Err(ConfigError::Missing("streamOptions.streamName"));
        }
        if raw.delivery_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "deliveryBuffer",
                detail: "must be greater than zero".into(),
            });
        }
        if raw.flatten_depth > 1 && raw.flatten_separator.is_empty() {
            return Err(ConfigError::Invalid {
                field: "flattenSeparator",
                detail: "an explicit separator is required when flattenDepth > 1".into(),
            });
        }

        let consumer_name = if stream.consumer_name.is_empty() {
            format!("{}_consumer", stream.stream_name)
        } else {
            stream.consumer_name
        };

        Ok(Self {
            connection: ConnectionConfig {
                host: raw.host,
                stream_port: raw.stream_port,
                amqp_port: raw.amqp_port,
                vhost: raw.v_host,
                username: raw.username,
                password: password.unwrap_or_default().to_string(),
                tls: raw.tls_connection,
                heartbeat: Duration::from_secs(raw.requested_heartbeat),
                max_frame_size: raw.requested_max_frame_size,
                write_buffer: raw.write_buffer,
                read_buffer: raw.read_buffer,
                no_delay: raw.no_delay,
                load_balancer_mode: raw.load_balancer_mode,
            },
            stream: StreamDescriptor {
                name: stream.stream_name,
                max_age: non_zero(stream.max_age).map(Duration::from_nanos),
                max_length_bytes: non_zero(stream.max_length_bytes),
                max_segment_bytes: non_zero(stream.max_segment_size_bytes),
                consumer_name,
                offset: if stream.offset_from_start {
                    OffsetPolicy::FromStart
                } else {
                    OffsetPolicy::FromLatest
                },
                crc: stream.crc,
                dispose_on_close: stream.should_dispose_stream,
            },
            topology: Topology {
                exchanges: raw.exchanges_options,
                bindings: raw.bindings_options,
            },
            flatten: FlattenOptions {
                depth: raw.flatten_depth.max(1),
                separator: raw.flatten_separator,
            },
            reconnect_delay: RECONNECT_DELAY,
            delivery_buffer: raw.delivery_buffer,
            overflow: raw.overflow,
        })
    }
}

fn non_zero(v: u64) -> Option<u64> {
    (v != 0).then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_settings_apply_defaults() {
        let cfg = BridgeConfig::from_settings(
            &json!({"host": "rabbit", "streamOptions": {"streamName": "rabbitmq.stream"}}),
            Some("secret"),
        )
        .unwrap();

        assert_eq!(cfg.connection.stream_port, 5552);
        assert_eq!(cfg.connection.amqp_port, 5672);
        assert_eq!(cfg.connection.vhost, "/");
        assert_eq!(cfg.connection.password, "secret");
        assert_eq!(cfg.connection.heartbeat, Duration::from_secs(60));
        assert_eq!(cfg.stream.consumer_name, "rabbitmq.stream_consumer");
        assert_eq!(cfg.stream.offset, OffsetPolicy::FromLatest);
        assert_eq!(cfg.stream.max_age, None);
        assert_eq!(cfg.flatten.depth, 1);
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(2));
        assert_eq!(cfg.overflow, OverflowPolicy::BackPressure);
        assert!(!cfg.connection.load_balancer_mode);
    }

    #[test]
    fn test_load_balancer_mode_opt_in() {
        let cfg = BridgeConfig::from_settings(
            &json!({"host": "h", "loadBalancerMode": true, "streamOptions": {"streamName": "s"}}),
            None,
        )
        .unwrap();
        assert!(cfg.connection.load_balancer_mode);
    }

    #[test]
    fn test_full_settings() {
        let cfg = BridgeConfig::from_settings(
            &json!({
                "host": "rabbit",
                "streamPort": 5553,
                "vHost": "metrics",
                "username": "grafana",
                "tlsConnection": true,
                "requestedHeartbeat": 10,
                "streamOptions": {
                    "streamName": "s",
                    "maxAge": 3_600_000_000_000u64,
                    "maxLengthBytes": 1024,
                    "consumerName": "dash",
                    "offsetFromStart": true,
                    "crc": true
                },
                "exchangesOptions": [{"name": "ex", "type": "topic", "durable": true}],
                "bindingsOptions": [{"senderName": "ex", "routingKey": "#", "receiverName": "s", "isQueueBinding": true}]
            }),
            None,
        )
        .unwrap();

        assert_eq!(cfg.connection.stream_port, 5553);
        assert!(cfg.connection.tls);
        assert_eq!(cfg.stream.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.stream.max_length_bytes, Some(1024));
        assert_eq!(cfg.stream.max_segment_bytes, None);
        assert_eq!(cfg.stream.consumer_name, "dash");
        assert_eq!(cfg.stream.offset, OffsetPolicy::FromStart);
        assert_eq!(cfg.topology.exchanges[0].kind, "topic");
        assert_eq!(cfg.topology.bindings[0].receiver_kind(), "queue");
        assert_eq!(cfg.connection.amqp_uri(), "amqps://grafana:@rabbit:5672/metrics");
    }

    #[test]
    fn test_missing_host_rejected() {
        let err = BridgeConfig::from_settings(&json!({"streamOptions": {"streamName": "s"}}), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("host")));
    }

    #[test]
    fn test_missing_stream_name_rejected() {
        let err = BridgeConfig::from_settings(&json!({"host": "h"}), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("streamOptions.streamName")));
    }

    #[test]
    fn test_deep_flatten_requires_separator() {
        let err = BridgeConfig::from_settings(
            &json!({
                "host": "h",
                "streamOptions": {"streamName": "s"},
                "flattenDepth": 3,
                "flattenSeparator": ""
            }),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "flattenSeparator", .. }));
    }

    #[test]
    fn test_default_vhost_is_escaped_in_uri() {
        let cfg = BridgeConfig::from_settings(
            &json!({"host": "h", "username": "u", "streamOptions": {"streamName": "s"}}),
            Some("p"),
        )
        .unwrap();
        assert_eq!(cfg.connection.amqp_uri(), "amqp://u:p@h:5672/%2f");
    }

    #[test]
    fn test_password_hidden_in_debug() {
        let cfg = BridgeConfig::from_settings(
            &json!({"host": "h", "streamOptions": {"streamName": "s"}}),
            Some("hunter2"),
        )
        .unwrap();
        assert!(!format!("{:?}", cfg.connection).contains("hunter2"));
    }
}
