// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the edge functions SDK.
//!
//! This crate provides [`ServiceConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, applying environment
//! overrides (with insecure-secret redaction in logs), and parsing duration
//! strings like `"10s"` or `"1m"`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "EDGE_FDK_";

/// Base topic prefix applied when the message bus section leaves it empty.
pub const DEFAULT_BASE_TOPIC_PREFIX: &str = "edge";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while assembling a service's configuration from its TOML
/// file and the `EDGE_FDK_*` environment overlay.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML file could not be read from disk.
    #[error("cannot read service configuration at {path}")]
    Unreadable {
        /// Path that was attempted.
        path: String,
        /// The underlying filesystem error.
        #[source]
        source: std::io::Error,
    },

    /// The content did not deserialize into [`ServiceConfig`].
    #[error("service configuration is malformed: {detail}")]
    Malformed {
        /// What the TOML deserializer objected to.
        detail: String,
    },

    /// The merged settings (file plus environment overlay) break a
    /// constraint the types cannot express.
    #[error("service configuration rejected: {}", problems.join("; "))]
    Rejected {
        /// Every violated constraint, one entry each.
        problems: Vec<String>,
    },

    /// A custom (non-SDK) section was requested but is not in the file.
    #[error("service configuration has no '{section}' section")]
    MissingSection {
        /// Name of the absent section.
        section: String,
    },

    /// A duration setting such as a retry interval did not parse.
    #[error("duration '{input}' {problem}; use a digits-plus-unit form such as \"500ms\", \"10s\", \"5m\", or \"1h\"")]
    BadDuration {
        /// The offending input.
        input: String,
        /// What is wrong with it.
        problem: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// A configuration section the SDK does not interpret itself.
pub type CustomSection = toml::Value;

/// Top-level runtime configuration for an application service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Settings that may change at runtime.
    pub writable: WritableConfig,
    /// The service's own host/port identity.
    pub service: ServiceInfo,
    /// Message bus connection settings.
    pub message_bus: MessageBusConfig,
    /// Trigger selection and topics.
    pub trigger: TriggerConfig,
    /// Free-form application settings exposed to user code.
    pub application_settings: HashMap<String, String>,
    /// Store-and-forward database settings.
    pub database: DatabaseConfig,
    /// Sections the SDK does not claim, kept for custom triggers and user
    /// code.
    #[serde(flatten)]
    pub custom: toml::map::Map<String, toml::Value>,
}

impl ServiceConfig {
    /// Fetch a custom (non-SDK) configuration section by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] when the section is absent.
    pub fn custom_section(&self, section_name: &str) -> Result<CustomSection, ConfigError> {
        self.custom
            .get(section_name)
            .cloned()
            .ok_or_else(|| ConfigError::MissingSection {
                section: section_name.to_string(),
            })
    }

    /// Fetch and deserialize a custom configuration section into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the section is absent or does not match
    /// `T`'s shape.
    pub fn custom_section_as<T: serde::de::DeserializeOwned>(
        &self,
        section_name: &str,
    ) -> Result<T, ConfigError> {
        self.custom_section(section_name)?
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Malformed {
                detail: format!("custom section '{section_name}': {e}"),
            })
    }
}

/// Settings that may change while the service runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WritableConfig {
    /// Log level: `error`, `warn`, `info`, `debug`, or `trace`.
    pub log_level: String,
    /// Store-and-forward behaviour.
    pub store_and_forward: StoreAndForwardConfig,
    /// Development-only secrets, keyed by an arbitrary block name.
    pub insecure_secrets: HashMap<String, InsecureSecretsBlock>,
}

impl Default for WritableConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            store_and_forward: StoreAndForwardConfig::default(),
            insecure_secrets: HashMap::new(),
        }
    }
}

/// One named block of development secrets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsecureSecretsBlock {
    /// Name the secret is fetched under.
    pub secret_name: String,
    /// The secret's key-value data.
    pub secret_data: HashMap<String, String>,
}

/// Store-and-forward behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreAndForwardConfig {
    /// Whether failed exports are persisted and retried.
    pub enabled: bool,
    /// Interval between retry passes (duration string, e.g. `"5m"`).
    pub retry_interval: String,
    /// Maximum retry attempts per stored object; `0` retries forever.
    pub max_retry_count: u32,
}

impl Default for StoreAndForwardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_interval: "5m".into(),
            max_retry_count: 10,
        }
    }
}

/// The service's own identity on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    /// Bind host for the web server.
    pub host: String,
    /// Bind port for the web server.
    pub port: u16,
    /// Maximum seconds to wait for a clean shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 59700,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Message bus connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Disables the bus entirely (HTTP-only services).
    pub disabled: bool,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Wire protocol identifier.
    pub protocol: String,
    /// Authentication mode for the broker connection.
    pub auth_mode: String,
    /// Secret name holding broker credentials.
    pub secret_name: String,
    /// Prefix prepended to every subscribe and publish topic.
    pub base_topic_prefix: String,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            host: "localhost".into(),
            port: 6379,
            protocol: "redis".into(),
            auth_mode: "none".into(),
            secret_name: String::new(),
            base_topic_prefix: String::new(),
        }
    }
}

impl MessageBusConfig {
    /// The effective base topic prefix (configured, or the default).
    #[must_use]
    pub fn base_topic_prefix(&self) -> &str {
        if self.base_topic_prefix.is_empty() {
            DEFAULT_BASE_TOPIC_PREFIX
        } else {
            &self.base_topic_prefix
        }
    }
}

/// Trigger selection and topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Trigger type: `messagebus`, `external-mqtt`, `http`, or a custom
    /// registered name. Matched case-insensitively.
    #[serde(rename = "type")]
    pub trigger_type: String,
    /// Comma-separated topics to subscribe to.
    pub subscribe_topics: String,
    /// Topic for pipeline responses; empty disables publishing. Supports
    /// `{key}` context placeholders.
    pub publish_topic: String,
    /// External MQTT broker settings, used by the `external-mqtt` trigger.
    pub external_mqtt: ExternalMqttConfig,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            trigger_type: "messagebus".into(),
            subscribe_topics: "events/#".into(),
            publish_topic: String::new(),
            external_mqtt: ExternalMqttConfig::default(),
        }
    }
}

/// External MQTT broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalMqttConfig {
    /// Broker URL, e.g. `tcp://broker.example.com:1883`.
    pub url: String,
    /// MQTT client id.
    pub client_id: String,
    /// Connect timeout (duration string).
    pub connect_timeout: String,
    /// Whether the client reconnects automatically.
    pub auto_reconnect: bool,
    /// Seconds between keep-alive pings.
    pub keep_alive: u16,
    /// Quality of service for subscribes and publishes (0, 1, or 2).
    pub qos: u8,
    /// Whether published messages are retained.
    pub retain: bool,
    /// Skip server certificate verification.
    pub skip_cert_verify: bool,
    /// Secret name holding broker credentials.
    pub secret_name: String,
    /// Authentication mode: `none`, `usernamepassword`, `clientcert`, or
    /// `cacert`.
    pub auth_mode: String,
    /// Seconds to keep attempting the initial connection.
    pub retry_duration: u64,
    /// Seconds between initial connection attempts.
    pub retry_interval: u64,
    /// Last-will settings.
    pub will: WillConfig,
}

impl Default for ExternalMqttConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".into(),
            client_id: String::new(),
            connect_timeout: "30s".into(),
            auto_reconnect: true,
            keep_alive: 60,
            qos: 0,
            retain: false,
            skip_cert_verify: false,
            secret_name: String::new(),
            auth_mode: "none".into(),
            retry_duration: 600,
            retry_interval: 5,
            will: WillConfig::default(),
        }
    }
}

/// Last-will settings for the MQTT trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WillConfig {
    /// Enables the last-will message.
    pub enabled: bool,
    /// Will payload.
    pub payload: String,
    /// Will QoS.
    pub qos: u8,
    /// Will retained flag.
    pub retained: bool,
    /// Topic the will is published to.
    pub topic: String,
}

/// Store-and-forward database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Engine identifier; only `sqlite` is built in.
    #[serde(rename = "type")]
    pub db_type: String,
    /// Database file path.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: "sqlite".into(),
            path: "./store_forward.db".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Load a [`ServiceConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, starts from [`ServiceConfig::default()`].
///
/// Environment overrides are applied on top in both cases, then the result
/// is validated.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file is missing, unparsable, or the
/// merged result fails validation.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|e| ConfigError::Unreadable {
                path: p.display().to_string(),
                source: e,
            })?;
            parse_toml(&content)?
        }
        None => ServiceConfig::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Parse a TOML string into a [`ServiceConfig`].
///
/// # Errors
///
/// Returns [`ConfigError::Malformed`] on TOML that does not match the
/// configuration shape.
pub fn parse_toml(content: &str) -> Result<ServiceConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Malformed {
        detail: e.to_string(),
    })
}

/// Validate semantic constraints the type system cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::Rejected`] listing every violation.
pub fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
    let mut problems = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.writable.log_level.as_str()) {
        problems.push(format!(
            "unknown log level '{}' (expected one of {VALID_LOG_LEVELS:?})",
            config.writable.log_level
        ));
    }
    if config.trigger.external_mqtt.qos > 2 {
        problems.push(format!(
            "invalid MQTT QoS {} (expected 0, 1, or 2)",
            config.trigger.external_mqtt.qos
        ));
    }
    if config.writable.store_and_forward.enabled
        && parse_duration(&config.writable.store_and_forward.retry_interval).is_err()
    {
        problems.push(format!(
            "unparsable store-and-forward retry interval '{}'",
            config.writable.store_and_forward.retry_interval
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Rejected { problems })
    }
}

/// Apply `EDGE_FDK_*` environment overrides on top of `config`.
///
/// Every applied override is logged; values whose variable names mark them
/// as secret material are redacted in the log line.
pub fn apply_env_overrides(config: &mut ServiceConfig) {
    if let Some(v) = env_override("LOG_LEVEL") {
        config.writable.log_level = v;
    }
    if let Some(v) = env_override("TRIGGER_TYPE") {
        config.trigger.trigger_type = v;
    }
    if let Some(v) = env_override("TRIGGER_SUBSCRIBE_TOPICS") {
        config.trigger.subscribe_topics = v;
    }
    if let Some(v) = env_override("TRIGGER_PUBLISH_TOPIC") {
        config.trigger.publish_topic = v;
    }
    if let Some(v) = env_override("SERVICE_HOST") {
        config.service.host = v;
    }
    if let Some(v) = env_override("SERVICE_PORT") {
        if let Ok(port) = v.parse() {
            config.service.port = port;
        }
    }
    if let Some(v) = env_override("STORE_AND_FORWARD_ENABLED") {
        config.writable.store_and_forward.enabled = v.eq_ignore_ascii_case("true");
    }
    if let Some(v) = env_override("STORE_AND_FORWARD_RETRY_INTERVAL") {
        config.writable.store_and_forward.retry_interval = v;
    }
    if let Some(v) = env_override("STORE_AND_FORWARD_MAX_RETRY_COUNT") {
        if let Ok(count) = v.parse() {
            config.writable.store_and_forward.max_retry_count = count;
        }
    }
    if let Some(v) = env_override("DATABASE_PATH") {
        config.database.path = v;
    }
    if let Some(v) = env_override("MESSAGE_BUS_BASE_TOPIC_PREFIX") {
        config.message_bus.base_topic_prefix = v;
    }
}

fn env_override(suffix: &str) -> Option<String> {
    let name = format!("{ENV_PREFIX}{suffix}");
    let value = std::env::var(&name).ok()?;
    let shown = if suffix.contains("SECRET") {
        "<redacted>"
    } else {
        value.as_str()
    };
    info!(target: "fdk.config", variable = %name, value = %shown, "applying environment override");
    Some(value)
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a duration string of the form `"500ms"`, `"10s"`, `"5m"`, or
/// `"1h"`.
///
/// # Errors
///
/// Returns [`ConfigError::BadDuration`] for anything else.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let err = |problem: &'static str| ConfigError::BadDuration {
        input: value.to_string(),
        problem,
    };

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| err("has no unit suffix"))?;
    let (digits, unit) = value.split_at(split);
    let quantity: u64 = digits.parse().map_err(|_| err("has no leading digits"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(quantity),
        "s" => Duration::from_secs(quantity),
        "m" => Duration::from_secs(quantity * 60),
        "h" => Duration::from_secs(quantity * 3600),
        _ => return Err(err("carries an unrecognised unit")),
    };
    Ok(duration)
}
