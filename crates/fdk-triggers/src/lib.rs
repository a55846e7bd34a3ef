// SPDX-License-Identifier: MIT OR Apache-2.0
//! fdk-triggers
//!
//! Adapts transports into pipeline invocations.
//!
//! A trigger turns transport-specific messages into [`MessageEnvelope`]s and
//! hands them to the trigger message processor, which fans each message out
//! to every matching pipeline. Three transports are built in:
//!
//! - [`http::HttpTrigger`] — one POST route, default pipeline only
//! - [`messagebus::MessageBusTrigger`] — per-topic queue workers over the
//!   service's messaging client
//! - [`mqtt::MqttTrigger`] — an external MQTT broker connection
//!
//! Triggers never touch the runtime directly; they consume the
//! [`binding::ServiceBinding`] seam.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Trigger-service binding and the trigger message processor.
pub mod binding;
/// HTTP POST trigger.
pub mod http;
/// Message-bus trigger.
pub mod messagebus;
/// External-MQTT trigger.
pub mod mqtt;

use fdk_core::sync::{CancellationToken, WaitGroup};
use fdk_error::FdkResult;

pub use binding::{
    DefaultMessageProcessor, DefaultServiceBinding, MessageProcessor, ResponseHandler,
    ServiceBinding,
};

/// Built-in trigger type selecting the message-bus trigger.
pub const TRIGGER_TYPE_MESSAGE_BUS: &str = "messagebus";
/// Built-in trigger type selecting the external-MQTT trigger.
pub const TRIGGER_TYPE_MQTT: &str = "external-mqtt";
/// Built-in trigger type selecting the HTTP trigger.
pub const TRIGGER_TYPE_HTTP: &str = "http";

/// Teardown closure returned by [`Trigger::initialize`]; the service runs
/// all deferred teardowns in LIFO order during shutdown.
pub type Deferred = Box<dyn FnOnce() + Send>;

/// A source of inbound messages for the pipeline runtime.
#[async_trait::async_trait]
pub trait Trigger: Send + Sync {
    /// Bring the trigger up.
    ///
    /// `ctx_done` signals service shutdown; background workers the trigger
    /// spawns must register with `app_wg` and observe `ctx_done`. The
    /// returned teardown, if any, runs during shutdown.
    ///
    /// # Errors
    ///
    /// Initialization failures (bad configuration, unreachable broker,
    /// failed subscribe) are fatal to service startup.
    async fn initialize(
        &self,
        ctx_done: CancellationToken,
        app_wg: &WaitGroup,
    ) -> FdkResult<Option<Deferred>>;
}

/// Join topic fragments with the `/` level separator, skipping empties.
#[must_use]
pub fn join_topic(prefix: &str, topic: &str) -> String {
    match (prefix.is_empty(), topic.is_empty()) {
        (true, _) => topic.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}/{topic}"),
    }
}

/// Split a comma-separated topic list, trimming and dropping empties.
#[must_use]
pub fn split_topics(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Infer the content type of a raw payload from its first byte: `{` or `[`
/// means JSON, anything else CBOR.
#[must_use]
pub fn infer_content_type(payload: &[u8]) -> &'static str {
    match payload.first() {
        Some(b'{') | Some(b'[') => fdk_core::CONTENT_TYPE_JSON,
        _ => fdk_core::CONTENT_TYPE_CBOR,
    }
}
