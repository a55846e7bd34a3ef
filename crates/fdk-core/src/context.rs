// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-message workspace handed to every transform.

use crate::envelope::MessageEnvelope;
use crate::messaging::MessageClient;
use crate::metrics::MetricsManager;
use crate::secrets::{InsecureSecretProvider, SecretProvider};
use fdk_error::{ErrKind, FdkError, FdkResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

// ---------------------------------------------------------------------------
// ServiceHandles
// ---------------------------------------------------------------------------

/// Read-mostly bundle of injected services shared by every context.
///
/// Assembled once at startup and cloned by `Arc` into each per-message
/// context. The original dynamic service container becomes this typed
/// struct; teardown ordering is the service assembly's concern.
pub struct ServiceHandles {
    secret_provider: Arc<dyn SecretProvider>,
    metrics: Arc<MetricsManager>,
    messaging: Option<Arc<dyn MessageClient>>,
    /// Fully-prefixed publish topic used by [`Context::publish`].
    publish_topic: Option<String>,
}

impl ServiceHandles {
    /// Create handles around the two always-present services.
    #[must_use]
    pub fn new(secret_provider: Arc<dyn SecretProvider>, metrics: Arc<MetricsManager>) -> Self {
        Self {
            secret_provider,
            metrics,
            messaging: None,
            publish_topic: None,
        }
    }

    /// Attach a messaging client.
    #[must_use]
    pub fn with_messaging(mut self, client: Arc<dyn MessageClient>) -> Self {
        self.messaging = Some(client);
        self
    }

    /// Set the fully-prefixed topic used by topic-less publishes.
    #[must_use]
    pub fn with_publish_topic(mut self, topic: impl Into<String>) -> Self {
        self.publish_topic = Some(topic.into());
        self
    }

    /// The secret provider.
    #[must_use]
    pub fn secret_provider(&self) -> &Arc<dyn SecretProvider> {
        &self.secret_provider
    }

    /// The metrics manager.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsManager> {
        &self.metrics
    }

    /// The messaging client, when one is wired in.
    #[must_use]
    pub fn messaging(&self) -> Option<&Arc<dyn MessageClient>> {
        self.messaging.as_ref()
    }
}

impl Default for ServiceHandles {
    /// Handles backed by an empty insecure secret store and a fresh metrics
    /// manager; primarily for tests and minimal assemblies.
    fn default() -> Self {
        Self::new(
            Arc::new(InsecureSecretProvider::new()),
            Arc::new(MetricsManager::new()),
        )
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-message mutable workspace.
///
/// Interior mutability lets transforms share `&Context`: scalars and the
/// values map each sit behind their own reader/writer lock. Keys in the
/// values map are case-insensitive (stored lower-cased).
/// [`clone_context`](Self::clone_context) deep-copies all per-message state
/// while sharing the injected services.
pub struct Context {
    correlation_id: RwLock<String>,
    input_content_type: RwLock<String>,
    response_data: RwLock<Option<Vec<u8>>>,
    response_content_type: RwLock<Option<String>>,
    retry_data: RwLock<Option<Vec<u8>>>,
    retry_triggered: AtomicBool,
    values: RwLock<HashMap<String, String>>,
    handles: Arc<ServiceHandles>,
}

impl Context {
    /// Create a context for a message with the given correlation id and
    /// input content type.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        input_content_type: impl Into<String>,
        handles: Arc<ServiceHandles>,
    ) -> Self {
        Self {
            correlation_id: RwLock::new(correlation_id.into()),
            input_content_type: RwLock::new(input_content_type.into()),
            response_data: RwLock::new(None),
            response_content_type: RwLock::new(None),
            retry_data: RwLock::new(None),
            retry_triggered: AtomicBool::new(false),
            values: RwLock::new(HashMap::new()),
            handles,
        }
    }

    /// Build a context straight from an inbound envelope.
    #[must_use]
    pub fn from_envelope(envelope: &MessageEnvelope, handles: Arc<ServiceHandles>) -> Self {
        Self::new(
            envelope.correlation_id.clone(),
            envelope.content_type.clone(),
            handles,
        )
    }

    /// Deep-copy the per-message state; injected services are shared.
    #[must_use]
    pub fn clone_context(&self) -> Self {
        let values = self.values.read().expect("values lock poisoned").clone();
        Self {
            correlation_id: RwLock::new(self.correlation_id()),
            input_content_type: RwLock::new(self.input_content_type()),
            response_data: RwLock::new(self.response_data()),
            response_content_type: RwLock::new(self.response_content_type()),
            retry_data: RwLock::new(self.retry_data()),
            retry_triggered: AtomicBool::new(self.retry_triggered.load(Ordering::SeqCst)),
            values: RwLock::new(values),
            handles: Arc::clone(&self.handles),
        }
    }

    // -- scalars --------------------------------------------------------

    /// The end-to-end correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> String {
        self.correlation_id
            .read()
            .expect("correlation id lock poisoned")
            .clone()
    }

    /// Replace the correlation id.
    pub fn set_correlation_id(&self, id: impl Into<String>) {
        *self
            .correlation_id
            .write()
            .expect("correlation id lock poisoned") = id.into();
    }

    /// MIME type of the inbound payload.
    #[must_use]
    pub fn input_content_type(&self) -> String {
        self.input_content_type
            .read()
            .expect("content type lock poisoned")
            .clone()
    }

    /// Replace the inbound content type.
    pub fn set_input_content_type(&self, content_type: impl Into<String>) {
        *self
            .input_content_type
            .write()
            .expect("content type lock poisoned") = content_type.into();
    }

    /// The response buffer, when a transform has set one.
    #[must_use]
    pub fn response_data(&self) -> Option<Vec<u8>> {
        self.response_data
            .read()
            .expect("response lock poisoned")
            .clone()
    }

    /// Set the response buffer.
    pub fn set_response_data(&self, data: Vec<u8>) {
        *self.response_data.write().expect("response lock poisoned") = Some(data);
    }

    /// MIME type for the response buffer, when set.
    #[must_use]
    pub fn response_content_type(&self) -> Option<String> {
        self.response_content_type
            .read()
            .expect("response type lock poisoned")
            .clone()
    }

    /// Set the response content type.
    pub fn set_response_content_type(&self, content_type: impl Into<String>) {
        *self
            .response_content_type
            .write()
            .expect("response type lock poisoned") = Some(content_type.into());
    }

    /// The retry buffer, when a transform has set one.
    #[must_use]
    pub fn retry_data(&self) -> Option<Vec<u8>> {
        self.retry_data.read().expect("retry lock poisoned").clone()
    }

    /// Set the retry buffer that store-and-forward captures on failure.
    pub fn set_retry_data(&self, data: Option<Vec<u8>>) {
        *self.retry_data.write().expect("retry lock poisoned") = data;
    }

    /// Ask the store-and-forward engine to run an immediate retry pass.
    ///
    /// Used by exporters that succeed after previous failures. The runtime
    /// consumes the flag and signals the retry worker.
    pub fn trigger_retry(&self) {
        self.retry_triggered.store(true, Ordering::SeqCst);
    }

    /// Consume the retry-triggered flag.
    pub fn take_retry_triggered(&self) -> bool {
        self.retry_triggered.swap(false, Ordering::SeqCst)
    }

    // -- values map -----------------------------------------------------

    /// Store a value under a case-insensitive key.
    pub fn add_value(&self, key: &str, value: impl Into<String>) {
        self.values
            .write()
            .expect("values lock poisoned")
            .insert(key.to_lowercase(), value.into());
    }

    /// Remove the value under a case-insensitive key.
    pub fn remove_value(&self, key: &str) {
        self.values
            .write()
            .expect("values lock poisoned")
            .remove(&key.to_lowercase());
    }

    /// Look up a value by case-insensitive key.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .expect("values lock poisoned")
            .get(&key.to_lowercase())
            .cloned()
    }

    /// A read-only copy of the whole values map.
    #[must_use]
    pub fn values(&self) -> HashMap<String, String> {
        self.values.read().expect("values lock poisoned").clone()
    }

    /// Replace the values map wholesale (used when rebuilding a context
    /// from persisted retry state).
    pub fn set_values(&self, values: HashMap<String, String>) {
        let lowered = values
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        *self.values.write().expect("values lock poisoned") = lowered;
    }

    /// Substitute `{key}` placeholders in `format` with stored values.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::ContractInvalid`] when any placeholder has no
    /// stored value.
    pub fn apply_values(&self, format: &str) -> FdkResult<String> {
        let values = self.values.read().expect("values lock poisoned");
        let mut out = String::with_capacity(format.len());
        let mut rest = format;

        while let Some(open) = rest.find('{') {
            let (before, after_open) = rest.split_at(open);
            out.push_str(before);
            let Some(close) = after_open.find('}') else {
                out.push_str(after_open);
                break;
            };
            let key = &after_open[1..close];
            match values.get(&key.to_lowercase()) {
                Some(v) => out.push_str(v),
                None => {
                    return Err(FdkError::new(
                        ErrKind::ContractInvalid,
                        format!("failed to replace all context placeholders in '{format}': no value for '{key}'"),
                    ));
                }
            }
            rest = &after_open[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    // -- injected services ----------------------------------------------

    /// The shared service handles.
    #[must_use]
    pub fn handles(&self) -> &Arc<ServiceHandles> {
        &self.handles
    }

    /// The secret provider.
    #[must_use]
    pub fn secret_provider(&self) -> &Arc<dyn SecretProvider> {
        self.handles.secret_provider()
    }

    /// The metrics manager.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsManager> {
        self.handles.metrics()
    }

    /// The id of the pipeline currently executing this context, when set.
    #[must_use]
    pub fn pipeline_id(&self) -> Option<String> {
        self.get_value(crate::KEY_PIPELINE_ID)
    }

    /// Publish `data` to the configured publish topic.
    ///
    /// # Errors
    ///
    /// Fails when no messaging client or publish topic is configured, or
    /// when the client rejects the publish.
    pub fn publish(&self, data: Vec<u8>, content_type: &str) -> FdkResult<()> {
        let topic = self.handles.publish_topic.clone().ok_or_else(|| {
            FdkError::new(
                ErrKind::ContractInvalid,
                "no publish topic configured for this service",
            )
        })?;
        self.publish_with_topic(&topic, data, content_type)
    }

    /// Publish `data` to an explicit topic.
    ///
    /// # Errors
    ///
    /// Fails when no messaging client is configured or the publish is
    /// rejected.
    pub fn publish_with_topic(
        &self,
        topic: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> FdkResult<()> {
        let client = self.handles.messaging().ok_or_else(|| {
            FdkError::new(
                ErrKind::ServiceUnavailable,
                "no messaging client configured for this service",
            )
        })?;
        let envelope = MessageEnvelope::response(self.correlation_id(), content_type, data);
        client.publish(envelope, topic)
    }
}
