// SPDX-License-Identifier: MIT OR Apache-2.0
//! Messaging client seam and the in-process loopback bus.
//!
//! The broker-side wire client is an external collaborator; the SDK consumes
//! the [`MessageClient`] contract. [`LoopbackBus`] is the in-process
//! implementation used by tests and by assemblies that run without a broker.

use crate::envelope::MessageEnvelope;
use crate::topics::topic_matches;
use fdk_error::{ErrKind, FdkError, FdkResult};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// No authentication.
pub const AUTH_MODE_NONE: &str = "none";
/// Username + password authentication.
pub const AUTH_MODE_USERNAME_PASSWORD: &str = "usernamepassword";
/// Client certificate + key authentication.
pub const AUTH_MODE_CLIENT_CERT: &str = "clientcert";
/// CA certificate pinning.
pub const AUTH_MODE_CACERT: &str = "cacert";

/// A subscription binding one topic pattern to a delivery queue.
pub struct TopicSubscription {
    /// Topic pattern (may contain `#` / `+` wildcards).
    pub topic: String,
    /// Queue that receives matching envelopes.
    pub sender: mpsc::Sender<MessageEnvelope>,
}

/// Client-side contract for the message bus.
pub trait MessageClient: Send + Sync {
    /// Register delivery queues for the given topic patterns.
    ///
    /// Messages that cannot be delivered are reported as strings on
    /// `errors`.
    fn subscribe(
        &self,
        subscriptions: Vec<TopicSubscription>,
        errors: mpsc::Sender<String>,
    ) -> FdkResult<()>;

    /// Publish an envelope to a topic.
    fn publish(&self, envelope: MessageEnvelope, topic: &str) -> FdkResult<()>;

    /// Tear down the connection. Idempotent.
    fn disconnect(&self) -> FdkResult<()>;
}

// ---------------------------------------------------------------------------
// LoopbackBus
// ---------------------------------------------------------------------------

struct BusState {
    subscriptions: Vec<TopicSubscription>,
    errors: Option<mpsc::Sender<String>>,
    connected: bool,
}

/// In-process message bus that routes published envelopes straight back to
/// matching subscriptions.
pub struct LoopbackBus {
    state: Mutex<BusState>,
}

impl LoopbackBus {
    /// Create a connected bus with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                subscriptions: Vec::new(),
                errors: None,
                connected: true,
            }),
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageClient for LoopbackBus {
    fn subscribe(
        &self,
        subscriptions: Vec<TopicSubscription>,
        errors: mpsc::Sender<String>,
    ) -> FdkResult<()> {
        let mut state = self.state.lock().expect("bus state poisoned");
        if !state.connected {
            return Err(FdkError::new(
                ErrKind::ServiceUnavailable,
                "loopback bus is disconnected",
            ));
        }
        state.subscriptions.extend(subscriptions);
        state.errors = Some(errors);
        Ok(())
    }

    fn publish(&self, envelope: MessageEnvelope, topic: &str) -> FdkResult<()> {
        let state = self.state.lock().expect("bus state poisoned");
        if !state.connected {
            return Err(FdkError::new(
                ErrKind::ServiceUnavailable,
                "loopback bus is disconnected",
            ));
        }

        let delivered = MessageEnvelope {
            received_topic: topic.to_string(),
            ..envelope
        };

        for sub in &state.subscriptions {
            if !topic_matches(topic, std::slice::from_ref(&sub.topic)) {
                continue;
            }
            match sub.sender.try_send(delivered.clone()) {
                Ok(()) => {}
                Err(e) => {
                    warn!(target: "fdk.bus", topic = %topic, error = %e, "dropping message for saturated subscriber");
                    if let Some(errors) = &state.errors {
                        let _ = errors.try_send(format!(
                            "failed to deliver message on topic '{topic}': {e}"
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn disconnect(&self) -> FdkResult<()> {
        let mut state = self.state.lock().expect("bus state poisoned");
        state.connected = false;
        state.subscriptions.clear();
        Ok(())
    }
}
