// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message-bus trigger.
//!
//! Subscribes to the configured topics through the service's messaging
//! client. Each topic gets its own bounded queue and worker task; a shared
//! error queue feeds the invalid-message counter. Responses are published
//! to the configured publish topic after context template substitution.

use crate::{Deferred, MessageProcessor, ResponseHandler, ServiceBinding, Trigger, join_topic, split_topics};
use fdk_core::messaging::TopicSubscription;
use fdk_core::sync::{CancellationToken, WaitGroup};
use fdk_core::{CONTENT_TYPE_JSON, MessageEnvelope};
use fdk_error::{ErrKind, FdkError, FdkResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Queue capacity per subscribed topic.
const TOPIC_QUEUE_CAPACITY: usize = 64;

/// Trigger that feeds pipelines from the service's message bus.
pub struct MessageBusTrigger {
    binding: Arc<dyn ServiceBinding>,
    processor: Arc<dyn MessageProcessor>,
}

impl MessageBusTrigger {
    /// Create the trigger over the given binding and processor.
    #[must_use]
    pub fn new(binding: Arc<dyn ServiceBinding>, processor: Arc<dyn MessageProcessor>) -> Self {
        Self { binding, processor }
    }

    fn response_handler(&self, publish_topic: Option<String>) -> Option<ResponseHandler> {
        let publish_topic = publish_topic?;
        let client = self.binding.messaging_client()?;

        Some(Arc::new(move |ctx, pipeline| {
            let Some(response_data) = ctx.response_data() else {
                return;
            };
            let topic = match ctx.apply_values(&publish_topic) {
                Ok(topic) => topic,
                Err(e) => {
                    error!(
                        target: "fdk.trigger.bus",
                        pipeline = %pipeline.id(),
                        topic = %publish_topic,
                        error = %e,
                        "unable to format publish topic"
                    );
                    return;
                }
            };
            let content_type = ctx
                .response_content_type()
                .unwrap_or_else(|| CONTENT_TYPE_JSON.to_string());
            let bytes = response_data.len();
            let envelope =
                MessageEnvelope::response(ctx.correlation_id(), content_type, response_data);
            match client.publish(envelope, &topic) {
                Ok(()) => {
                    debug!(
                        target: "fdk.trigger.bus",
                        pipeline = %pipeline.id(),
                        topic = %topic,
                        bytes,
                        correlation_id = %ctx.correlation_id(),
                        "published response message"
                    );
                }
                Err(e) => {
                    error!(
                        target: "fdk.trigger.bus",
                        pipeline = %pipeline.id(),
                        topic = %topic,
                        error = %e,
                        "could not publish response"
                    );
                }
            }
        }))
    }
}

#[async_trait::async_trait]
impl Trigger for MessageBusTrigger {
    async fn initialize(
        &self,
        ctx_done: CancellationToken,
        app_wg: &WaitGroup,
    ) -> FdkResult<Option<Deferred>> {
        let config = self.binding.config();
        info!(target: "fdk.trigger.bus", "initializing message bus trigger");

        let client = self.binding.messaging_client().ok_or_else(|| {
            FdkError::new(
                ErrKind::ServiceUnavailable,
                "message bus trigger requires a messaging client",
            )
        })?;

        let topics = split_topics(&config.trigger.subscribe_topics);
        if topics.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "subscribe_topics cannot be empty; configure one or more comma-separated topics",
            ));
        }
        let base_prefix = config.message_bus.base_topic_prefix();

        // One queue and worker per subscribe topic.
        let mut subscriptions = Vec::with_capacity(topics.len());
        for topic in &topics {
            let full_topic = join_topic(base_prefix, topic);
            info!(target: "fdk.trigger.bus", topic = %full_topic, "subscribing to topic");

            let (tx, mut rx) = mpsc::channel::<MessageEnvelope>(TOPIC_QUEUE_CAPACITY);
            subscriptions.push(TopicSubscription {
                topic: full_topic.clone(),
                sender: tx,
            });

            let publish_topic = non_empty(&config.trigger.publish_topic)
                .map(|t| join_topic(base_prefix, t));
            let handler = self.response_handler(publish_topic);
            let binding = Arc::clone(&self.binding);
            let processor = Arc::clone(&self.processor);
            let done = ctx_done.clone();
            let wg = app_wg.clone();
            wg.add(1);

            tokio::spawn(async move {
                info!(target: "fdk.trigger.bus", topic = %full_topic, "waiting for messages from the bus");
                loop {
                    tokio::select! {
                        message = rx.recv() => {
                            let Some(message) = message else { break };
                            let ctx = binding.build_context(&message);
                            processor
                                .message_received(Some(ctx), message, handler.clone())
                                .await;
                        }
                        () = done.cancelled() => break,
                    }
                }
                wg.done();
                debug!(target: "fdk.trigger.bus", topic = %full_topic, "topic worker exiting");
            });
        }

        match non_empty(&config.trigger.publish_topic) {
            Some(topic) => {
                info!(target: "fdk.trigger.bus", topic = %join_topic(base_prefix, topic), "publishing responses to topic");
            }
            None => {
                info!(target: "fdk.trigger.bus", "publish topic not set; response data will not be published");
            }
        }

        // Shared error queue feeding the invalid-message counter.
        let (error_tx, mut error_rx) = mpsc::channel::<String>(TOPIC_QUEUE_CAPACITY);
        {
            let processor = Arc::clone(&self.processor);
            let done = ctx_done.clone();
            let wg = app_wg.clone();
            wg.add(1);
            tokio::spawn(async move {
                info!(target: "fdk.trigger.bus", "waiting for messages on the error queue");
                loop {
                    tokio::select! {
                        report = error_rx.recv() => {
                            let Some(report) = report else { break };
                            info!(target: "fdk.trigger.bus", report = %report, "received error message");
                            processor.received_invalid_message();
                        }
                        () = done.cancelled() => break,
                    }
                }
                wg.done();
            });
        }

        client.subscribe(subscriptions, error_tx)?;

        let teardown_client = client;
        Ok(Some(Box::new(move || {
            if let Err(e) = teardown_client.disconnect() {
                error!(target: "fdk.trigger.bus", error = %e, "error disconnecting messaging client");
            }
        })))
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
