// SPDX-License-Identifier: MIT OR Apache-2.0
//! Trigger-service binding and the trigger message processor.
//!
//! The binding is the dependency-inversion boundary between triggers and
//! the runtime: triggers only see this narrow surface. The message
//! processor is the per-service orchestrator that fans one envelope out to
//! every matching pipeline.

use async_trait::async_trait;
use fdk_config::ServiceConfig;
use fdk_core::messaging::MessageClient;
use fdk_core::metrics::{
    Counter, INVALID_MESSAGES_RECEIVED_NAME, MESSAGES_RECEIVED_NAME, Metric, MetricsManager,
};
use fdk_core::secrets::SecretProvider;
use fdk_core::{Context, FunctionPipeline, MessageEnvelope, PipelineData};
use fdk_error::FdkResult;
use fdk_runtime::{FunctionsPipelineRuntime, MessageError};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Callback a trigger supplies to emit a per-transport reply for one
/// pipeline's completed execution.
pub type ResponseHandler = Arc<dyn Fn(&Context, &Arc<FunctionPipeline>) + Send + Sync>;

// ---------------------------------------------------------------------------
// ServiceBinding
// ---------------------------------------------------------------------------

/// The narrow service surface a trigger is allowed to consume.
#[async_trait]
pub trait ServiceBinding: Send + Sync {
    /// Decode an envelope into the runtime's target shape.
    fn decode_message(&self, ctx: &Context, envelope: &MessageEnvelope)
    -> FdkResult<PipelineData>;

    /// Run decoded data through one pipeline.
    async fn process_message(
        &self,
        ctx: &Context,
        data: PipelineData,
        pipeline: &Arc<FunctionPipeline>,
    ) -> Result<(), MessageError>;

    /// Build a fresh context for an envelope.
    fn build_context(&self, envelope: &MessageEnvelope) -> Context;

    /// Pipelines matching the given topic, in insertion order.
    fn get_matching_pipelines(&self, topic: &str) -> Vec<Arc<FunctionPipeline>>;

    /// The default pipeline.
    fn get_default_pipeline(&self) -> Arc<FunctionPipeline>;

    /// The service configuration.
    fn config(&self) -> &ServiceConfig;

    /// The service's messaging client, when one is wired in.
    fn messaging_client(&self) -> Option<Arc<dyn MessageClient>>;

    /// The service's secret provider.
    fn secret_provider(&self) -> Arc<dyn SecretProvider>;

    /// Load a custom (non-SDK) configuration section by name.
    fn load_custom_config(&self, section_name: &str) -> FdkResult<fdk_config::CustomSection>;
}

/// Default binding backed by the pipeline runtime and loaded configuration.
pub struct DefaultServiceBinding {
    runtime: Arc<FunctionsPipelineRuntime>,
    config: Arc<ServiceConfig>,
}

impl DefaultServiceBinding {
    /// Bind a runtime and configuration together for trigger consumption.
    #[must_use]
    pub fn new(runtime: Arc<FunctionsPipelineRuntime>, config: Arc<ServiceConfig>) -> Self {
        Self { runtime, config }
    }

    /// The underlying runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<FunctionsPipelineRuntime> {
        &self.runtime
    }
}

#[async_trait]
impl ServiceBinding for DefaultServiceBinding {
    fn decode_message(
        &self,
        ctx: &Context,
        envelope: &MessageEnvelope,
    ) -> FdkResult<PipelineData> {
        self.runtime.decode_message(ctx, envelope)
    }

    async fn process_message(
        &self,
        ctx: &Context,
        data: PipelineData,
        pipeline: &Arc<FunctionPipeline>,
    ) -> Result<(), MessageError> {
        self.runtime.process_message(ctx, data, pipeline).await
    }

    fn build_context(&self, envelope: &MessageEnvelope) -> Context {
        Context::from_envelope(envelope, Arc::clone(self.runtime.handles()))
    }

    fn get_matching_pipelines(&self, topic: &str) -> Vec<Arc<FunctionPipeline>> {
        self.runtime.get_matching_pipelines(topic)
    }

    fn get_default_pipeline(&self) -> Arc<FunctionPipeline> {
        self.runtime.get_default_pipeline()
    }

    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn messaging_client(&self) -> Option<Arc<dyn MessageClient>> {
        self.runtime.handles().messaging().cloned()
    }

    fn secret_provider(&self) -> Arc<dyn SecretProvider> {
        Arc::clone(self.runtime.handles().secret_provider())
    }

    fn load_custom_config(&self, section_name: &str) -> FdkResult<fdk_config::CustomSection> {
        self.config.custom_section(section_name).map_err(|e| {
            fdk_error::FdkError::new(
                fdk_error::ErrKind::ContractInvalid,
                format!("failed to load custom configuration section '{section_name}'"),
            )
            .with_source(e)
        })
    }
}

// ---------------------------------------------------------------------------
// MessageProcessor
// ---------------------------------------------------------------------------

/// Orchestrates one envelope through every matching pipeline.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Fan the envelope out to all pipelines matching its received topic.
    ///
    /// `ctx` may be `None` for transports that have not built one yet.
    /// `response_handler`, when present, runs after each successful
    /// pipeline execution with that pipeline's context.
    async fn message_received(
        &self,
        ctx: Option<Context>,
        envelope: MessageEnvelope,
        response_handler: Option<ResponseHandler>,
    );

    /// Count a message that was invalid at the transport layer.
    fn received_invalid_message(&self);
}

/// Default processor carrying the service-wide received/invalid counters.
pub struct DefaultMessageProcessor {
    binding: Arc<dyn ServiceBinding>,
    messages_received: Counter,
    invalid_messages_received: Counter,
}

impl DefaultMessageProcessor {
    /// Create the processor and register its two counters with `metrics`.
    ///
    /// Registration failures are logged and non-fatal.
    #[must_use]
    pub fn new(binding: Arc<dyn ServiceBinding>, metrics: &MetricsManager) -> Self {
        let messages_received = Counter::new();
        let invalid_messages_received = Counter::new();

        for (name, counter) in [
            (MESSAGES_RECEIVED_NAME, &messages_received),
            (INVALID_MESSAGES_RECEIVED_NAME, &invalid_messages_received),
        ] {
            match metrics.register(name, Metric::Counter(counter.clone()), None) {
                Ok(()) => {
                    info!(target: "fdk.trigger", metric = name, "metric registered and will be reported");
                }
                Err(e) => {
                    warn!(target: "fdk.trigger", metric = name, error = %e, "metric failed to register and will not be reported");
                }
            }
        }

        Self {
            binding,
            messages_received,
            invalid_messages_received,
        }
    }

    /// Total messages received across all transports.
    #[must_use]
    pub fn messages_received(&self) -> i64 {
        self.messages_received.count()
    }

    /// Messages that failed decoding or transport validation.
    #[must_use]
    pub fn invalid_messages_received(&self) -> i64 {
        self.invalid_messages_received.count()
    }
}

#[async_trait]
impl MessageProcessor for DefaultMessageProcessor {
    async fn message_received(
        &self,
        ctx: Option<Context>,
        envelope: MessageEnvelope,
        response_handler: Option<ResponseHandler>,
    ) {
        self.messages_received.inc(1);
        debug!(
            target: "fdk.trigger",
            topic = %envelope.received_topic,
            "trigger attempting to find pipeline(s) for topic"
        );

        let ctx = ctx.unwrap_or_else(|| self.binding.build_context(&envelope));

        let pipelines = self.binding.get_matching_pipelines(&envelope.received_topic);
        debug!(
            target: "fdk.trigger",
            topic = %envelope.received_topic,
            pipelines = pipelines.len(),
            "trigger found matching pipeline(s)"
        );
        if pipelines.is_empty() {
            return;
        }

        let data = match self.binding.decode_message(&ctx, &envelope) {
            Ok(data) => data,
            Err(e) => {
                self.invalid_messages_received.inc(1);
                error!(target: "fdk.trigger", error = %e, correlation_id = %envelope.correlation_id, "failed to decode message");
                return;
            }
        };

        for pipeline in pipelines {
            // Counts attempts: incremented for every match at receipt, not
            // on completion.
            pipeline.metrics().messages_processed.inc(1);

            let binding = Arc::clone(&self.binding);
            let pipeline_ctx = ctx.clone_context();
            let data = data.clone();
            let handler = response_handler.clone();
            let correlation_id = envelope.correlation_id.clone();

            tokio::spawn(async move {
                let _timing = pipeline.metrics().message_processing_time.time();
                debug!(
                    target: "fdk.trigger",
                    pipeline = %pipeline.id(),
                    correlation_id = %correlation_id,
                    "trigger sending message to pipeline"
                );
                match binding.process_message(&pipeline_ctx, data, &pipeline).await {
                    Ok(()) => {
                        if let Some(handler) = handler {
                            handler(&pipeline_ctx, &pipeline);
                        }
                    }
                    Err(e) => {
                        error!(
                            target: "fdk.trigger",
                            pipeline = %pipeline.id(),
                            correlation_id = %correlation_id,
                            error = %e,
                            "error processing message in pipeline"
                        );
                    }
                }
            });
        }
    }

    fn received_invalid_message(&self) {
        self.messages_received.inc(1);
        self.invalid_messages_received.inc(1);
        warn!(target: "fdk.trigger", "received invalid message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdk_config::StoreAndForwardConfig;
    use fdk_core::pipeline::{FunctionResult, TargetType};
    use fdk_core::{CONTENT_TYPE_JSON, ServiceHandles, Transform};
    use fdk_runtime::StoreAndForward;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn binding() -> Arc<DefaultServiceBinding> {
        let handles = Arc::new(ServiceHandles::default());
        let sf = StoreAndForward::new(
            "svc",
            StoreAndForwardConfig::default(),
            None,
            &handles,
        );
        let runtime = Arc::new(FunctionsPipelineRuntime::new(
            "svc",
            TargetType::Raw,
            handles,
            sf,
        ));
        Arc::new(DefaultServiceBinding::new(
            runtime,
            Arc::new(ServiceConfig::default()),
        ))
    }

    fn processor_for(b: &Arc<DefaultServiceBinding>) -> DefaultMessageProcessor {
        let metrics = Arc::clone(b.runtime().handles().metrics());
        DefaultMessageProcessor::new(b.clone(), &metrics)
    }

    fn counting_transform(counter: Arc<AtomicU32>) -> Transform {
        Transform::new("count", move |_ctx, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
            FunctionResult::Continue(None)
        })
    }

    async fn settle() {
        // Give spawned pipeline tasks a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fan_out_executes_every_matching_pipeline() {
        let b = binding();
        let hits = Arc::new(AtomicU32::new(0));
        let rt = b.runtime();
        rt.add_function_pipeline(
            "a",
            vec!["sensors/+/temp".into()],
            vec![counting_transform(Arc::clone(&hits))],
        )
        .unwrap();
        rt.add_function_pipeline(
            "b",
            vec!["sensors/#".into()],
            vec![counting_transform(Arc::clone(&hits))],
        )
        .unwrap();
        rt.set_default_functions_pipeline(vec![counting_transform(Arc::clone(&hits))]);

        let processor = processor_for(&b);
        processor
            .message_received(
                None,
                MessageEnvelope::new("c1", CONTENT_TYPE_JSON, b"{}".to_vec(), "sensors/room1/temp"),
                None,
            )
            .await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        processor
            .message_received(
                None,
                MessageEnvelope::new(
                    "c2",
                    CONTENT_TYPE_JSON,
                    b"{}".to_vec(),
                    "sensors/room1/humidity",
                ),
                None,
            )
            .await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn no_matching_pipeline_is_a_quiet_no_op() {
        let b = binding();
        b.runtime()
            .add_function_pipeline("only", vec!["alerts/#".into()], vec![])
            .unwrap();
        let processor = processor_for(&b);
        processor
            .message_received(
                None,
                MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"{}".to_vec(), "events/x"),
                None,
            )
            .await;
        assert_eq!(processor.messages_received(), 1);
        assert_eq!(processor.invalid_messages_received(), 0);
    }

    #[tokio::test]
    async fn processed_counter_counts_attempts_at_receipt() {
        let b = binding();
        let pipeline = b
            .runtime()
            .add_function_pipeline(
                "p",
                vec!["#".into()],
                vec![Transform::new("fail", |_ctx, _data| {
                    FunctionResult::Failure(fdk_error::FdkError::new(
                        fdk_error::ErrKind::ServerError,
                        "boom",
                    ))
                })],
            )
            .unwrap();
        let processor = processor_for(&b);
        processor
            .message_received(
                None,
                MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"{}".to_vec(), "t"),
                None,
            )
            .await;
        settle().await;
        // Attempt counted even though the pipeline failed.
        assert_eq!(pipeline.metrics().messages_processed.count(), 1);
        assert_eq!(pipeline.metrics().processing_errors.count(), 1);
    }

    #[tokio::test]
    async fn decode_failure_increments_invalid_counter() {
        let handles = Arc::new(ServiceHandles::default());
        let sf = StoreAndForward::new("svc", StoreAndForwardConfig::default(), None, &handles);
        // Event target so garbage payloads fail decoding.
        let runtime = Arc::new(FunctionsPipelineRuntime::new(
            "svc",
            TargetType::Event,
            handles,
            sf,
        ));
        runtime.get_default_pipeline();
        let b = Arc::new(DefaultServiceBinding::new(
            runtime,
            Arc::new(ServiceConfig::default()),
        ));
        let processor = processor_for(&b);
        processor
            .message_received(
                None,
                MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"not json".to_vec(), "t"),
                None,
            )
            .await;
        assert_eq!(processor.invalid_messages_received(), 1);
    }

    #[tokio::test]
    async fn response_handler_runs_with_pipeline_context() {
        let b = binding();
        b.runtime().set_default_functions_pipeline(vec![Transform::new(
            "respond",
            |ctx: &Context, _data| {
                ctx.set_response_data(b"reply".to_vec());
                FunctionResult::Continue(None)
            },
        )]);
        let processor = processor_for(&b);

        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observed2 = Arc::clone(&observed);
        let handler: ResponseHandler = Arc::new(move |ctx, pipeline| {
            observed2
                .lock()
                .unwrap()
                .push((ctx.response_data(), pipeline.id().to_string()));
        });

        processor
            .message_received(
                None,
                MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"{}".to_vec(), "t"),
                Some(handler),
            )
            .await;
        settle().await;

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].0.as_deref(), Some(&b"reply"[..]));
        assert_eq!(observed[0].1, fdk_core::DEFAULT_PIPELINE_ID);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn matching_pipelines_run_concurrently() {
        let b = binding();
        let slow = Transform::new("slow", |_ctx, _data| {
            std::thread::sleep(Duration::from_millis(50));
            FunctionResult::Continue(None)
        });
        let fast = Transform::new("fast", |_ctx, _data| {
            std::thread::sleep(Duration::from_millis(10));
            FunctionResult::Continue(None)
        });
        let rt = b.runtime();
        let p1 = rt
            .add_function_pipeline("slow", vec!["#".into()], vec![slow])
            .unwrap();
        let p2 = rt
            .add_function_pipeline("fast", vec!["#".into()], vec![fast])
            .unwrap();
        let processor = processor_for(&b);

        let start = std::time::Instant::now();
        processor
            .message_received(
                None,
                MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"{}".to_vec(), "t"),
                None,
            )
            .await;
        while p1.metrics().message_processing_time.observations() == 0
            || p2.metrics().message_processing_time.observations() == 0
        {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(
            start.elapsed() < Duration::from_millis(80),
            "pipelines did not run in parallel: {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn custom_config_sections_load_through_the_binding() {
        let handles = Arc::new(ServiceHandles::default());
        let sf = StoreAndForward::new("svc", StoreAndForwardConfig::default(), None, &handles);
        let runtime = Arc::new(FunctionsPipelineRuntime::new(
            "svc",
            TargetType::Raw,
            handles,
            sf,
        ));
        let config =
            fdk_config::parse_toml("[my_trigger]\nendpoint = \"amqp://broker\"\n").unwrap();
        let b = DefaultServiceBinding::new(runtime, Arc::new(config));

        let section = b.load_custom_config("my_trigger").unwrap();
        assert_eq!(
            section.get("endpoint").and_then(|v| v.as_str()),
            Some("amqp://broker")
        );
        assert!(b.load_custom_config("absent").is_err());
    }

    #[tokio::test]
    async fn invalid_message_bumps_both_counters() {
        let b = binding();
        let processor = processor_for(&b);
        processor.received_invalid_message();
        assert_eq!(processor.messages_received(), 1);
        assert_eq!(processor.invalid_messages_received(), 1);
    }
}
