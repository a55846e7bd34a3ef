// SPDX-License-Identifier: MIT OR Apache-2.0
//! fdk-runtime
//!
//! Execution engine for function pipelines.
//!
//! Responsibilities:
//! - decode inbound envelopes into the configured target shape
//! - own the pipeline registry and match pipelines by topic
//! - execute transform chains with short-circuit semantics
//! - capture retry state for the store-and-forward engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Durable retry queue for partially-completed pipelines.
pub mod store_forward;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fdk_core::dtos::{AddEventRequest, Event};
use fdk_core::metrics::{
    Metric, PIPELINE_MESSAGE_PROCESSING_TIME_NAME, PIPELINE_MESSAGES_PROCESSED_NAME,
    PIPELINE_PROCESSING_ERRORS_NAME, pipeline_metric_name,
};
use fdk_core::pipeline::{FunctionResult, TargetType};
use fdk_core::sync::{CancellationToken, WaitGroup};
use fdk_core::topics::topic_matches;
use fdk_core::{
    CONTENT_TYPE_JSON, Context, DEFAULT_PIPELINE_ID, FunctionPipeline, KEY_DEVICE_NAME,
    KEY_PIPELINE_ID, KEY_PROFILE_NAME, KEY_RECEIVED_TOPIC, KEY_SOURCE_NAME, MessageEnvelope,
    PipelineData, ServiceHandles, Transform,
};
use fdk_error::{ErrKind, FdkError, FdkResult};
use http::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

pub use store_forward::StoreAndForward;

/// A pipeline failure paired with the HTTP status triggers should report.
#[derive(Debug)]
pub struct MessageError {
    /// The underlying pipeline error.
    pub err: FdkError,
    /// Transport status for the failure; pipeline errors map to 422.
    pub status: StatusCode,
}

impl MessageError {
    fn unprocessable(err: FdkError) -> Self {
        Self {
            err,
            status: StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

/// Runtime environment owning the function pipelines of one app service.
pub struct FunctionsPipelineRuntime {
    service_key: String,
    target_type: TargetType,
    pipelines: RwLock<Vec<Arc<FunctionPipeline>>>,
    handles: Arc<ServiceHandles>,
    store_forward: StoreAndForward,
}

impl FunctionsPipelineRuntime {
    /// Create a runtime for the given service key and target shape.
    ///
    /// `store_forward` carries the retry configuration and (when enabled)
    /// the store client that persists retry state.
    #[must_use]
    pub fn new(
        service_key: impl Into<String>,
        target_type: TargetType,
        handles: Arc<ServiceHandles>,
        store_forward: StoreAndForward,
    ) -> Self {
        Self {
            service_key: service_key.into(),
            target_type,
            pipelines: RwLock::new(Vec::new()),
            handles,
            store_forward,
        }
    }

    /// The app service key this runtime belongs to.
    #[must_use]
    pub fn service_key(&self) -> &str {
        &self.service_key
    }

    /// The shared service handles.
    #[must_use]
    pub fn handles(&self) -> &Arc<ServiceHandles> {
        &self.handles
    }

    /// The store-and-forward engine.
    #[must_use]
    pub fn store_forward(&self) -> &StoreAndForward {
        &self.store_forward
    }

    // -- registry -------------------------------------------------------

    /// Register a new pipeline bound to the given topic patterns.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::StatusConflict`] when the id is already taken.
    pub fn add_function_pipeline(
        &self,
        pipeline_id: &str,
        topics: Vec<String>,
        transforms: Vec<Transform>,
    ) -> FdkResult<Arc<FunctionPipeline>> {
        {
            let pipelines = self.pipelines.read().expect("pipeline registry poisoned");
            if pipelines.iter().any(|p| p.id() == pipeline_id) {
                return Err(FdkError::new(
                    ErrKind::StatusConflict,
                    format!("pipeline with id '{pipeline_id}' already exists"),
                ));
            }
        }
        Ok(self.insert_pipeline(pipeline_id, topics, transforms))
    }

    fn insert_pipeline(
        &self,
        pipeline_id: &str,
        topics: Vec<String>,
        transforms: Vec<Transform>,
    ) -> Arc<FunctionPipeline> {
        let pipeline = Arc::new(FunctionPipeline::new(pipeline_id, topics, transforms));
        {
            let mut pipelines = self.pipelines.write().expect("pipeline registry poisoned");
            pipelines.push(Arc::clone(&pipeline));
        }
        self.register_pipeline_metrics(&pipeline);
        pipeline
    }

    /// Replace the transforms of an existing pipeline, recomputing its hash.
    ///
    /// Unknown ids are logged and ignored.
    pub fn set_functions_pipeline_transforms(&self, pipeline_id: &str, transforms: Vec<Transform>) {
        match self.get_pipeline_by_id(pipeline_id) {
            Some(pipeline) => {
                pipeline.set_transforms(transforms);
                info!(target: "fdk.runtime", pipeline = %pipeline_id, "transforms set for pipeline");
            }
            None => {
                warn!(target: "fdk.runtime", pipeline = %pipeline_id, "unable to set transforms: pipeline not found");
            }
        }
    }

    /// Replace the default pipeline's transforms, creating it on first use.
    pub fn set_default_functions_pipeline(&self, transforms: Vec<Transform>) {
        let pipeline = self.get_default_pipeline();
        self.set_functions_pipeline_transforms(pipeline.id(), transforms);
    }

    /// Remove every pipeline, unregistering their metrics.
    pub fn remove_all_function_pipelines(&self) {
        let metrics = self.handles.metrics();
        let mut pipelines = self.pipelines.write().expect("pipeline registry poisoned");
        for pipeline in pipelines.iter() {
            for template in [
                PIPELINE_MESSAGES_PROCESSED_NAME,
                PIPELINE_MESSAGE_PROCESSING_TIME_NAME,
                PIPELINE_PROCESSING_ERRORS_NAME,
            ] {
                metrics.unregister(&pipeline_metric_name(template, pipeline.id()));
            }
        }
        pipelines.clear();
    }

    /// Look up a pipeline by id.
    #[must_use]
    pub fn get_pipeline_by_id(&self, pipeline_id: &str) -> Option<Arc<FunctionPipeline>> {
        self.pipelines
            .read()
            .expect("pipeline registry poisoned")
            .iter()
            .find(|p| p.id() == pipeline_id)
            .cloned()
    }

    /// The default pipeline (topic `#`), created on first access.
    #[must_use]
    pub fn get_default_pipeline(&self) -> Arc<FunctionPipeline> {
        if let Some(existing) = self.get_pipeline_by_id(DEFAULT_PIPELINE_ID) {
            return existing;
        }
        self.insert_pipeline(
            DEFAULT_PIPELINE_ID,
            vec![fdk_core::topics::TOPIC_WILDCARD.to_string()],
            Vec::new(),
        )
    }

    /// Pipelines whose topic patterns match `incoming_topic`, in insertion
    /// order.
    #[must_use]
    pub fn get_matching_pipelines(&self, incoming_topic: &str) -> Vec<Arc<FunctionPipeline>> {
        self.pipelines
            .read()
            .expect("pipeline registry poisoned")
            .iter()
            .filter(|p| topic_matches(incoming_topic, p.topics()))
            .cloned()
            .collect()
    }

    fn register_pipeline_metrics(&self, pipeline: &Arc<FunctionPipeline>) {
        let metrics_manager = self.handles.metrics();
        let tags = Some(HashMap::from([(
            "pipeline".to_string(),
            pipeline.id().to_string(),
        )]));
        let instruments = [
            (
                PIPELINE_MESSAGES_PROCESSED_NAME,
                Metric::Counter(pipeline.metrics().messages_processed.clone()),
            ),
            (
                PIPELINE_MESSAGE_PROCESSING_TIME_NAME,
                Metric::Timer(pipeline.metrics().message_processing_time.clone()),
            ),
            (
                PIPELINE_PROCESSING_ERRORS_NAME,
                Metric::Counter(pipeline.metrics().processing_errors.clone()),
            ),
        ];
        for (template, metric) in instruments {
            let name = pipeline_metric_name(template, pipeline.id());
            match metrics_manager.register(&name, metric, tags.clone()) {
                Ok(()) => {
                    info!(target: "fdk.runtime", metric = %name, "metric registered and will be reported");
                }
                Err(e) => {
                    warn!(target: "fdk.runtime", metric = %name, error = %e, "unable to register metric; it will not be reported");
                }
            }
        }
    }

    // -- decoding -------------------------------------------------------

    /// Decode the envelope into this runtime's target shape.
    ///
    /// On success the context records the correlation id, input content
    /// type, and received topic; event targets additionally record the
    /// device, profile, and source names.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::ContractInvalid`] for unsupported content types
    /// or undecodable payloads.
    pub fn decode_message(
        &self,
        ctx: &Context,
        envelope: &MessageEnvelope,
    ) -> FdkResult<PipelineData> {
        let data = match &self.target_type {
            TargetType::Raw => {
                debug!(target: "fdk.runtime", "expecting raw byte data");
                PipelineData::Bytes(envelope.payload.clone())
            }
            TargetType::Event => {
                debug!(target: "fdk.runtime", "expecting an add-event request or event DTO");
                let event = self.process_event_payload(envelope)?;
                ctx.add_value(KEY_DEVICE_NAME, event.device_name.clone());
                ctx.add_value(KEY_PROFILE_NAME, event.profile_name.clone());
                ctx.add_value(KEY_SOURCE_NAME, event.source_name.clone());
                PipelineData::Event(event)
            }
            TargetType::Custom { name, decoder } => {
                debug!(target: "fdk.runtime", custom_type = %name, "expecting a custom type");
                if !envelope.content_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
                    return Err(FdkError::new(
                        ErrKind::ContractInvalid,
                        format!(
                            "unable to process custom object of type '{name}': unsupported content type '{}'",
                            envelope.content_type
                        ),
                    ));
                }
                decoder(&envelope.payload).map_err(|e| {
                    FdkError::new(
                        ErrKind::ContractInvalid,
                        format!("unable to process custom object of type '{name}'"),
                    )
                    .with_source(e)
                })?
            }
        };

        ctx.set_correlation_id(envelope.correlation_id.clone());
        ctx.set_input_content_type(envelope.content_type.clone());
        ctx.add_value(KEY_RECEIVED_TOPIC, envelope.received_topic.clone());

        Ok(data)
    }

    fn process_event_payload(&self, envelope: &MessageEnvelope) -> FdkResult<Event> {
        if !envelope.content_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                format!("unsupported content type '{}'", envelope.content_type),
            ));
        }

        // Bus payloads may be plain JSON bytes or JSON that was itself
        // base64-encoded in transit; detect and unwrap the latter.
        let dto_bytes =
            decode_if_base64(&envelope.payload).unwrap_or_else(|| envelope.payload.clone());

        debug!(target: "fdk.runtime", "attempting to process payload as an add-event request");
        if let Ok(request) = serde_json::from_slice::<AddEventRequest>(&dto_bytes) {
            return Ok(request.event);
        }

        debug!(target: "fdk.runtime", "attempting to process payload as a bare event DTO");
        serde_json::from_slice::<Event>(&dto_bytes).map_err(|e| {
            FdkError::new(
                ErrKind::ContractInvalid,
                "failed to decode message envelope into an event DTO",
            )
            .with_source(e)
        })
    }

    // -- execution ------------------------------------------------------

    /// Run the pipeline over freshly-decoded data.
    ///
    /// Records the pipeline id in the context, then executes from the first
    /// transform.
    ///
    /// # Errors
    ///
    /// Returns the [`MessageError`] of the failing transform, if any.
    pub async fn process_message(
        &self,
        ctx: &Context,
        data: PipelineData,
        pipeline: &Arc<FunctionPipeline>,
    ) -> Result<(), MessageError> {
        let transforms = pipeline.transforms();
        if transforms.is_empty() {
            debug!(target: "fdk.runtime", pipeline = %pipeline.id(), "pipeline has no transforms");
            return Ok(());
        }

        ctx.add_value(KEY_PIPELINE_ID, pipeline.id());
        debug!(
            target: "fdk.runtime",
            pipeline = %pipeline.id(),
            transforms = transforms.len(),
            "processing message"
        );
        self.execute_pipeline(ctx, data, pipeline, 0, false).await
    }

    /// Execute `pipeline` starting at `start_position`.
    ///
    /// Each transform sees the previous transform's output (or the initial
    /// `data`); a `Continue(None)` reuses the previous input. The retry
    /// buffer is cleared before every transform so only a buffer set by the
    /// failing function is captured.
    ///
    /// # Errors
    ///
    /// Returns a 422-status [`MessageError`] when a transform fails; a
    /// clean stop is not an error.
    pub async fn execute_pipeline(
        &self,
        ctx: &Context,
        data: PipelineData,
        pipeline: &Arc<FunctionPipeline>,
        start_position: usize,
        is_retry: bool,
    ) -> Result<(), MessageError> {
        let transforms = pipeline.transforms();
        let mut current = data;

        for (index, transform) in transforms.iter().enumerate() {
            if index < start_position {
                continue;
            }
            // Only retry data set by the failing function itself counts.
            ctx.set_retry_data(None);

            match transform.call(ctx, current.clone()) {
                FunctionResult::Continue(output) => {
                    if let Some(next) = output {
                        current = next;
                    }
                }
                FunctionResult::Stop => return Ok(()),
                FunctionResult::Failure(err) => {
                    error!(
                        target: "fdk.runtime",
                        pipeline = %pipeline.id(),
                        function = %transform.name(),
                        position = index,
                        correlation_id = %ctx.correlation_id(),
                        error = %err,
                        "pipeline function resulted in error"
                    );
                    if !is_retry {
                        if let Some(retry_data) = ctx.retry_data() {
                            self.store_forward
                                .store_for_later_retry(retry_data, ctx, pipeline, index)
                                .await;
                        }
                    }
                    pipeline.metrics().processing_errors.inc(1);
                    return Err(MessageError::unprocessable(err));
                }
            }

            if !is_retry && ctx.take_retry_triggered() {
                // An exporter recovered; nudge the retry worker off-interval.
                self.store_forward.signal_retry();
            }
        }

        Ok(())
    }

    // -- store and forward ----------------------------------------------

    /// Start the store-and-forward retry loop.
    ///
    /// The worker registers with both wait groups and exits when either
    /// cancellation token fires. Ticks below the one-second minimum are
    /// raised with a warning.
    pub fn start_store_and_forward(
        self: &Arc<Self>,
        app_wg: &WaitGroup,
        app_cancel: CancellationToken,
        store_forward_wg: &WaitGroup,
        store_forward_cancel: CancellationToken,
    ) {
        store_forward::start_retry_loop(
            Arc::clone(self),
            app_wg,
            app_cancel,
            store_forward_wg,
            store_forward_cancel,
        );
    }
}

/// Decode `data` when it is valid standard base64 (decode/re-encode
/// equality), `None` otherwise.
fn decode_if_base64(data: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(data).ok()?.trim_end();
    let decoded = BASE64.decode(text).ok()?;
    (BASE64.encode(&decoded) == text).then_some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdk_config::StoreAndForwardConfig;
    use fdk_core::pipeline::CustomDecoder;

    fn runtime_with_target(target: TargetType) -> Arc<FunctionsPipelineRuntime> {
        let handles = Arc::new(ServiceHandles::default());
        let store_forward = StoreAndForward::new(
            "test-service",
            StoreAndForwardConfig::default(),
            None,
            &handles,
        );
        Arc::new(FunctionsPipelineRuntime::new(
            "test-service",
            target,
            handles,
            store_forward,
        ))
    }

    fn runtime() -> Arc<FunctionsPipelineRuntime> {
        runtime_with_target(TargetType::Event)
    }

    fn ctx(rt: &FunctionsPipelineRuntime) -> Context {
        Context::new("corr-1", CONTENT_TYPE_JSON, Arc::clone(rt.handles()))
    }

    fn passthrough(name: &str) -> Transform {
        Transform::new(name, |_ctx, data| FunctionResult::Continue(Some(data)))
    }

    // -- registry --

    #[test]
    fn add_pipeline_then_duplicate_conflicts() {
        let rt = runtime();
        rt.add_function_pipeline("p1", vec!["#".into()], vec![passthrough("f1")])
            .unwrap();
        let err = rt
            .add_function_pipeline("p1", vec!["#".into()], vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrKind::StatusConflict);
    }

    #[test]
    fn add_registers_three_metrics_and_remove_unregisters() {
        let rt = runtime();
        rt.add_function_pipeline("p1", vec!["#".into()], vec![passthrough("f1")])
            .unwrap();
        let metrics = rt.handles().metrics();
        assert!(metrics.is_registered("PipelineMessagesProcessed-p1"));
        assert!(metrics.is_registered("PipelineMessageProcessingTime-p1"));
        assert!(metrics.is_registered("PipelineProcessingErrors-p1"));

        rt.remove_all_function_pipelines();
        assert!(!metrics.is_registered("PipelineMessagesProcessed-p1"));

        // Names are free again after removal.
        rt.add_function_pipeline("p1", vec!["#".into()], vec![passthrough("f1")])
            .unwrap();
        assert!(metrics.is_registered("PipelineMessagesProcessed-p1"));
    }

    #[test]
    fn default_pipeline_is_created_on_demand() {
        let rt = runtime();
        assert!(rt.get_pipeline_by_id(DEFAULT_PIPELINE_ID).is_none());
        let def = rt.get_default_pipeline();
        assert_eq!(def.id(), DEFAULT_PIPELINE_ID);
        assert_eq!(def.topics(), ["#".to_string()]);
        // Second call returns the same pipeline.
        assert!(Arc::ptr_eq(&def, &rt.get_default_pipeline()));
    }

    #[test]
    fn set_default_transforms_changes_hash() {
        let rt = runtime();
        let def = rt.get_default_pipeline();
        let before = def.hash();
        rt.set_default_functions_pipeline(vec![passthrough("f1"), passthrough("f2")]);
        assert_ne!(def.hash(), before);
        assert_eq!(def.transforms().len(), 2);
    }

    #[test]
    fn matching_pipelines_follow_insertion_order() {
        let rt = runtime();
        rt.add_function_pipeline("a", vec!["sensors/+/temp".into()], vec![])
            .unwrap();
        rt.add_function_pipeline("b", vec!["sensors/#".into()], vec![])
            .unwrap();
        rt.get_default_pipeline();

        let matched = rt.get_matching_pipelines("sensors/room1/temp");
        let ids: Vec<&str> = matched.iter().map(|p| p.id()).collect();
        assert_eq!(ids, ["a", "b", DEFAULT_PIPELINE_ID]);

        let matched = rt.get_matching_pipelines("sensors/room1/humidity");
        let ids: Vec<&str> = matched.iter().map(|p| p.id()).collect();
        assert_eq!(ids, ["b", DEFAULT_PIPELINE_ID]);
    }

    // -- decoding --

    fn event_json() -> Vec<u8> {
        serde_json::to_vec(&Event::new("d1", "p1", "s1")).unwrap()
    }

    #[test]
    fn decode_bare_event_populates_context() {
        let rt = runtime();
        let c = ctx(&rt);
        let envelope =
            MessageEnvelope::new("corr-9", CONTENT_TYPE_JSON, event_json(), "events/d1");
        let data = rt.decode_message(&c, &envelope).unwrap();
        assert_eq!(data.as_event().unwrap().device_name, "d1");
        assert_eq!(c.get_value(KEY_DEVICE_NAME).as_deref(), Some("d1"));
        assert_eq!(c.get_value(KEY_PROFILE_NAME).as_deref(), Some("p1"));
        assert_eq!(c.get_value(KEY_SOURCE_NAME).as_deref(), Some("s1"));
        assert_eq!(c.get_value(KEY_RECEIVED_TOPIC).as_deref(), Some("events/d1"));
        assert_eq!(c.correlation_id(), "corr-9");
    }

    #[test]
    fn decode_wrapped_add_event_request() {
        let rt = runtime();
        let c = ctx(&rt);
        let request = AddEventRequest::new(Event::new("dev", "prof", "src"));
        let payload = serde_json::to_vec(&request).unwrap();
        let envelope = MessageEnvelope::new("c", CONTENT_TYPE_JSON, payload, "t");
        let data = rt.decode_message(&c, &envelope).unwrap();
        assert_eq!(data.as_event().unwrap().device_name, "dev");
    }

    #[test]
    fn decode_base64_wrapped_event() {
        let rt = runtime();
        let c = ctx(&rt);
        let encoded = BASE64.encode(event_json()).into_bytes();
        let envelope = MessageEnvelope::new("c", CONTENT_TYPE_JSON, encoded, "t");
        let data = rt.decode_message(&c, &envelope).unwrap();
        assert_eq!(data.as_event().unwrap().device_name, "d1");
    }

    #[test]
    fn decode_event_rejects_non_json_content_type() {
        let rt = runtime();
        let c = ctx(&rt);
        let envelope = MessageEnvelope::new("c", "application/cbor", event_json(), "t");
        let err = rt.decode_message(&c, &envelope).unwrap_err();
        assert_eq!(err.kind(), ErrKind::ContractInvalid);
    }

    #[test]
    fn decode_event_rejects_garbage() {
        let rt = runtime();
        let c = ctx(&rt);
        let envelope =
            MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"not json at all".to_vec(), "t");
        assert!(rt.decode_message(&c, &envelope).is_err());
    }

    #[test]
    fn decode_raw_passes_bytes_through() {
        let rt = runtime_with_target(TargetType::Raw);
        let c = ctx(&rt);
        let envelope = MessageEnvelope::new("c", "application/cbor", vec![0xA1, 0x61], "t");
        let data = rt.decode_message(&c, &envelope).unwrap();
        assert_eq!(data.as_bytes(), Some(&[0xA1, 0x61][..]));
    }

    #[test]
    fn decode_custom_uses_decoder() {
        let decoder: CustomDecoder = Arc::new(|bytes| {
            let value: serde_json::Value = serde_json::from_slice(bytes)
                .map_err(|e| FdkError::new(ErrKind::ContractInvalid, "bad json").with_source(e))?;
            Ok(PipelineData::Value(value))
        });
        let rt = runtime_with_target(TargetType::Custom {
            name: "Telemetry".into(),
            decoder,
        });
        let c = ctx(&rt);
        let envelope =
            MessageEnvelope::new("c", CONTENT_TYPE_JSON, b"{\"x\":1}".to_vec(), "t");
        let data = rt.decode_message(&c, &envelope).unwrap();
        assert!(matches!(data, PipelineData::Value(_)));
    }

    #[test]
    fn decode_custom_requires_json_content_type() {
        let decoder: CustomDecoder = Arc::new(|_| Ok(PipelineData::Value(serde_json::json!({}))));
        let rt = runtime_with_target(TargetType::Custom {
            name: "Telemetry".into(),
            decoder,
        });
        let c = ctx(&rt);
        let envelope = MessageEnvelope::new("c", "text/plain", b"{}".to_vec(), "t");
        let err = rt.decode_message(&c, &envelope).unwrap_err();
        assert!(err.to_string().contains("Telemetry"));
    }

    // -- execution --

    #[tokio::test]
    async fn execute_passes_result_to_next_function() {
        let rt = runtime();
        let c = ctx(&rt);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let pipeline = rt
            .add_function_pipeline(
                "p",
                vec!["#".into()],
                vec![
                    Transform::new("emit", |_ctx, _data| {
                        FunctionResult::Continue(Some(PipelineData::Bytes(b"one".to_vec())))
                    }),
                    Transform::new("record", move |_ctx, data| {
                        seen2.lock()
                            .unwrap()
                            .push(data.as_bytes().unwrap().to_vec());
                        FunctionResult::Continue(None)
                    }),
                ],
            )
            .unwrap();

        rt.process_message(&c, PipelineData::Bytes(b"zero".to_vec()), &pipeline)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [b"one".to_vec()]);
        assert_eq!(c.get_value(KEY_PIPELINE_ID).as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn continue_none_reuses_previous_input() {
        let rt = runtime();
        let c = ctx(&rt);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let pipeline = rt
            .add_function_pipeline(
                "p",
                vec!["#".into()],
                vec![
                    Transform::new("noop", |_ctx, _data| FunctionResult::Continue(None)),
                    Transform::new("record", move |_ctx, data| {
                        seen2.lock()
                            .unwrap()
                            .push(data.as_bytes().unwrap().to_vec());
                        FunctionResult::Stop
                    }),
                ],
            )
            .unwrap();

        rt.process_message(&c, PipelineData::Bytes(b"orig".to_vec()), &pipeline)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), [b"orig".to_vec()]);
    }

    #[tokio::test]
    async fn failure_short_circuits_with_422_and_counts_error() {
        let rt = runtime();
        let c = ctx(&rt);
        let pipeline = rt
            .add_function_pipeline(
                "p",
                vec!["#".into()],
                vec![
                    Transform::new("fail", |_ctx, _data| {
                        FunctionResult::Failure(FdkError::new(
                            ErrKind::ServiceUnavailable,
                            "endpoint down",
                        ))
                    }),
                    Transform::new("never", |_ctx, _data| {
                        panic!("must not run after failure")
                    }),
                ],
            )
            .unwrap();

        let err = rt
            .process_message(&c, PipelineData::Bytes(b"x".to_vec()), &pipeline)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(pipeline.metrics().processing_errors.count(), 1);
    }

    #[tokio::test]
    async fn clean_stop_is_not_an_error_and_not_counted() {
        let rt = runtime();
        let c = ctx(&rt);
        let pipeline = rt
            .add_function_pipeline(
                "p",
                vec!["#".into()],
                vec![
                    Transform::new("stop", |_ctx, _data| FunctionResult::Stop),
                    Transform::new("never", |_ctx, _data| panic!("must not run after stop")),
                ],
            )
            .unwrap();

        rt.process_message(&c, PipelineData::Bytes(b"x".to_vec()), &pipeline)
            .await
            .unwrap();
        assert_eq!(pipeline.metrics().processing_errors.count(), 0);
    }

    #[tokio::test]
    async fn retry_execution_starts_at_position_with_verbatim_payload() {
        let rt = runtime();
        let c = ctx(&rt);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = |label: &'static str, seen: Arc<std::sync::Mutex<Vec<String>>>| {
            Transform::new(label, move |_ctx, data| {
                let text = String::from_utf8(data.as_bytes().unwrap().to_vec()).unwrap();
                seen.lock().unwrap().push(format!("{label}:{text}"));
                FunctionResult::Continue(None)
            })
        };
        let pipeline = rt
            .add_function_pipeline(
                "p",
                vec!["#".into()],
                vec![
                    record("f1", Arc::clone(&seen)),
                    record("f2", Arc::clone(&seen)),
                    record("f3", Arc::clone(&seen)),
                ],
            )
            .unwrap();

        rt.execute_pipeline(&c, PipelineData::Bytes(b"persisted".to_vec()), &pipeline, 2, true)
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["f3:persisted".to_string()]);
    }

    #[test]
    fn base64_detection() {
        assert_eq!(decode_if_base64(b"aGVsbG8=").as_deref(), Some(&b"hello"[..]));
        assert!(decode_if_base64(b"{\"json\": true}").is_none());
        assert!(decode_if_base64(&[0xff, 0xfe]).is_none());
    }
}
