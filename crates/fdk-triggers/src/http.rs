// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP POST trigger.
//!
//! Binds `POST /api/v3/trigger`; each request body becomes one envelope run
//! through the default pipeline only. The response body carries the
//! context's response data.

use crate::{Deferred, ServiceBinding, Trigger};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use fdk_core::sync::{CancellationToken, WaitGroup};
use fdk_core::{CORRELATION_HEADER, MessageEnvelope};
use fdk_error::FdkResult;
use std::sync::Arc;
use tracing::{debug, info};

/// Route the trigger binds.
pub const API_TRIGGER_ROUTE: &str = "/api/v3/trigger";

/// Trigger that turns HTTP POST requests into pipeline invocations.
pub struct HttpTrigger {
    binding: Arc<dyn ServiceBinding>,
}

impl HttpTrigger {
    /// Create the trigger over the given binding.
    #[must_use]
    pub fn new(binding: Arc<dyn ServiceBinding>) -> Self {
        Self { binding }
    }

    /// The router fragment the service merges into its web server.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route(API_TRIGGER_ROUTE, post(request_handler))
            .with_state(Arc::clone(&self.binding))
    }
}

#[async_trait::async_trait]
impl Trigger for HttpTrigger {
    async fn initialize(
        &self,
        _ctx_done: CancellationToken,
        _app_wg: &WaitGroup,
    ) -> FdkResult<Option<Deferred>> {
        // The route itself is served by the service's web server; nothing to
        // spawn or tear down here.
        info!(target: "fdk.trigger.http", route = API_TRIGGER_ROUTE, "HTTP trigger initialized");
        Ok(None)
    }
}

async fn request_handler(
    State(binding): State<Arc<dyn ServiceBinding>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    debug!(target: "fdk.trigger.http", bytes = body.len(), "request body read");

    let content_type = header_value(&headers, header::CONTENT_TYPE.as_str());
    let correlation_id = header_value(&headers, CORRELATION_HEADER);
    debug!(
        target: "fdk.trigger.http",
        content_type = %content_type,
        correlation_id = %correlation_id,
        "received message from http"
    );

    let envelope = MessageEnvelope::new(correlation_id, content_type, body.to_vec(), "");
    let ctx = binding.build_context(&envelope);
    let default_pipeline = binding.get_default_pipeline();

    let data = match binding.decode_message(&ctx, &envelope) {
        Ok(data) => data,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to decode message: {e}"),
            )
                .into_response();
        }
    };

    if let Err(e) = binding
        .process_message(&ctx, data, &default_pipeline)
        .await
    {
        return (e.status, format!("failed to process message: {e}")).into_response();
    }

    let mut response = ctx.response_data().unwrap_or_default().into_response();
    if let Some(content_type) = ctx.response_content_type() {
        if let Ok(value) = content_type.parse() {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, value);
        }
    }
    debug!(
        target: "fdk.trigger.http",
        correlation_id = %ctx.correlation_id(),
        "sent http response message"
    );
    response
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::DefaultServiceBinding;
    use fdk_config::{ServiceConfig, StoreAndForwardConfig};
    use fdk_core::dtos::Event;
    use fdk_core::pipeline::{FunctionResult, TargetType};
    use fdk_core::{CONTENT_TYPE_JSON, Context, ServiceHandles, Transform};
    use fdk_runtime::{FunctionsPipelineRuntime, StoreAndForward};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn trigger_with_target(target: TargetType) -> (HttpTrigger, Arc<DefaultServiceBinding>) {
        let handles = Arc::new(ServiceHandles::default());
        let sf = StoreAndForward::new("svc", StoreAndForwardConfig::default(), None, &handles);
        let runtime = Arc::new(FunctionsPipelineRuntime::new("svc", target, handles, sf));
        let binding = Arc::new(DefaultServiceBinding::new(
            runtime,
            Arc::new(ServiceConfig::default()),
        ));
        (HttpTrigger::new(binding.clone()), binding)
    }

    async fn post(
        router: Router,
        body: &[u8],
        content_type: &str,
        correlation: Option<&str>,
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut request = axum::http::Request::builder()
            .method("POST")
            .uri(API_TRIGGER_ROUTE)
            .header(header::CONTENT_TYPE, content_type);
        if let Some(c) = correlation {
            request = request.header(CORRELATION_HEADER, c);
        }
        let response = router
            .oneshot(request.body(axum::body::Body::from(body.to_vec())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, bytes.to_vec())
    }

    #[tokio::test]
    async fn happy_path_returns_pipeline_response() {
        let (trigger, binding) = trigger_with_target(TargetType::Event);
        binding
            .runtime()
            .set_default_functions_pipeline(vec![Transform::new(
                "json-respond",
                |ctx: &Context, data| {
                    let event = data.as_event().unwrap();
                    ctx.set_response_data(serde_json::to_vec(event).unwrap());
                    ctx.set_response_content_type(CONTENT_TYPE_JSON);
                    FunctionResult::Continue(None)
                },
            )]);

        let body = serde_json::json!({
            "apiVersion": "v3",
            "event": {
                "deviceName": "d",
                "profileName": "p",
                "sourceName": "s",
                "readings": []
            }
        });
        let (status, headers, response_body) = post(
            trigger.router(),
            &serde_json::to_vec(&body).unwrap(),
            CONTENT_TYPE_JSON,
            Some("corr-http"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );
        let event: Event = serde_json::from_slice(&response_body).unwrap();
        assert_eq!(event.device_name, "d");
        assert_eq!(event.profile_name, "p");
        assert_eq!(event.source_name, "s");
    }

    #[tokio::test]
    async fn undecodable_payload_yields_500() {
        let (trigger, binding) = trigger_with_target(TargetType::Event);
        binding.runtime().get_default_pipeline();
        let (status, _headers, body) = post(
            trigger.router(),
            b"definitely not json",
            CONTENT_TYPE_JSON,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8(body).unwrap().contains("failed to decode"));
    }

    #[tokio::test]
    async fn pipeline_error_yields_422() {
        let (trigger, binding) = trigger_with_target(TargetType::Raw);
        binding
            .runtime()
            .set_default_functions_pipeline(vec![Transform::new("fail", |_ctx, _data| {
                FunctionResult::Failure(fdk_error::FdkError::new(
                    fdk_error::ErrKind::ServiceUnavailable,
                    "downstream down",
                ))
            })]);

        let (status, _headers, body) =
            post(trigger.router(), b"x", CONTENT_TYPE_JSON, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(
            String::from_utf8(body)
                .unwrap()
                .contains("failed to process")
        );
    }

    #[tokio::test]
    async fn empty_response_data_yields_empty_200() {
        let (trigger, binding) = trigger_with_target(TargetType::Raw);
        binding
            .runtime()
            .set_default_functions_pipeline(vec![Transform::new("noop", |_ctx, _data| {
                FunctionResult::Continue(None)
            })]);
        let (status, _headers, body) =
            post(trigger.router(), b"x", CONTENT_TYPE_JSON, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_correlation_header_defaults_to_empty() {
        let (trigger, binding) = trigger_with_target(TargetType::Raw);
        let observed = Arc::new(std::sync::Mutex::new(None));
        let observed2 = Arc::clone(&observed);
        binding
            .runtime()
            .set_default_functions_pipeline(vec![Transform::new(
                "capture",
                move |ctx: &Context, _data| {
                    *observed2.lock().unwrap() = Some(ctx.correlation_id());
                    FunctionResult::Continue(None)
                },
            )]);
        post(trigger.router(), b"x", CONTENT_TYPE_JSON, None).await;
        assert_eq!(observed.lock().unwrap().as_deref(), Some(""));
    }
}
