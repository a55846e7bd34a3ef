// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Reference application service: decodes events and echoes them as JSON
//! through the configured trigger.

use clap::Parser;
use fdk_core::pipeline::{FunctionResult, TargetType};
use fdk_core::{CONTENT_TYPE_JSON, Context, PipelineData, Transform};
use fdk_service::{ApplicationService, CommandLine};
use tracing::error;

const SERVICE_KEY: &str = "app-echo";

#[tokio::main]
async fn main() {
    let command_line = CommandLine::parse();

    let service =
        match ApplicationService::from_environment(SERVICE_KEY, TargetType::Event, &command_line) {
            Ok(service) => service,
            Err(e) => {
                eprintln!("failed to assemble service: {e}");
                std::process::exit(1);
            }
        };

    service.set_default_functions_pipeline(vec![
        Transform::new("mark-origin", |ctx: &Context, data| {
            if let PipelineData::Event(event) = &data {
                ctx.add_value("origin-device", event.device_name.clone());
            }
            FunctionResult::Continue(Some(data))
        }),
        Transform::new("set-json-response", |ctx: &Context, data| {
            let Some(event) = data.as_event() else {
                return FunctionResult::Continue(None);
            };
            match serde_json::to_vec(event) {
                Ok(body) => {
                    ctx.set_response_data(body);
                    ctx.set_response_content_type(CONTENT_TYPE_JSON);
                    FunctionResult::Continue(None)
                }
                Err(e) => FunctionResult::Failure(
                    fdk_error::FdkError::new(
                        fdk_error::ErrKind::ContractInvalid,
                        "failed to encode event response",
                    )
                    .with_source(e),
                ),
            }
        }),
    ]);

    if let Err(e) = service.run().await {
        error!(target: "fdk.service", error = %e, "service exited with error");
        std::process::exit(1);
    }
}
