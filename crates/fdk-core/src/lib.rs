// SPDX-License-Identifier: MIT OR Apache-2.0
//! fdk-core
//!
//! Core building blocks of the edge functions SDK.
//!
//! Responsibilities:
//! - the transport-agnostic [`MessageEnvelope`](envelope::MessageEnvelope)
//! - the per-message [`Context`](context::Context) workspace
//! - pipeline and transform types, including the structural pipeline hash
//! - topic pattern matching with `#` / `+` wildcards
//! - the metrics manager and its lock-free counters and timers
//! - the secret provider and messaging client seams
//! - cancellation, wait-group, and retry-window primitives

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Per-message mutable workspace shared with every transform.
pub mod context;
/// Event and reading data transfer objects.
pub mod dtos;
/// Immutable transport-agnostic message carrier.
pub mod envelope;
/// Messaging client seam and the in-process loopback bus.
pub mod messaging;
/// Metrics manager, counters, and timers.
pub mod metrics;
/// Pipelines, transforms, and the structural hash.
pub mod pipeline;
/// Secret provider seam and the insecure in-memory provider.
pub mod secrets;
/// Cancellation tokens, wait groups, and retry windows.
pub mod sync;
/// Topic pattern matching.
pub mod topics;

pub use context::{Context, ServiceHandles};
pub use envelope::MessageEnvelope;
pub use pipeline::{FunctionPipeline, FunctionResult, PipelineData, TargetType, Transform};

/// Id of the distinguished pipeline that matches every topic.
pub const DEFAULT_PIPELINE_ID: &str = "default-pipeline";

/// Context value key holding the device name of a decoded event.
pub const KEY_DEVICE_NAME: &str = "devicename";
/// Context value key holding the profile name of a decoded event.
pub const KEY_PROFILE_NAME: &str = "profilename";
/// Context value key holding the source name of a decoded event.
pub const KEY_SOURCE_NAME: &str = "sourcename";
/// Context value key holding the topic a message arrived on.
pub const KEY_RECEIVED_TOPIC: &str = "receivedtopic";
/// Context value key holding the id of the executing pipeline.
pub const KEY_PIPELINE_ID: &str = "pipelineid";

/// MIME type for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// MIME type for CBOR payloads.
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";
/// Header carrying the end-to-end correlation id.
pub const CORRELATION_HEADER: &str = "X-Correlation-ID";
