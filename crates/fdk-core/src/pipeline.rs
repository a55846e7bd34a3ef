// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pipelines, transforms, and the structural pipeline hash.
//!
//! A [`FunctionPipeline`] chains [`Transform`]s that inspect and reshape
//! [`PipelineData`] flowing from a trigger. Transforms run in insertion
//! order; a [`FunctionResult::Failure`] short-circuits the remainder with an
//! error while [`FunctionResult::Stop`] short-circuits it cleanly.

use crate::context::Context;
use crate::dtos::Event;
use crate::metrics::{Counter, Timer};
use fdk_error::FdkError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, RwLock};

// ---------------------------------------------------------------------------
// Pipeline data and targets
// ---------------------------------------------------------------------------

/// Data flowing between transforms, tagged by the pipeline's target shape.
#[derive(Debug, Clone)]
pub enum PipelineData {
    /// Raw payload bytes, untouched by decoding.
    Bytes(Vec<u8>),
    /// A decoded event DTO.
    Event(Event),
    /// A decoded custom object.
    Value(serde_json::Value),
}

impl PipelineData {
    /// Borrow the raw bytes, when this is the `Bytes` variant.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the event, when this is the `Event` variant.
    #[must_use]
    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }
}

/// Decoder callback for custom pipeline targets.
pub type CustomDecoder = Arc<dyn Fn(&[u8]) -> Result<PipelineData, FdkError> + Send + Sync>;

/// The shape an inbound payload is decoded into before entering a pipeline.
#[derive(Clone)]
pub enum TargetType {
    /// Pass payload bytes through untouched.
    Raw,
    /// Decode as an event DTO (wrapped request or bare event, optionally
    /// base64-wrapped). This is the default.
    Event,
    /// Decode with a caller-supplied decoder; payload must be JSON.
    Custom {
        /// Type name used in log messages.
        name: String,
        /// Decoder invoked with the raw payload.
        decoder: CustomDecoder,
    },
}

impl Default for TargetType {
    fn default() -> Self {
        Self::Event
    }
}

impl fmt::Debug for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("Raw"),
            Self::Event => f.write_str("Event"),
            Self::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Outcome of one transform invocation.
pub enum FunctionResult {
    /// Continue with the given data; `None` reuses the previous input.
    Continue(Option<PipelineData>),
    /// End the pipeline cleanly without an error.
    Stop,
    /// End the pipeline with an error.
    Failure(FdkError),
}

type TransformFn = dyn Fn(&Context, PipelineData) -> FunctionResult + Send + Sync;

/// A named pipeline function.
///
/// The name participates in the pipeline's structural hash, so two
/// pipelines with the same transform names in the same order share a hash.
#[derive(Clone)]
pub struct Transform {
    name: Arc<str>,
    func: Arc<TransformFn>,
}

impl Transform {
    /// Wrap a function under a stable name.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&Context, PipelineData) -> FunctionResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Arc::from(name.into()),
            func: Arc::new(func),
        }
    }

    /// The transform's stable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the transform.
    pub fn call(&self, ctx: &Context, data: PipelineData) -> FunctionResult {
        (self.func)(ctx, data)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transform({})", self.name)
    }
}

/// Compute the structural hash of a transform sequence.
///
/// The hash is the lowercase hex SHA-256 over the ordered transform names;
/// it is stable while the sequence is unchanged and differs for any
/// reordering, insertion, or removal.
#[must_use]
pub fn calculate_pipeline_hash(transforms: &[Transform]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pipeline-functions:");
    for t in transforms {
        hasher.update(b" ");
        hasher.update(t.name().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// FunctionPipeline
// ---------------------------------------------------------------------------

/// Per-pipeline metric instruments, registered by the runtime.
#[derive(Clone, Debug, Default)]
pub struct PipelineMetrics {
    /// Messages handed to this pipeline (attempts, counted at receipt).
    pub messages_processed: Counter,
    /// Wall-clock time over whole pipeline invocations.
    pub message_processing_time: Timer,
    /// Failed pipeline invocations.
    pub processing_errors: Counter,
}

struct PipelineState {
    transforms: Vec<Transform>,
    hash: String,
}

/// An ordered, named sequence of transforms bound to topic patterns.
///
/// The transform list and its hash sit behind one lock so the default
/// pipeline's transforms can be swapped atomically while readers take
/// consistent snapshots.
pub struct FunctionPipeline {
    id: String,
    topics: Vec<String>,
    state: RwLock<PipelineState>,
    metrics: PipelineMetrics,
}

impl FunctionPipeline {
    /// Create a pipeline with the given id, topic patterns, and transforms.
    #[must_use]
    pub fn new(id: impl Into<String>, topics: Vec<String>, transforms: Vec<Transform>) -> Self {
        let hash = calculate_pipeline_hash(&transforms);
        Self {
            id: id.into(),
            topics,
            state: RwLock::new(PipelineState { transforms, hash }),
            metrics: PipelineMetrics::default(),
        }
    }

    /// The pipeline's unique id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The pipeline's topic patterns.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Snapshot of the current transform list.
    #[must_use]
    pub fn transforms(&self) -> Vec<Transform> {
        self.state
            .read()
            .expect("pipeline state poisoned")
            .transforms
            .clone()
    }

    /// The current structural hash.
    #[must_use]
    pub fn hash(&self) -> String {
        self.state
            .read()
            .expect("pipeline state poisoned")
            .hash
            .clone()
    }

    /// Replace the transform list, recomputing the hash atomically.
    pub fn set_transforms(&self, transforms: Vec<Transform>) {
        let hash = calculate_pipeline_hash(&transforms);
        let mut state = self.state.write().expect("pipeline state poisoned");
        state.transforms = transforms;
        state.hash = hash;
    }

    /// The pipeline's metric instruments.
    #[must_use]
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }
}

impl fmt::Debug for FunctionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionPipeline")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .field("transforms", &self.transforms().len())
            .finish()
    }
}
