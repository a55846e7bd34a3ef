// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable kind tags for the edge functions SDK.
//!
//! Every SDK error carries an [`ErrKind`] (a machine-readable, stable
//! category), a human-readable message, and an optional wrapped cause.
//! Each kind maps to exactly one HTTP status code so triggers can translate
//! pipeline failures into transport responses without inspecting messages.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrKind
// ---------------------------------------------------------------------------

/// Categorical identifier giving high-level insight into an error's type.
///
/// The serialised form of each variant is stable and will not change across
/// patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrKind {
    /// No more specific kind could be determined.
    Unknown,
    /// The backing data store rejected or failed an operation.
    Database,
    /// A remote peer could not be reached or answered incorrectly.
    Communication,
    /// The requested entity does not exist.
    #[serde(rename = "NotFound")]
    EntityDoesNotExist,
    /// The payload or request violates its contract.
    ContractInvalid,
    /// An unexpected internal failure.
    #[serde(rename = "UnexpectedServerError")]
    ServerError,
    /// A configured limit was exceeded.
    LimitExceeded,
    /// The operation conflicts with existing state.
    StatusConflict,
    /// An entity with the same name already exists.
    DuplicateName,
    /// A provided identifier is malformed.
    InvalidId,
    /// A required collaborator service is unavailable.
    ServiceUnavailable,
    /// The operation is not permitted.
    NotAllowed,
    /// The service is administratively locked.
    ServiceLocked,
    /// The operation is recognised but not implemented.
    NotImplemented,
    /// A requested range cannot be satisfied.
    RangeNotSatisfiable,
    /// An I/O operation failed.
    #[serde(rename = "IOError")]
    IoError,
}

impl ErrKind {
    /// The HTTP status code this kind maps to.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Unknown | Self::Database | Self::ServerError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Communication => StatusCode::BAD_GATEWAY,
            Self::EntityDoesNotExist => StatusCode::NOT_FOUND,
            Self::ContractInvalid | Self::InvalidId => StatusCode::BAD_REQUEST,
            Self::StatusConflict | Self::DuplicateName => StatusCode::CONFLICT,
            Self::LimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::ServiceLocked => StatusCode::LOCKED,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::IoError => StatusCode::FORBIDDEN,
        }
    }

    /// Maps an HTTP status code back to the kind that produced it.
    ///
    /// Statuses that several kinds share resolve to the broadest member of
    /// the group; unmapped statuses resolve to [`ErrKind::Unknown`].
    pub fn from_http_status(status: StatusCode) -> Self {
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => Self::ServerError,
            StatusCode::BAD_GATEWAY => Self::Communication,
            StatusCode::NOT_FOUND => Self::EntityDoesNotExist,
            StatusCode::BAD_REQUEST => Self::ContractInvalid,
            StatusCode::CONFLICT => Self::StatusConflict,
            StatusCode::PAYLOAD_TOO_LARGE => Self::LimitExceeded,
            StatusCode::SERVICE_UNAVAILABLE => Self::ServiceUnavailable,
            StatusCode::METHOD_NOT_ALLOWED => Self::NotAllowed,
            StatusCode::LOCKED => Self::ServiceLocked,
            StatusCode::NOT_IMPLEMENTED => Self::NotImplemented,
            StatusCode::RANGE_NOT_SATISFIABLE => Self::RangeNotSatisfiable,
            StatusCode::FORBIDDEN => Self::IoError,
            _ => Self::Unknown,
        }
    }

    /// Stable string representation of the kind (matches the serde form).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Database => "Database",
            Self::Communication => "Communication",
            Self::EntityDoesNotExist => "NotFound",
            Self::ContractInvalid => "ContractInvalid",
            Self::ServerError => "UnexpectedServerError",
            Self::LimitExceeded => "LimitExceeded",
            Self::StatusConflict => "StatusConflict",
            Self::DuplicateName => "DuplicateName",
            Self::InvalidId => "InvalidId",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::NotAllowed => "NotAllowed",
            Self::ServiceLocked => "ServiceLocked",
            Self::NotImplemented => "NotImplemented",
            Self::RangeNotSatisfiable => "RangeNotSatisfiable",
            Self::IoError => "IOError",
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FdkError
// ---------------------------------------------------------------------------

/// Unified SDK error.
///
/// Carries a stable [`ErrKind`], a human-readable message, and an optional
/// source error for cause-chaining.
///
/// # Builder usage
///
/// ```
/// use fdk_error::{ErrKind, FdkError};
///
/// let err = FdkError::new(ErrKind::StatusConflict, "pipeline 'export' already exists");
/// assert_eq!(err.kind(), ErrKind::StatusConflict);
/// ```
pub struct FdkError {
    kind: ErrKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FdkError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Wrap another error, inheriting its kind when it is itself an
    /// [`FdkError`], and [`ErrKind::Unknown`] otherwise.
    pub fn wrap(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let any: &dyn std::error::Error = &source;
        let kind = any
            .downcast_ref::<FdkError>()
            .map_or(ErrKind::Unknown, FdkError::kind);
        Self {
            kind,
            message: String::new(),
            source: Some(Box::new(source)),
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The effective kind of this error.
    ///
    /// When this error's own kind is [`ErrKind::Unknown`], the cause chain is
    /// walked and the first more specific kind wins.
    pub fn kind(&self) -> ErrKind {
        if self.kind != ErrKind::Unknown {
            return self.kind;
        }
        let mut cause = self.source.as_deref().map(|s| s as &dyn std::error::Error);
        while let Some(err) = cause {
            if let Some(fdk) = err.downcast_ref::<FdkError>() {
                if fdk.kind != ErrKind::Unknown {
                    return fdk.kind;
                }
            }
            cause = err.source();
        }
        ErrKind::Unknown
    }

    /// The HTTP status code for this error's effective kind.
    pub fn http_status(&self) -> StatusCode {
        self.kind().http_status()
    }

    /// The first-level message without cause details.
    ///
    /// Falls back to the cause's first-level message when this error carries
    /// no message of its own.
    pub fn first_level_message(&self) -> String {
        if self.message.is_empty() {
            if let Some(source) = &self.source {
                if let Some(fdk) = source.downcast_ref::<FdkError>() {
                    return fdk.first_level_message();
                }
                return source.to_string();
            }
        }
        self.message.clone()
    }
}

impl fmt::Display for FdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, &self.source) {
            (msg, Some(source)) if !msg.is_empty() => write!(f, "{msg} -> {source}"),
            (_, Some(source)) => write!(f, "{source}"),
            (msg, None) => f.write_str(msg),
        }
    }
}

impl fmt::Debug for FdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FdkError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref source) = self.source {
            d.field("source", &source.to_string());
        }
        d.finish()
    }
}

impl std::error::Error for FdkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience result alias used throughout the SDK.
pub type FdkResult<T> = Result<T, FdkError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
