// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable persistence for partially-completed pipeline state.
//!
//! A [`StoredObject`] captures everything needed to resume a pipeline at the
//! function that failed; a [`StoreClient`] persists them until the retry
//! engine succeeds, exhausts its retries, or discards them on a pipeline
//! version change.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory store client for tests and broker-less assemblies.
pub mod memory;
/// SQLite-backed store client.
pub mod sqlite;

use async_trait::async_trait;
use fdk_error::{ErrKind, FdkError, FdkResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use memory::InMemoryStoreClient;
pub use sqlite::SqliteStoreClient;

// ---------------------------------------------------------------------------
// StoredObject
// ---------------------------------------------------------------------------

/// The atomic description of one partially-completed pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Unique id of this object.
    pub id: String,
    /// Key of the application service this data belongs to.
    pub app_service_key: String,
    /// Input to the function that failed.
    pub payload: Vec<u8>,
    /// Id of the pipeline to resume.
    pub pipeline_id: String,
    /// Index of the function to resume at.
    pub pipeline_position: usize,
    /// Structural hash of the pipeline at persist time.
    pub version: String,
    /// Correlation id carried from the original message.
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    /// How many retries have been attempted so far.
    pub retry_count: u32,
    /// Snapshot of the context values map at persist time.
    pub context_data: HashMap<String, String>,
}

impl StoredObject {
    /// Create a stored object for a freshly-failed pipeline function.
    #[must_use]
    pub fn new(
        app_service_key: impl Into<String>,
        payload: Vec<u8>,
        pipeline_id: impl Into<String>,
        pipeline_position: usize,
        version: impl Into<String>,
        context_data: HashMap<String, String>,
    ) -> Self {
        Self {
            id: String::new(),
            app_service_key: app_service_key.into(),
            payload,
            pipeline_id: pipeline_id.into(),
            pipeline_position,
            version: version.into(),
            correlation_id: String::new(),
            retry_count: 0,
            context_data,
        }
    }

    /// Ensure the required fields are present.
    ///
    /// When `id_required` is false a missing id is generated instead of
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::ContractInvalid`] naming the first missing field.
    pub fn validate_contract(&mut self, id_required: bool) -> FdkResult<()> {
        if self.id.is_empty() {
            if id_required {
                return Err(FdkError::new(
                    ErrKind::ContractInvalid,
                    "invalid contract, id cannot be empty",
                ));
            }
            self.id = Uuid::new_v4().to_string();
        }
        if self.app_service_key.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "invalid contract, app service key cannot be empty",
            ));
        }
        if self.payload.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "invalid contract, payload cannot be empty",
            ));
        }
        if self.version.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "invalid contract, version cannot be empty",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StoreClient
// ---------------------------------------------------------------------------

/// Contract for persisting exported data before it is forwarded.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Persist a stored object, returning its (possibly generated) id.
    async fn store(&self, object: StoredObject) -> FdkResult<String>;

    /// Fetch every object belonging to `app_service_key`.
    async fn retrieve_from_store(&self, app_service_key: &str) -> FdkResult<Vec<StoredObject>>;

    /// Replace the stored data for the object's id.
    async fn update(&self, object: StoredObject) -> FdkResult<()>;

    /// Remove an object by id.
    async fn remove_from_store(&self, object: &StoredObject) -> FdkResult<()>;

    /// End the connection. Idempotent.
    async fn disconnect(&self) -> FdkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredObject {
        StoredObject::new(
            "svc-key",
            b"payload".to_vec(),
            "pipe-1",
            2,
            "hash-v1",
            HashMap::from([("devicename".to_string(), "d1".to_string())]),
        )
    }

    #[test]
    fn validate_generates_missing_id() {
        let mut o = sample();
        o.validate_contract(false).unwrap();
        assert!(!o.id.is_empty());
    }

    #[test]
    fn validate_requires_id_when_asked() {
        let mut o = sample();
        let err = o.validate_contract(true).unwrap_err();
        assert_eq!(err.kind(), ErrKind::ContractInvalid);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        for strip in ["key", "payload", "version"] {
            let mut o = sample();
            match strip {
                "key" => o.app_service_key.clear(),
                "payload" => o.payload.clear(),
                _ => o.version.clear(),
            }
            let err = o.validate_contract(false).unwrap_err();
            assert_eq!(err.kind(), ErrKind::ContractInvalid, "field {strip}");
        }
    }

    #[test]
    fn serde_roundtrip_preserves_fields() {
        let mut o = sample();
        o.validate_contract(false).unwrap();
        o.correlation_id = "corr".into();
        o.retry_count = 3;
        let json = serde_json::to_string(&o).unwrap();
        assert!(json.contains("appServiceKey"));
        assert!(json.contains("correlationID"));
        let back: StoredObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, o);
    }
}
