// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory store client for tests and broker-less assemblies.

use crate::{StoreClient, StoredObject};
use async_trait::async_trait;
use fdk_error::{ErrKind, FdkError, FdkResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Keeps stored objects in a process-local map.
///
/// Provides the same contract semantics as the SQLite client, minus
/// durability; restarting the process loses the queue.
#[derive(Default)]
pub struct InMemoryStoreClient {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl InMemoryStoreClient {
    /// Create an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently held, across all service keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().expect("store lock poisoned").len()
    }

    /// Whether the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StoreClient for InMemoryStoreClient {
    async fn store(&self, mut object: StoredObject) -> FdkResult<String> {
        object.validate_contract(false)?;
        let id = object.id.clone();
        self.objects
            .lock()
            .expect("store lock poisoned")
            .insert(id.clone(), object);
        Ok(id)
    }

    async fn retrieve_from_store(&self, app_service_key: &str) -> FdkResult<Vec<StoredObject>> {
        if app_service_key.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "app service key cannot be empty",
            ));
        }
        let objects = self.objects.lock().expect("store lock poisoned");
        let mut out: Vec<StoredObject> = objects
            .values()
            .filter(|o| o.app_service_key == app_service_key)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn update(&self, mut object: StoredObject) -> FdkResult<()> {
        object.validate_contract(true)?;
        let mut objects = self.objects.lock().expect("store lock poisoned");
        if !objects.contains_key(&object.id) {
            return Err(FdkError::new(
                ErrKind::EntityDoesNotExist,
                format!("no stored object with id '{}'", object.id),
            ));
        }
        objects.insert(object.id.clone(), object);
        Ok(())
    }

    async fn remove_from_store(&self, object: &StoredObject) -> FdkResult<()> {
        let mut objects = self.objects.lock().expect("store lock poisoned");
        if objects.remove(&object.id).is_none() {
            return Err(FdkError::new(
                ErrKind::EntityDoesNotExist,
                format!("no stored object with id '{}'", object.id),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> FdkResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: &str) -> StoredObject {
        StoredObject::new(key, b"data".to_vec(), "p1", 0, "v1", HashMap::new())
    }

    #[tokio::test]
    async fn store_and_retrieve_by_key() {
        let client = InMemoryStoreClient::new();
        client.store(sample("a")).await.unwrap();
        client.store(sample("a")).await.unwrap();
        client.store(sample("b")).await.unwrap();

        assert_eq!(client.retrieve_from_store("a").await.unwrap().len(), 2);
        assert_eq!(client.retrieve_from_store("b").await.unwrap().len(), 1);
        assert!(client.retrieve_from_store("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_replaces_contents() {
        let client = InMemoryStoreClient::new();
        let id = client.store(sample("a")).await.unwrap();
        let mut updated = client.retrieve_from_store("a").await.unwrap().remove(0);
        updated.retry_count = 4;
        client.update(updated).await.unwrap();
        let fetched = client.retrieve_from_store("a").await.unwrap().remove(0);
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.retry_count, 4);
    }

    #[tokio::test]
    async fn update_of_unknown_id_fails() {
        let client = InMemoryStoreClient::new();
        let mut o = sample("a");
        o.id = "ghost".into();
        let err = client.update(o).await.unwrap_err();
        assert_eq!(err.kind(), ErrKind::EntityDoesNotExist);
    }

    #[tokio::test]
    async fn remove_deletes_object() {
        let client = InMemoryStoreClient::new();
        client.store(sample("a")).await.unwrap();
        let o = client.retrieve_from_store("a").await.unwrap().remove(0);
        client.remove_from_store(&o).await.unwrap();
        assert!(client.is_empty());
        let err = client.remove_from_store(&o).await.unwrap_err();
        assert_eq!(err.kind(), ErrKind::EntityDoesNotExist);
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let client = InMemoryStoreClient::new();
        let err = client.retrieve_from_store("").await.unwrap_err();
        assert_eq!(err.kind(), ErrKind::ContractInvalid);
    }
}
