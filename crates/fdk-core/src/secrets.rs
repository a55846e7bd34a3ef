// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secret provider seam.
//!
//! Real secret stores live outside the SDK; the core only defines the
//! contract it consumes plus the insecure in-memory provider that is seeded
//! from configuration when no secure store is wired in.

use fdk_error::{ErrKind, FdkError, FdkResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// Key-value secret data for one secret name.
pub type Secrets = HashMap<String, String>;

/// Supplies credentials by secret name and key.
pub trait SecretProvider: Send + Sync {
    /// Fetch the secret stored under `secret_name`.
    ///
    /// When `keys` is non-empty, every listed key must be present; missing
    /// keys are an [`ErrKind::EntityDoesNotExist`] error. When `keys` is
    /// empty the whole secret is returned.
    fn get_secret(&self, secret_name: &str, keys: &[&str]) -> FdkResult<Secrets>;

    /// Store (or replace) the secret under `secret_name`.
    fn store_secret(&self, secret_name: &str, secrets: Secrets) -> FdkResult<()>;
}

/// In-memory provider backed by configuration-supplied insecure secrets.
///
/// Suitable for development only; values live unencrypted in process memory.
#[derive(Default)]
pub struct InsecureSecretProvider {
    entries: RwLock<HashMap<String, Secrets>>,
}

impl InsecureSecretProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider seeded with configured secrets.
    #[must_use]
    pub fn seeded(entries: HashMap<String, Secrets>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl SecretProvider for InsecureSecretProvider {
    fn get_secret(&self, secret_name: &str, keys: &[&str]) -> FdkResult<Secrets> {
        let entries = self.entries.read().expect("secret store lock poisoned");
        let secret = entries.get(secret_name).ok_or_else(|| {
            FdkError::new(
                ErrKind::EntityDoesNotExist,
                format!("no secret found for name '{secret_name}'"),
            )
        })?;

        if keys.is_empty() {
            return Ok(secret.clone());
        }

        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|k| !secret.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            return Err(FdkError::new(
                ErrKind::EntityDoesNotExist,
                format!(
                    "no secret data found for secret '{secret_name}' keys: {}",
                    missing.join(", ")
                ),
            ));
        }

        Ok(keys
            .iter()
            .map(|k| ((*k).to_string(), secret[*k].clone()))
            .collect())
    }

    fn store_secret(&self, secret_name: &str, secrets: Secrets) -> FdkResult<()> {
        let mut entries = self.entries.write().expect("secret store lock poisoned");
        entries.insert(secret_name.to_string(), secrets);
        Ok(())
    }
}
