// SPDX-License-Identifier: MIT OR Apache-2.0
//! SQLite-backed store client.
//!
//! One connection guarded by a mutex; the retry engine serialises its passes
//! with its own in-progress flag, so contention here is incidental. Calls hop
//! through `spawn_blocking` to keep rusqlite's synchronous I/O off the
//! async workers.

use crate::{StoreClient, StoredObject};
use async_trait::async_trait;
use fdk_error::{ErrKind, FdkError, FdkResult};
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stored_objects (
    id                TEXT PRIMARY KEY,
    app_service_key   TEXT NOT NULL,
    payload           BLOB NOT NULL,
    pipeline_id       TEXT NOT NULL,
    pipeline_position INTEGER NOT NULL,
    version           TEXT NOT NULL,
    correlation_id    TEXT NOT NULL DEFAULT '',
    retry_count       INTEGER NOT NULL DEFAULT 0,
    context_data      TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_stored_objects_service_key
    ON stored_objects (app_service_key);
";

/// Store client persisting to a local SQLite file.
pub struct SqliteStoreClient {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStoreClient {
    /// Open (or create) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::Database`] when the file cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> FdkResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(target: "fdk.store", path = %path.as_ref().display(), "store-and-forward database ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database; contents vanish on drop.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::Database`] when the schema cannot be applied.
    pub fn open_in_memory() -> FdkResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, job: F) -> FdkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> FdkResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection poisoned");
            job(&conn)
        })
        .await
        .map_err(|e| FdkError::new(ErrKind::Database, "store task aborted").with_source(e))?
    }
}

fn db_err(e: rusqlite::Error) -> FdkError {
    FdkError::new(ErrKind::Database, "sqlite operation failed").with_source(e)
}

fn row_to_object(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredObject> {
    let context_json: String = row.get("context_data")?;
    let context_data: HashMap<String, String> =
        serde_json::from_str(&context_json).unwrap_or_default();
    Ok(StoredObject {
        id: row.get("id")?,
        app_service_key: row.get("app_service_key")?,
        payload: row.get("payload")?,
        pipeline_id: row.get("pipeline_id")?,
        pipeline_position: row.get::<_, i64>("pipeline_position")? as usize,
        version: row.get("version")?,
        correlation_id: row.get("correlation_id")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        context_data,
    })
}

#[async_trait]
impl StoreClient for SqliteStoreClient {
    async fn store(&self, mut object: StoredObject) -> FdkResult<String> {
        object.validate_contract(false)?;
        let id = object.id.clone();
        self.with_conn(move |conn| {
            let context_json = serde_json::to_string(&object.context_data)
                .map_err(|e| FdkError::new(ErrKind::ContractInvalid, "context data not serialisable").with_source(e))?;
            conn.execute(
                "INSERT INTO stored_objects
                   (id, app_service_key, payload, pipeline_id, pipeline_position,
                    version, correlation_id, retry_count, context_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    object.id,
                    object.app_service_key,
                    object.payload,
                    object.pipeline_id,
                    object.pipeline_position as i64,
                    object.version,
                    object.correlation_id,
                    i64::from(object.retry_count),
                    context_json,
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn retrieve_from_store(&self, app_service_key: &str) -> FdkResult<Vec<StoredObject>> {
        if app_service_key.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "app service key cannot be empty",
            ));
        }
        let key = app_service_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, app_service_key, payload, pipeline_id, pipeline_position,
                            version, correlation_id, retry_count, context_data
                       FROM stored_objects
                      WHERE app_service_key = ?1
                      ORDER BY id",
                )
                .map_err(db_err)?;
            let objects = stmt
                .query_map(params![key], row_to_object)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(objects)
        })
        .await
    }

    async fn update(&self, mut object: StoredObject) -> FdkResult<()> {
        object.validate_contract(true)?;
        self.with_conn(move |conn| {
            let context_json = serde_json::to_string(&object.context_data)
                .map_err(|e| FdkError::new(ErrKind::ContractInvalid, "context data not serialisable").with_source(e))?;
            let changed = conn
                .execute(
                    "UPDATE stored_objects
                        SET app_service_key = ?2, payload = ?3, pipeline_id = ?4,
                            pipeline_position = ?5, version = ?6, correlation_id = ?7,
                            retry_count = ?8, context_data = ?9
                      WHERE id = ?1",
                    params![
                        object.id,
                        object.app_service_key,
                        object.payload,
                        object.pipeline_id,
                        object.pipeline_position as i64,
                        object.version,
                        object.correlation_id,
                        i64::from(object.retry_count),
                        context_json,
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(FdkError::new(
                    ErrKind::EntityDoesNotExist,
                    format!("no stored object with id '{}'", object.id),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn remove_from_store(&self, object: &StoredObject) -> FdkResult<()> {
        let id = object.id.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute("DELETE FROM stored_objects WHERE id = ?1", params![id])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(FdkError::new(
                    ErrKind::EntityDoesNotExist,
                    format!("no stored object with id '{id}'"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn disconnect(&self) -> FdkResult<()> {
        Ok(())
    }
}
