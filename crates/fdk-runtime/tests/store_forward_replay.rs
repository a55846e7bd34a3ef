// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end store-and-forward behaviour against the SQLite store.

use fdk_config::StoreAndForwardConfig;
use fdk_core::pipeline::{FunctionResult, TargetType};
use fdk_core::{Context, PipelineData, ServiceHandles, Transform};
use fdk_error::{ErrKind, FdkError};
use fdk_runtime::{FunctionsPipelineRuntime, StoreAndForward};
use fdk_store::{SqliteStoreClient, StoreClient};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

const SERVICE_KEY: &str = "replay-test-service";

fn runtime_with_sqlite(
    store: Arc<SqliteStoreClient>,
    max_retry_count: u32,
) -> Arc<FunctionsPipelineRuntime> {
    let handles = Arc::new(ServiceHandles::default());
    let config = StoreAndForwardConfig {
        enabled: true,
        retry_interval: "1s".into(),
        max_retry_count,
    };
    let sf = StoreAndForward::new(SERVICE_KEY, config, Some(store), &handles);
    Arc::new(FunctionsPipelineRuntime::new(
        SERVICE_KEY,
        TargetType::Raw,
        handles,
        sf,
    ))
}

fn failing_exporter() -> Transform {
    Transform::new("export", |ctx: &Context, _data| {
        ctx.set_retry_data(Some(b"abc".to_vec()));
        FunctionResult::Failure(FdkError::new(ErrKind::ServiceUnavailable, "sink offline"))
    })
}

async fn submit_failing_message(rt: &Arc<FunctionsPipelineRuntime>) {
    let pipeline = rt.get_pipeline_by_id("export").unwrap();
    let ctx = Context::new("corr-replay", "application/json", Arc::clone(rt.handles()));
    let result = rt
        .process_message(&ctx, PipelineData::Bytes(b"payload".to_vec()), &pipeline)
        .await;
    assert!(result.is_err(), "exporter was expected to fail");
}

#[tokio::test]
async fn replay_after_pipeline_recovery_empties_the_queue() {
    let store = Arc::new(SqliteStoreClient::open_in_memory().unwrap());
    let rt = runtime_with_sqlite(store.clone(), 10);
    rt.add_function_pipeline("export", vec!["#".into()], vec![failing_exporter()])
        .unwrap();

    submit_failing_message(&rt).await;

    let stored = store.retrieve_from_store(SERVICE_KEY).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].retry_count, 0);
    assert_eq!(stored[0].payload, b"abc");
    assert_eq!(rt.store_forward().queue_depth(), 1);

    // Swap in a succeeding exporter under the same transform name so the
    // stored version still matches.
    let replayed = Arc::new(AtomicU32::new(0));
    let replayed2 = Arc::clone(&replayed);
    rt.set_functions_pipeline_transforms(
        "export",
        vec![Transform::new("export", move |_ctx, data| {
            assert_eq!(data.as_bytes(), Some(&b"abc"[..]));
            replayed2.fetch_add(1, Ordering::SeqCst);
            FunctionResult::Continue(None)
        })],
    );

    rt.store_forward().retry_stored_data(&rt).await;

    assert_eq!(replayed.load(Ordering::SeqCst), 1);
    assert!(store.retrieve_from_store(SERVICE_KEY).await.unwrap().is_empty());
    assert_eq!(rt.store_forward().queue_depth(), 0);
}

#[tokio::test]
async fn ancient_version_is_discarded_without_execution() {
    let store = Arc::new(SqliteStoreClient::open_in_memory().unwrap());
    let rt = runtime_with_sqlite(store.clone(), 10);

    let executed = Arc::new(AtomicU32::new(0));
    let executed2 = Arc::clone(&executed);
    rt.add_function_pipeline(
        "export",
        vec!["#".into()],
        vec![Transform::new("export", move |_ctx, _data| {
            executed2.fetch_add(1, Ordering::SeqCst);
            FunctionResult::Continue(None)
        })],
    )
    .unwrap();

    // Persist an object whose version predates the current pipeline.
    let mut relic = fdk_store::StoredObject::new(
        SERVICE_KEY,
        b"old-payload".to_vec(),
        "export",
        0,
        "ancient-version",
        Default::default(),
    );
    relic.correlation_id = "corr-old".into();
    store.store(relic).await.unwrap();

    rt.store_forward().retry_stored_data(&rt).await;

    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(store.retrieve_from_store(SERVICE_KEY).await.unwrap().is_empty());
}

#[tokio::test]
async fn retries_are_bounded_by_max_retry_count() {
    let store = Arc::new(SqliteStoreClient::open_in_memory().unwrap());
    let rt = runtime_with_sqlite(store.clone(), 3);
    rt.add_function_pipeline("export", vec!["#".into()], vec![failing_exporter()])
        .unwrap();

    submit_failing_message(&rt).await;

    // Two failed passes leave the object with retry_count 2.
    rt.store_forward().retry_stored_data(&rt).await;
    rt.store_forward().retry_stored_data(&rt).await;
    let stored = store.retrieve_from_store(SERVICE_KEY).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].retry_count, 2);

    // The third pass hits the bound and removes the object.
    rt.store_forward().retry_stored_data(&rt).await;
    assert!(store.retrieve_from_store(SERVICE_KEY).await.unwrap().is_empty());
    assert_eq!(rt.store_forward().queue_depth(), 0);
}

#[tokio::test]
async fn replayed_objects_survive_process_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sf.db");

    {
        let store = Arc::new(SqliteStoreClient::open(&path).unwrap());
        let rt = runtime_with_sqlite(store, 10);
        rt.add_function_pipeline("export", vec!["#".into()], vec![failing_exporter()])
            .unwrap();
        submit_failing_message(&rt).await;
    }

    // A new runtime with the same pipeline shape picks the object up.
    let store = Arc::new(SqliteStoreClient::open(&path).unwrap());
    let rt = runtime_with_sqlite(store.clone(), 10);
    let replayed = Arc::new(AtomicU32::new(0));
    let replayed2 = Arc::clone(&replayed);
    rt.add_function_pipeline(
        "export",
        vec!["#".into()],
        vec![Transform::new("export", move |_ctx, _data| {
            replayed2.fetch_add(1, Ordering::SeqCst);
            FunctionResult::Continue(None)
        })],
    )
    .unwrap();

    rt.store_forward().retry_stored_data(&rt).await;
    assert_eq!(replayed.load(Ordering::SeqCst), 1);
    assert!(store.retrieve_from_store(SERVICE_KEY).await.unwrap().is_empty());
}
