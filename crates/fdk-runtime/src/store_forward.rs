// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable retry queue for partially-completed pipelines.
//!
//! When a pipeline function fails after setting retry data, the engine
//! persists the remaining pipeline state through the injected store client.
//! A background worker periodically replays stored objects against the
//! current pipelines, discarding them on success, on retry exhaustion, or
//! when the persisted pipeline version no longer matches.

use crate::FunctionsPipelineRuntime;
use fdk_config::{StoreAndForwardConfig, parse_duration};
use fdk_core::metrics::{Counter, Metric, STORE_FORWARD_QUEUE_SIZE_NAME};
use fdk_core::sync::{CancellationToken, WaitGroup};
use fdk_core::{Context, FunctionPipeline, PipelineData, ServiceHandles};
use fdk_store::{StoreClient, StoredObject};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Smallest permitted retry interval.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The store-and-forward engine of one runtime.
pub struct StoreAndForward {
    service_key: String,
    config: StoreAndForwardConfig,
    store: Option<Arc<dyn StoreClient>>,
    queue_depth: Counter,
    in_progress: tokio::sync::Mutex<()>,
    retry_tx: mpsc::Sender<()>,
    retry_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl StoreAndForward {
    /// Create the engine and register its queue-depth metric.
    ///
    /// `store` may be `None` when store-and-forward is disabled; enabling it
    /// without a store logs an error on every capture attempt.
    #[must_use]
    pub fn new(
        service_key: impl Into<String>,
        config: StoreAndForwardConfig,
        store: Option<Arc<dyn StoreClient>>,
        handles: &Arc<ServiceHandles>,
    ) -> Self {
        let queue_depth = Counter::new();
        match handles.metrics().register(
            STORE_FORWARD_QUEUE_SIZE_NAME,
            Metric::Counter(queue_depth.clone()),
            None,
        ) {
            Ok(()) => {
                info!(target: "fdk.storeforward", metric = STORE_FORWARD_QUEUE_SIZE_NAME, "metric registered and will be reported");
            }
            Err(e) => {
                error!(target: "fdk.storeforward", metric = STORE_FORWARD_QUEUE_SIZE_NAME, error = %e, "unable to register metric; collection continues unreported");
            }
        }

        let (retry_tx, retry_rx) = mpsc::channel(1);
        Self {
            service_key: service_key.into(),
            config,
            store,
            queue_depth,
            in_progress: tokio::sync::Mutex::new(()),
            retry_tx,
            retry_rx: std::sync::Mutex::new(Some(retry_rx)),
        }
    }

    /// Whether store-and-forward is enabled in configuration.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of objects currently awaiting retry.
    #[must_use]
    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.count()
    }

    /// Capture the remaining pipeline state for a failed function.
    ///
    /// Logs and returns when store-and-forward is disabled or no store
    /// client is wired in; persistence failures are logged, not surfaced.
    pub async fn store_for_later_retry(
        &self,
        payload: Vec<u8>,
        ctx: &Context,
        pipeline: &Arc<FunctionPipeline>,
        pipeline_position: usize,
    ) {
        debug!(
            target: "fdk.storeforward",
            pipeline = %pipeline.id(),
            correlation_id = %ctx.correlation_id(),
            "storing data for later retry"
        );

        if !self.config.enabled {
            error!(
                target: "fdk.storeforward",
                pipeline = %pipeline.id(),
                "failed to store item for later retry: store and forward is not enabled"
            );
            return;
        }
        let Some(store) = &self.store else {
            error!(
                target: "fdk.storeforward",
                pipeline = %pipeline.id(),
                "failed to store item for later retry: no store client available"
            );
            return;
        };

        let mut item = StoredObject::new(
            self.service_key.clone(),
            payload,
            pipeline.id(),
            pipeline_position,
            pipeline.hash(),
            ctx.values(),
        );
        item.correlation_id = ctx.correlation_id();

        match store.store(item).await {
            Ok(_) => self.queue_depth.inc(1),
            Err(e) => {
                error!(
                    target: "fdk.storeforward",
                    pipeline = %pipeline.id(),
                    error = %e,
                    "failed to store item for later retry"
                );
            }
        }
    }

    /// Nudge the retry worker to run a pass off the normal interval.
    ///
    /// Called when an exporter succeeds after previous failures. No-op when
    /// the queue is empty or store-and-forward is disabled.
    pub fn signal_retry(&self) {
        if self.queue_depth.count() <= 0 {
            return;
        }
        if !self.config.enabled {
            debug!(target: "fdk.storeforward", "store and forward not enabled, skipping retry of failed data");
            return;
        }
        debug!(target: "fdk.storeforward", "triggering retry of failed data");
        // A full channel means a pass is already pending.
        let _ = self.retry_tx.try_send(());
    }

    /// Run one retry pass over every stored object of this service.
    ///
    /// Skips silently when another pass is already in progress.
    pub async fn retry_stored_data(&self, runtime: &FunctionsPipelineRuntime) {
        let Ok(_guard) = self.in_progress.try_lock() else {
            return;
        };
        let Some(store) = &self.store else {
            return;
        };

        let items = match store.retrieve_from_store(&self.service_key).await {
            Ok(items) => items,
            Err(e) => {
                error!(target: "fdk.storeforward", error = %e, "unable to load store and forward items");
                return;
            }
        };
        debug!(target: "fdk.storeforward", count = items.len(), "stored data items found for retrying");
        if items.is_empty() {
            return;
        }

        let (items_to_remove, items_to_update) = self.process_retry_items(runtime, items).await;
        debug!(
            target: "fdk.storeforward",
            removals = items_to_remove.len(),
            updates = items_to_update.len(),
            "applying retry results"
        );

        for item in &items_to_remove {
            if let Err(e) = store.remove_from_store(item).await {
                error!(
                    target: "fdk.storeforward",
                    pipeline = %item.pipeline_id,
                    object_id = %item.id,
                    error = %e,
                    "unable to remove stored data item"
                );
            }
        }
        for item in items_to_update {
            let (pipeline_id, object_id) = (item.pipeline_id.clone(), item.id.clone());
            if let Err(e) = store.update(item).await {
                error!(
                    target: "fdk.storeforward",
                    pipeline = %pipeline_id,
                    object_id = %object_id,
                    error = %e,
                    "unable to update stored data item"
                );
            }
        }

        self.queue_depth.dec(items_to_remove.len() as i64);
    }

    async fn process_retry_items(
        &self,
        runtime: &FunctionsPipelineRuntime,
        items: Vec<StoredObject>,
    ) -> (Vec<StoredObject>, Vec<StoredObject>) {
        let max_retry_count = self.config.max_retry_count;
        let mut items_to_remove = Vec::new();
        let mut items_to_update = Vec::new();

        // An item is removed when it retried successfully, exhausted its
        // retries, or no longer matches the current pipeline; it is updated
        // (retry count bumped) when retries remain.
        for mut item in items {
            let Some(pipeline) = runtime.get_pipeline_by_id(&item.pipeline_id) else {
                error!(
                    target: "fdk.storeforward",
                    pipeline = %item.pipeline_id,
                    "stored data item's pipeline no longer exists; removing item"
                );
                items_to_remove.push(item);
                continue;
            };

            if item.version != pipeline.hash() {
                warn!(
                    target: "fdk.storeforward",
                    pipeline = %item.pipeline_id,
                    "stored data item's version doesn't match the pipeline's current version; removing item"
                );
                items_to_remove.push(item);
                continue;
            }

            if self.retry_export_function(runtime, &item, &pipeline).await {
                debug!(
                    target: "fdk.storeforward",
                    pipeline = %item.pipeline_id,
                    correlation_id = %item.correlation_id,
                    "retry successful; removing item"
                );
                items_to_remove.push(item);
                continue;
            }

            item.retry_count += 1;
            if max_retry_count == 0 || item.retry_count < max_retry_count {
                debug!(
                    target: "fdk.storeforward",
                    pipeline = %item.pipeline_id,
                    retries = item.retry_count,
                    correlation_id = %item.correlation_id,
                    "export retry failed; incrementing retry count"
                );
                items_to_update.push(item);
            } else {
                warn!(
                    target: "fdk.storeforward",
                    pipeline = %item.pipeline_id,
                    retries = item.retry_count,
                    correlation_id = %item.correlation_id,
                    "max retries exceeded; removing item"
                );
                items_to_remove.push(item);
            }
        }

        (items_to_remove, items_to_update)
    }

    async fn retry_export_function(
        &self,
        runtime: &FunctionsPipelineRuntime,
        item: &StoredObject,
        pipeline: &Arc<FunctionPipeline>,
    ) -> bool {
        let ctx = Context::new(
            item.correlation_id.clone(),
            String::new(),
            Arc::clone(runtime.handles()),
        );
        ctx.set_values(item.context_data.clone());

        debug!(
            target: "fdk.storeforward",
            pipeline = %item.pipeline_id,
            correlation_id = %item.correlation_id,
            "retrying stored data"
        );

        runtime
            .execute_pipeline(
                &ctx,
                PipelineData::Bytes(item.payload.clone()),
                pipeline,
                item.pipeline_position,
                true,
            )
            .await
            .is_ok()
    }

    fn take_retry_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.retry_rx.lock().expect("retry receiver poisoned").take()
    }

    fn effective_retry_interval(&self) -> Duration {
        let configured = match parse_duration(&self.config.retry_interval) {
            Ok(d) => d,
            Err(e) => {
                warn!(target: "fdk.storeforward", error = %e, "retry interval failed to parse, defaulting to the minimum");
                MIN_RETRY_INTERVAL
            }
        };
        if configured < MIN_RETRY_INTERVAL {
            warn!(
                target: "fdk.storeforward",
                configured = ?configured,
                minimum = ?MIN_RETRY_INTERVAL,
                "retry interval is below the allowed minimum, raising it"
            );
            MIN_RETRY_INTERVAL
        } else {
            configured
        }
    }
}

/// Start the retry loop worker for `runtime`.
///
/// The worker registers with both wait groups, seeds the queue-depth
/// counter from the store, and then waits on the retry interval, the
/// external retry signal, and both cancellation tokens.
pub fn start_retry_loop(
    runtime: Arc<FunctionsPipelineRuntime>,
    app_wg: &WaitGroup,
    app_cancel: CancellationToken,
    store_forward_wg: &WaitGroup,
    store_forward_cancel: CancellationToken,
) {
    let sf = runtime.store_forward();
    if !sf.enabled() {
        info!(target: "fdk.storeforward", "store and forward is disabled, retry loop not started");
        return;
    }
    let Some(mut retry_rx) = sf.take_retry_receiver() else {
        warn!(target: "fdk.storeforward", "retry loop already started");
        return;
    };

    app_wg.add(1);
    store_forward_wg.add(1);
    let app_wg = app_wg.clone();
    let store_forward_wg = store_forward_wg.clone();

    tokio::spawn(async move {
        let sf = runtime.store_forward();

        // Seed the queue depth from what is already persisted.
        if let Some(store) = &sf.store {
            match store.retrieve_from_store(&sf.service_key).await {
                Ok(items) => {
                    sf.queue_depth.clear();
                    sf.queue_depth.inc(items.len() as i64);
                }
                Err(e) => {
                    error!(target: "fdk.storeforward", error = %e, "unable to initialize store and forward data count");
                }
            }
        }

        let interval = sf.effective_retry_interval();
        info!(
            target: "fdk.storeforward",
            interval = ?interval,
            max_retries = sf.config.max_retry_count,
            waiting = sf.queue_depth.count(),
            "starting store and forward retry loop"
        );

        let mut ticker = tokio::time::interval(interval);
        // The first tick of a tokio interval is immediate; consume it so the
        // first pass happens one full interval from now.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => sf.retry_stored_data(&runtime).await,
                Some(()) = retry_rx.recv() => sf.retry_stored_data(&runtime).await,
                () = app_cancel.cancelled() => break,
                () = store_forward_cancel.cancelled() => break,
            }
        }

        app_wg.done();
        store_forward_wg.done();
        info!(target: "fdk.storeforward", "exiting store and forward retry loop");
    });
}
