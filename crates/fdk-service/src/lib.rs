// SPDX-License-Identifier: MIT OR Apache-2.0
//! fdk-service
//!
//! Service assembly: wires a trigger, the pipeline runtime, the
//! store-and-forward engine, and the web server into one runnable
//! application service with cooperative shutdown.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Command-line surface.
pub mod cli;
/// Administrative REST surface and custom-route assembly.
pub mod webserver;

use axum::Router;
use axum::routing::MethodRouter;
use fdk_config::{ServiceConfig, load_config};
use fdk_core::messaging::LoopbackBus;
use fdk_core::metrics::MetricsManager;
use fdk_core::pipeline::TargetType;
use fdk_core::secrets::{InsecureSecretProvider, SecretProvider, Secrets};
use fdk_core::sync::{CancellationToken, WaitGroup};
use fdk_core::{ServiceHandles, Transform};
use fdk_error::{ErrKind, FdkError, FdkResult};
use fdk_runtime::{FunctionsPipelineRuntime, StoreAndForward};
use fdk_store::{SqliteStoreClient, StoreClient};
use fdk_triggers::http::HttpTrigger;
use fdk_triggers::messagebus::MessageBusTrigger;
use fdk_triggers::mqtt::MqttTrigger;
use fdk_triggers::{
    DefaultMessageProcessor, DefaultServiceBinding, Deferred, MessageProcessor, ServiceBinding,
    TRIGGER_TYPE_HTTP, TRIGGER_TYPE_MESSAGE_BUS, TRIGGER_TYPE_MQTT, Trigger, join_topic,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub use cli::CommandLine;
pub use webserver::RESERVED_ROUTES;

/// SDK version reported by the version route.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Factory signature for user-registered custom trigger types.
pub type TriggerFactory = Box<
    dyn Fn(Arc<dyn ServiceBinding>, Arc<dyn MessageProcessor>) -> Box<dyn Trigger> + Send + Sync,
>;

/// A fully-wired application service.
///
/// Construct with [`ApplicationService::new`] (programmatic configuration)
/// or [`ApplicationService::from_environment`] (flags, config file, and
/// environment overrides), register pipelines, then call
/// [`run`](Self::run).
pub struct ApplicationService {
    service_key: String,
    config: Arc<ServiceConfig>,
    runtime: Arc<FunctionsPipelineRuntime>,
    handles: Arc<ServiceHandles>,
    custom_routes: Mutex<Vec<webserver::CustomRoute>>,
    trigger_factories: Mutex<HashMap<String, TriggerFactory>>,
    deferreds: Mutex<Vec<Deferred>>,
    app_cancel: CancellationToken,
    store_forward_cancel: CancellationToken,
    app_wg: WaitGroup,
    store_forward_wg: WaitGroup,
}

impl ApplicationService {
    /// Assemble a service from an already-loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails when the store-and-forward database cannot be opened or the
    /// configured database type is unsupported.
    pub fn new(
        service_key: impl Into<String>,
        target_type: TargetType,
        config: ServiceConfig,
    ) -> FdkResult<Self> {
        let service_key = service_key.into();
        let config = Arc::new(config);

        let secret_provider: Arc<dyn SecretProvider> =
            Arc::new(seeded_secret_provider(&config));
        let metrics = Arc::new(MetricsManager::new());

        let mut handles = ServiceHandles::new(Arc::clone(&secret_provider), metrics);
        if !config.message_bus.disabled {
            handles = handles.with_messaging(Arc::new(LoopbackBus::new()));
        }
        if !config.trigger.publish_topic.trim().is_empty() {
            handles = handles.with_publish_topic(join_topic(
                config.message_bus.base_topic_prefix(),
                config.trigger.publish_topic.trim(),
            ));
        }
        let handles = Arc::new(handles);

        let store_client = store_client_for(&config)?;
        let store_forward = StoreAndForward::new(
            service_key.clone(),
            config.writable.store_and_forward.clone(),
            store_client,
            &handles,
        );
        let runtime = Arc::new(FunctionsPipelineRuntime::new(
            service_key.clone(),
            target_type,
            Arc::clone(&handles),
            store_forward,
        ));

        Ok(Self {
            service_key,
            config,
            runtime,
            handles,
            custom_routes: Mutex::new(Vec::new()),
            trigger_factories: Mutex::new(HashMap::new()),
            deferreds: Mutex::new(Vec::new()),
            app_cancel: CancellationToken::new(),
            store_forward_cancel: CancellationToken::new(),
            app_wg: WaitGroup::new(),
            store_forward_wg: WaitGroup::new(),
        })
    }

    /// Assemble a service from command-line flags, the configuration file,
    /// and environment overrides, initializing the global tracing
    /// subscriber from the configured log level.
    ///
    /// # Errors
    ///
    /// Fails when the configuration cannot be loaded or the service cannot
    /// be assembled.
    pub fn from_environment(
        default_service_key: &str,
        target_type: TargetType,
        command_line: &CommandLine,
    ) -> FdkResult<Self> {
        let config_path = command_line.config_path();
        let config = load_config(Some(&config_path)).map_err(|e| {
            FdkError::new(
                ErrKind::ContractInvalid,
                format!("failed to load configuration from '{}'", config_path.display()),
            )
            .with_source(e)
        })?;

        init_tracing(&config.writable.log_level);

        let service_key = command_line
            .service_key
            .clone()
            .unwrap_or_else(|| default_service_key.to_string());

        info!(
            target: "fdk.service",
            service = %service_key,
            config = %config_path.display(),
            "configuration loaded"
        );
        if command_line.use_registry {
            info!(target: "fdk.service", "registry requested; registration is delegated to the external registry client");
        }
        if command_line.dev_mode {
            info!(target: "fdk.service", "developer mode enabled");
        }
        if let Some([local, remote, bind]) = command_line.remote_hosts() {
            info!(target: "fdk.service", %local, %remote, %bind, "remote service hosts configured");
        }

        Self::new(service_key, target_type, config)
    }

    // -- accessors ------------------------------------------------------

    /// The service's key.
    #[must_use]
    pub fn service_key(&self) -> &str {
        &self.service_key
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The pipeline runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<FunctionsPipelineRuntime> {
        &self.runtime
    }

    /// The service's secret provider.
    #[must_use]
    pub fn secret_provider(&self) -> Arc<dyn SecretProvider> {
        Arc::clone(self.handles.secret_provider())
    }

    /// Cancellation token observed by every service worker; cancelled when
    /// the service begins shutting down.
    #[must_use]
    pub fn app_done(&self) -> CancellationToken {
        self.app_cancel.clone()
    }

    /// All free-form application settings.
    #[must_use]
    pub fn application_settings(&self) -> &HashMap<String, String> {
        &self.config.application_settings
    }

    /// One application setting by key.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::EntityDoesNotExist`] for unknown keys.
    pub fn get_application_setting(&self, key: &str) -> FdkResult<String> {
        self.config
            .application_settings
            .get(key)
            .cloned()
            .ok_or_else(|| {
                FdkError::new(
                    ErrKind::EntityDoesNotExist,
                    format!("application setting '{key}' not found"),
                )
            })
    }

    /// An application setting interpreted as a comma-separated list.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::EntityDoesNotExist`] for unknown keys.
    pub fn get_application_setting_strings(&self, key: &str) -> FdkResult<Vec<String>> {
        Ok(fdk_triggers::split_topics(
            &self.get_application_setting(key)?,
        ))
    }

    /// Load and deserialize a custom configuration section into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::ContractInvalid`] when the section is absent or
    /// does not match `T`'s shape.
    pub fn load_custom_config<T: serde::de::DeserializeOwned>(
        &self,
        section_name: &str,
    ) -> FdkResult<T> {
        self.config.custom_section_as(section_name).map_err(|e| {
            FdkError::new(
                ErrKind::ContractInvalid,
                format!("failed to load custom configuration section '{section_name}'"),
            )
            .with_source(e)
        })
    }

    // -- pipelines ------------------------------------------------------

    /// Set the default pipeline's transforms.
    pub fn set_default_functions_pipeline(&self, transforms: Vec<Transform>) {
        self.runtime.set_default_functions_pipeline(transforms);
    }

    /// Register a pipeline for the given topic patterns.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::StatusConflict`] when the id already exists.
    pub fn add_functions_pipeline_for_topics(
        &self,
        pipeline_id: &str,
        topics: Vec<String>,
        transforms: Vec<Transform>,
    ) -> FdkResult<()> {
        self.runtime
            .add_function_pipeline(pipeline_id, topics, transforms)
            .map(|_| ())
    }

    /// Remove every registered pipeline.
    pub fn remove_all_function_pipelines(&self) {
        self.runtime.remove_all_function_pipelines();
    }

    // -- extension points -----------------------------------------------

    /// Register a custom route on the service's web server.
    ///
    /// # Errors
    ///
    /// Returns [`ErrKind::NotAllowed`] for routes the SDK reserves.
    pub fn add_custom_route(&self, path: &str, handler: MethodRouter) -> FdkResult<()> {
        if RESERVED_ROUTES.contains(&path) {
            return Err(FdkError::new(
                ErrKind::NotAllowed,
                format!("route '{path}' is reserved by the SDK"),
            ));
        }
        self.custom_routes
            .lock()
            .expect("custom routes poisoned")
            .push(webserver::CustomRoute {
                path: path.to_string(),
                handler,
            });
        Ok(())
    }

    /// Register a factory for a custom trigger type, selectable through
    /// `trigger.type` in configuration.
    pub fn register_custom_trigger_factory(&self, name: &str, factory: TriggerFactory) {
        self.trigger_factories
            .lock()
            .expect("trigger factories poisoned")
            .insert(name.to_lowercase(), factory);
    }

    // -- run ------------------------------------------------------------

    /// Run the service until a shutdown signal arrives.
    ///
    /// Brings up the selected trigger, the store-and-forward retry loop
    /// (when enabled), and the web server; then waits for SIGINT/SIGTERM
    /// and performs the shutdown cascade.
    ///
    /// # Errors
    ///
    /// Initialization failures of the trigger or web server are returned;
    /// after bring-up the method only returns once the service stops.
    pub async fn run(&self) -> FdkResult<()> {
        let binding: Arc<dyn ServiceBinding> = Arc::new(DefaultServiceBinding::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.config),
        ));
        let processor: Arc<dyn MessageProcessor> = Arc::new(DefaultMessageProcessor::new(
            Arc::clone(&binding),
            self.handles.metrics(),
        ));

        let (trigger, trigger_router) = self.setup_trigger(&binding, &processor)?;

        info!(
            target: "fdk.service",
            service = %self.service_key,
            trigger = %self.config.trigger.trigger_type,
            "initializing trigger"
        );
        if let Some(teardown) = trigger
            .initialize(self.app_cancel.clone(), &self.app_wg)
            .await?
        {
            self.deferreds
                .lock()
                .expect("deferreds poisoned")
                .push(teardown);
        }

        if self.config.writable.store_and_forward.enabled {
            self.runtime.start_store_and_forward(
                &self.app_wg,
                self.app_cancel.clone(),
                &self.store_forward_wg,
                self.store_forward_cancel.clone(),
            );
        }

        self.serve_web_server(trigger_router).await?;

        info!(target: "fdk.service", service = %self.service_key, "service started");
        wait_for_shutdown_signal(&self.app_cancel).await;
        self.shutdown().await;
        Ok(())
    }

    fn setup_trigger(
        &self,
        binding: &Arc<dyn ServiceBinding>,
        processor: &Arc<dyn MessageProcessor>,
    ) -> FdkResult<(Box<dyn Trigger>, Option<Router>)> {
        let trigger_type = self.config.trigger.trigger_type.to_lowercase();
        match trigger_type.as_str() {
            TRIGGER_TYPE_MESSAGE_BUS => Ok((
                Box::new(MessageBusTrigger::new(
                    Arc::clone(binding),
                    Arc::clone(processor),
                )),
                None,
            )),
            TRIGGER_TYPE_MQTT => Ok((
                Box::new(MqttTrigger::new(
                    Arc::clone(binding),
                    Arc::clone(processor),
                )),
                None,
            )),
            TRIGGER_TYPE_HTTP => {
                let trigger = HttpTrigger::new(Arc::clone(binding));
                let router = trigger.router();
                Ok((Box::new(trigger), Some(router)))
            }
            other => {
                let factories = self
                    .trigger_factories
                    .lock()
                    .expect("trigger factories poisoned");
                let factory = factories.get(other).ok_or_else(|| {
                    FdkError::new(
                        ErrKind::ContractInvalid,
                        format!("invalid trigger type '{other}'"),
                    )
                })?;
                Ok((factory(Arc::clone(binding), Arc::clone(processor)), None))
            }
        }
    }

    /// Build the full service router: admin + trigger + custom routes.
    fn build_router(&self, trigger_router: Option<Router>) -> Router {
        let state = Arc::new(webserver::WebState {
            service_key: self.service_key.clone(),
            sdk_version: SDK_VERSION.to_string(),
            config: Arc::clone(&self.config),
            secret_provider: Arc::clone(self.handles.secret_provider()),
        });
        let mut router = webserver::admin_router(state);
        if let Some(trigger_router) = trigger_router {
            router = router.merge(trigger_router);
        }
        for route in self
            .custom_routes
            .lock()
            .expect("custom routes poisoned")
            .drain(..)
        {
            router = router.route(&route.path, route.handler);
        }
        router
    }

    async fn serve_web_server(&self, trigger_router: Option<Router>) -> FdkResult<()> {
        let router = self.build_router(trigger_router);
        let address = format!("{}:{}", self.config.service.host, self.config.service.port);
        let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
            FdkError::new(
                ErrKind::ServiceUnavailable,
                format!("failed to bind web server to {address}"),
            )
            .with_source(e)
        })?;
        info!(target: "fdk.service", address = %address, "web server listening");

        let cancel = self.app_cancel.clone();
        let wg = self.app_wg.clone();
        wg.add(1);
        tokio::spawn(async move {
            let shutdown = {
                let cancel = cancel.clone();
                async move { cancel.cancelled().await }
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(target: "fdk.service", error = %e, "web server exited with error");
            }
            wg.done();
        });
        Ok(())
    }

    /// Perform the shutdown cascade.
    ///
    /// Store-and-forward stops first so no new retry work is scheduled,
    /// then the remaining workers, then the deferred teardowns in LIFO
    /// order.
    pub async fn shutdown(&self) {
        info!(target: "fdk.service", service = %self.service_key, "shutting down");

        self.store_forward_cancel.cancel();
        self.store_forward_wg.wait().await;

        self.app_cancel.cancel();
        self.app_wg.wait().await;

        let mut deferreds = self.deferreds.lock().expect("deferreds poisoned");
        while let Some(teardown) = deferreds.pop() {
            teardown();
        }
        info!(target: "fdk.service", service = %self.service_key, "shutdown complete");
    }
}

fn seeded_secret_provider(config: &ServiceConfig) -> InsecureSecretProvider {
    let mut entries: HashMap<String, Secrets> = HashMap::new();
    for block in config.writable.insecure_secrets.values() {
        if block.secret_name.is_empty() {
            warn!(target: "fdk.service", "skipping insecure secrets block with empty secret_name");
            continue;
        }
        entries.insert(block.secret_name.clone(), block.secret_data.clone());
    }
    InsecureSecretProvider::seeded(entries)
}

fn store_client_for(config: &ServiceConfig) -> FdkResult<Option<Arc<dyn StoreClient>>> {
    if !config.writable.store_and_forward.enabled {
        return Ok(None);
    }
    if !config.database.db_type.eq_ignore_ascii_case("sqlite") {
        return Err(FdkError::new(
            ErrKind::NotImplemented,
            format!("unsupported database type '{}'", config.database.db_type),
        ));
    }
    let client = SqliteStoreClient::open(&config.database.path)?;
    Ok(Some(Arc::new(client)))
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    // A second service in one process keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

async fn wait_for_shutdown_signal(app_cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(target: "fdk.service", error = %e, "failed to install SIGTERM handler");
                app_cancel.cancelled().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!(target: "fdk.service", "received interrupt"),
            _ = sigterm.recv() => info!(target: "fdk.service", "received terminate"),
            () = app_cancel.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!(target: "fdk.service", "received interrupt"),
            () = app_cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdk_core::pipeline::FunctionResult;
    use axum::routing::get;

    fn service() -> ApplicationService {
        ApplicationService::new(
            "unit-test-service",
            TargetType::Raw,
            ServiceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn custom_route_rejects_reserved_paths() {
        let svc = service();
        for reserved in RESERVED_ROUTES {
            let err = svc
                .add_custom_route(reserved, get(|| async { "nope" }))
                .unwrap_err();
            assert_eq!(err.kind(), ErrKind::NotAllowed, "route {reserved}");
        }
        svc.add_custom_route("/api/v3/my-data", get(|| async { "ok" }))
            .unwrap();
    }

    #[test]
    fn unknown_trigger_type_is_rejected() {
        let mut config = ServiceConfig::default();
        config.trigger.trigger_type = "carrier-pigeon".into();
        let svc =
            ApplicationService::new("svc", TargetType::Raw, config).unwrap();
        let binding: Arc<dyn ServiceBinding> = Arc::new(DefaultServiceBinding::new(
            Arc::clone(svc.runtime()),
            Arc::new(svc.config().clone()),
        ));
        let processor: Arc<dyn MessageProcessor> = Arc::new(DefaultMessageProcessor::new(
            Arc::clone(&binding),
            svc.handles.metrics(),
        ));
        let err = match svc.setup_trigger(&binding, &processor) {
            Err(e) => e,
            Ok(_) => panic!("expected setup_trigger to fail"),
        };
        assert_eq!(err.kind(), ErrKind::ContractInvalid);
    }

    #[test]
    fn custom_trigger_factory_is_selected_case_insensitively() {
        struct NoopTrigger;
        #[async_trait::async_trait]
        impl Trigger for NoopTrigger {
            async fn initialize(
                &self,
                _ctx_done: CancellationToken,
                _app_wg: &WaitGroup,
            ) -> FdkResult<Option<Deferred>> {
                Ok(None)
            }
        }

        let mut config = ServiceConfig::default();
        config.trigger.trigger_type = "My-Custom".into();
        let svc = ApplicationService::new("svc", TargetType::Raw, config).unwrap();
        svc.register_custom_trigger_factory(
            "my-custom",
            Box::new(|_binding, _processor| Box::new(NoopTrigger) as Box<dyn Trigger>),
        );

        let binding: Arc<dyn ServiceBinding> = Arc::new(DefaultServiceBinding::new(
            Arc::clone(svc.runtime()),
            Arc::new(svc.config().clone()),
        ));
        let processor: Arc<dyn MessageProcessor> = Arc::new(DefaultMessageProcessor::new(
            Arc::clone(&binding),
            svc.handles.metrics(),
        ));
        svc.setup_trigger(&binding, &processor).unwrap();
    }

    #[test]
    fn application_settings_accessors() {
        let mut config = ServiceConfig::default();
        config
            .application_settings
            .insert("DeviceNames".into(), "d1, d2 ,d3".into());
        let svc = ApplicationService::new("svc", TargetType::Raw, config).unwrap();

        assert_eq!(
            svc.get_application_setting("DeviceNames").unwrap(),
            "d1, d2 ,d3"
        );
        assert_eq!(
            svc.get_application_setting_strings("DeviceNames").unwrap(),
            vec!["d1", "d2", "d3"]
        );
        assert_eq!(
            svc.get_application_setting("missing").unwrap_err().kind(),
            ErrKind::EntityDoesNotExist
        );
    }

    #[test]
    fn custom_config_sections_deserialize() {
        #[derive(Debug, serde::Deserialize)]
        struct SinkConfig {
            endpoint: String,
        }

        let config = fdk_config::parse_toml(
            "[sink]\nendpoint = \"https://sink.example.com\"\n",
        )
        .unwrap();
        let svc = ApplicationService::new("svc", TargetType::Raw, config).unwrap();

        let sink: SinkConfig = svc.load_custom_config("sink").unwrap();
        assert_eq!(sink.endpoint, "https://sink.example.com");

        let err = svc.load_custom_config::<SinkConfig>("missing").unwrap_err();
        assert_eq!(err.kind(), ErrKind::ContractInvalid);
    }

    #[test]
    fn insecure_secrets_are_seeded_from_config() {
        let mut config = ServiceConfig::default();
        config.writable.insecure_secrets.insert(
            "block1".into(),
            fdk_config::InsecureSecretsBlock {
                secret_name: "db-creds".into(),
                secret_data: HashMap::from([("password".into(), "pw".into())]),
            },
        );
        let svc = ApplicationService::new("svc", TargetType::Raw, config).unwrap();
        let secret = svc.secret_provider().get_secret("db-creds", &[]).unwrap();
        assert_eq!(secret["password"], "pw");
    }

    #[test]
    fn pipelines_register_through_the_service() {
        let svc = service();
        svc.add_functions_pipeline_for_topics(
            "export",
            vec!["events/#".into()],
            vec![Transform::new("noop", |_ctx, _data| {
                FunctionResult::Continue(None)
            })],
        )
        .unwrap();
        let err = svc
            .add_functions_pipeline_for_topics("export", vec!["#".into()], vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrKind::StatusConflict);
        svc.remove_all_function_pipelines();
    }

    #[tokio::test]
    async fn shutdown_cascade_completes_with_no_workers() {
        let svc = service();
        tokio::time::timeout(std::time::Duration::from_secs(1), svc.shutdown())
            .await
            .expect("shutdown hung");
    }

    #[test]
    fn store_forward_without_sqlite_is_rejected() {
        let mut config = ServiceConfig::default();
        config.writable.store_and_forward.enabled = true;
        config.database.db_type = "postgres".into();
        let err = match ApplicationService::new("svc", TargetType::Raw, config) {
            Err(e) => e,
            Ok(_) => panic!("expected ApplicationService::new to fail"),
        };
        assert_eq!(err.kind(), ErrKind::NotImplemented);
    }

    #[tokio::test]
    async fn sqlite_store_is_opened_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::default();
        config.writable.store_and_forward.enabled = true;
        config.database.path = dir
            .path()
            .join("sf.db")
            .to_string_lossy()
            .to_string();
        let svc = ApplicationService::new("svc", TargetType::Raw, config).unwrap();
        assert!(svc.runtime().store_forward().enabled());
    }
}
