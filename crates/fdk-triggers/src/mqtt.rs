// SPDX-License-Identifier: MIT OR Apache-2.0
//! External-MQTT trigger.
//!
//! Connects to an MQTT broker outside the service's own message bus,
//! subscribes to the configured topics, and publishes pipeline responses
//! with the configured QoS and retain flags. Credentials come from the
//! secret provider according to the configured auth mode.

use crate::{Deferred, MessageProcessor, ResponseHandler, ServiceBinding, Trigger, infer_content_type, split_topics};
use fdk_config::{ExternalMqttConfig, parse_duration};
use fdk_core::messaging::{
    AUTH_MODE_CACERT, AUTH_MODE_CLIENT_CERT, AUTH_MODE_NONE, AUTH_MODE_USERNAME_PASSWORD,
};
use fdk_core::secrets::SecretProvider;
use fdk_core::sync::{CancellationToken, RetryWindow, WaitGroup};
use fdk_core::{CORRELATION_HEADER, MessageEnvelope};
use fdk_error::{ErrKind, FdkError, FdkResult};
use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_RETRY_DURATION_SECS: u64 = 600;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Secret key holding the username.
pub const SECRET_USERNAME_KEY: &str = "username";
/// Secret key holding the password.
pub const SECRET_PASSWORD_KEY: &str = "password";
/// Secret key holding the PEM client key.
pub const SECRET_CLIENT_KEY: &str = "clientkey";
/// Secret key holding the PEM client certificate.
pub const SECRET_CLIENT_CERT: &str = "clientcert";
/// Secret key holding the PEM CA certificate.
pub const SECRET_CA_CERT: &str = "cacert";

/// Trigger that feeds pipelines from an external MQTT broker.
pub struct MqttTrigger {
    binding: Arc<dyn ServiceBinding>,
    processor: Arc<dyn MessageProcessor>,
}

impl MqttTrigger {
    /// Create the trigger over the given binding and processor.
    #[must_use]
    pub fn new(binding: Arc<dyn ServiceBinding>, processor: Arc<dyn MessageProcessor>) -> Self {
        Self { binding, processor }
    }

    fn response_handler(
        &self,
        client: AsyncClient,
        publish_topic: String,
        qos: QoS,
        retain: bool,
    ) -> ResponseHandler {
        Arc::new(move |ctx, pipeline| {
            let Some(response_data) = ctx.response_data() else {
                return;
            };
            if publish_topic.is_empty() {
                return;
            }
            let topic = match ctx.apply_values(&publish_topic) {
                Ok(topic) => topic,
                Err(e) => {
                    error!(
                        target: "fdk.trigger.mqtt",
                        pipeline = %pipeline.id(),
                        topic = %publish_topic,
                        error = %e,
                        "unable to format publish topic"
                    );
                    return;
                }
            };
            let bytes = response_data.len();
            match client.try_publish(&topic, qos, retain, response_data) {
                Ok(()) => {
                    debug!(
                        target: "fdk.trigger.mqtt",
                        pipeline = %pipeline.id(),
                        topic = %topic,
                        bytes,
                        correlation_id = %ctx.correlation_id(),
                        "published response message"
                    );
                }
                Err(e) => {
                    error!(
                        target: "fdk.trigger.mqtt",
                        pipeline = %pipeline.id(),
                        topic = %topic,
                        error = %e,
                        "could not publish response"
                    );
                }
            }
        })
    }
}

#[async_trait::async_trait]
impl Trigger for MqttTrigger {
    async fn initialize(
        &self,
        ctx_done: CancellationToken,
        app_wg: &WaitGroup,
    ) -> FdkResult<Option<Deferred>> {
        let config = self.binding.config();
        let broker_config = config.trigger.external_mqtt.clone();
        info!(target: "fdk.trigger.mqtt", url = %broker_config.url, "initializing MQTT trigger");

        let topics = split_topics(&config.trigger.subscribe_topics);
        if topics.is_empty() {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                "missing subscribe topics for MQTT trigger; configure trigger.subscribe_topics",
            ));
        }
        let publish_topic = config.trigger.publish_topic.trim().to_string();

        let qos = parse_qos(broker_config.qos)?;
        let options = build_mqtt_options(&broker_config, self.binding.secret_provider().as_ref())?;

        let retry_duration = non_zero(broker_config.retry_duration, DEFAULT_RETRY_DURATION_SECS);
        let retry_interval = non_zero(broker_config.retry_interval, DEFAULT_RETRY_INTERVAL_SECS);
        let connect_timeout = match broker_config.connect_timeout.as_str() {
            "" => DEFAULT_CONNECT_TIMEOUT,
            value => parse_duration(value).map_err(|e| {
                FdkError::new(
                    ErrKind::ContractInvalid,
                    format!("invalid connect_timeout '{value}'"),
                )
                .with_source(e)
            })?,
        };

        info!(target: "fdk.trigger.mqtt", url = %broker_config.url, "connecting to broker for MQTT trigger");
        let window = RetryWindow::new(
            Duration::from_secs(retry_duration),
            Duration::from_secs(retry_interval),
        );
        let mut connection = None;
        let mut last_error = None;
        while window.has_not_elapsed() {
            match connect(options.clone(), connect_timeout).await {
                Ok(pair) => {
                    connection = Some(pair);
                    break;
                }
                Err(e) => {
                    warn!(
                        target: "fdk.trigger.mqtt",
                        error = %e,
                        retry_in_secs = retry_interval,
                        "failed to create MQTT client, retrying"
                    );
                    last_error = Some(e);
                }
            }
            if ctx_done.is_cancelled() {
                return Err(FdkError::new(
                    ErrKind::ServerError,
                    "aborted MQTT trigger initialization",
                ));
            }
            window.sleep_for_interval().await;
        }
        let Some((client, mut event_loop)) = connection else {
            return Err(last_error.unwrap_or_else(|| {
                FdkError::new(ErrKind::ServiceUnavailable, "MQTT connection window elapsed")
            }));
        };
        info!(target: "fdk.trigger.mqtt", "connected to broker for MQTT trigger");

        subscribe_all(&client, &topics, qos).await?;
        info!(target: "fdk.trigger.mqtt", topics = %config.trigger.subscribe_topics, "subscribed to topic(s)");

        let handler =
            self.response_handler(client.clone(), publish_topic, qos, broker_config.retain);
        let binding = Arc::clone(&self.binding);
        let processor = Arc::clone(&self.processor);
        let done = ctx_done.clone();
        let wg = app_wg.clone();
        wg.add(1);

        let resubscribe_topics = topics.clone();
        let resubscribe_client = client.clone();
        let auto_reconnect = broker_config.auto_reconnect;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let envelope = envelope_from_publish(&publish.topic, &publish.payload);
                            debug!(
                                target: "fdk.trigger.mqtt",
                                topic = %envelope.received_topic,
                                bytes = envelope.payload.len(),
                                content_type = %envelope.content_type,
                                "received message"
                            );
                            debug!(target: "fdk.trigger.mqtt", "{CORRELATION_HEADER}={}", envelope.correlation_id);

                            let ctx = binding.build_context(&envelope);
                            let processor = Arc::clone(&processor);
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                processor
                                    .message_received(Some(ctx), envelope, Some(handler))
                                    .await;
                            });
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            // Fresh session after a reconnect; re-establish
                            // the subscriptions.
                            for topic in &resubscribe_topics {
                                if let Err(e) = resubscribe_client.subscribe(topic, qos).await {
                                    error!(target: "fdk.trigger.mqtt", topic = %topic, error = %e, "resubscribe failed");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if !auto_reconnect {
                                error!(target: "fdk.trigger.mqtt", error = %e, "connection lost and auto_reconnect is disabled");
                                break;
                            }
                            warn!(target: "fdk.trigger.mqtt", error = %e, "connection error, will reconnect");
                            tokio::time::sleep(Duration::from_secs(retry_interval)).await;
                        }
                    },
                    () = done.cancelled() => break,
                }
            }
            wg.done();
            debug!(target: "fdk.trigger.mqtt", "event loop exiting");
        });

        let teardown_client = client;
        Ok(Some(Box::new(move || {
            info!(target: "fdk.trigger.mqtt", "disconnecting from broker for MQTT trigger");
            if let Err(e) = teardown_client.try_disconnect() {
                error!(target: "fdk.trigger.mqtt", error = %e, "error disconnecting MQTT client");
            }
        })))
    }
}

async fn connect(
    options: MqttOptions,
    timeout: Duration,
) -> FdkResult<(AsyncClient, rumqttc::EventLoop)> {
    let (client, mut event_loop) = AsyncClient::new(options, 64);
    // Poll until the broker acknowledges the connection or the window
    // closes; the event loop only dials on poll.
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, event_loop.poll())
            .await
            .map_err(|_| {
                FdkError::new(
                    ErrKind::ServiceUnavailable,
                    "timed out connecting to MQTT broker",
                )
            })?;
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok((client, event_loop)),
            Ok(_) => continue,
            Err(e) => {
                return Err(FdkError::new(
                    ErrKind::ServiceUnavailable,
                    "could not connect to broker for MQTT trigger",
                )
                .with_source(e));
            }
        }
    }
}

async fn subscribe_all(client: &AsyncClient, topics: &[String], qos: QoS) -> FdkResult<()> {
    for topic in topics {
        client.subscribe(topic, qos).await.map_err(|e| {
            FdkError::new(
                ErrKind::ServerError,
                format!("could not subscribe to topic '{topic}' for MQTT trigger"),
            )
            .with_source(e)
        })?;
    }
    Ok(())
}

fn envelope_from_publish(topic: &str, payload: &[u8]) -> MessageEnvelope {
    MessageEnvelope::new(
        uuid::Uuid::new_v4().to_string(),
        infer_content_type(payload),
        payload.to_vec(),
        topic,
    )
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

/// Credential material fetched from the secret provider for one auth mode.
#[derive(Debug, Default, Clone)]
pub struct SecretData {
    /// Username for `usernamepassword` mode.
    pub username: String,
    /// Password for `usernamepassword` mode.
    pub password: String,
    /// PEM client key for `clientcert` mode.
    pub key_pem_block: Vec<u8>,
    /// PEM client certificate for `clientcert` mode.
    pub cert_pem_block: Vec<u8>,
    /// PEM CA certificate, used by every TLS mode.
    pub ca_pem_block: Vec<u8>,
}

/// Fetch the secret data required by `auth_mode`, or `None` for mode
/// `none`.
///
/// # Errors
///
/// Propagates secret-provider failures and rejects unknown modes with
/// [`ErrKind::ContractInvalid`].
pub fn get_secret_data(
    auth_mode: &str,
    secret_name: &str,
    provider: &dyn SecretProvider,
) -> FdkResult<Option<SecretData>> {
    if auth_mode == AUTH_MODE_NONE {
        return Ok(None);
    }
    let secrets = provider.get_secret(secret_name, &[])?;
    let field = |key: &str| secrets.get(key).cloned().unwrap_or_default();
    Ok(Some(SecretData {
        username: field(SECRET_USERNAME_KEY),
        password: field(SECRET_PASSWORD_KEY),
        key_pem_block: field(SECRET_CLIENT_KEY).into_bytes(),
        cert_pem_block: field(SECRET_CLIENT_CERT).into_bytes(),
        ca_pem_block: field(SECRET_CA_CERT).into_bytes(),
    }))
}

/// Validate that `data` carries the fields `auth_mode` requires.
///
/// # Errors
///
/// Returns [`ErrKind::ContractInvalid`] naming the missing field.
pub fn validate_secret_data(
    auth_mode: &str,
    secret_name: &str,
    data: &SecretData,
) -> FdkResult<()> {
    let missing = |what: &str| {
        FdkError::new(
            ErrKind::ContractInvalid,
            format!("secret '{secret_name}' is missing {what} for auth mode '{auth_mode}'"),
        )
    };
    match auth_mode {
        AUTH_MODE_USERNAME_PASSWORD => {
            if data.username.is_empty() || data.password.is_empty() {
                return Err(missing("username and/or password"));
            }
        }
        AUTH_MODE_CLIENT_CERT => {
            if data.key_pem_block.is_empty() || data.cert_pem_block.is_empty() {
                return Err(missing("client key and/or client certificate"));
            }
        }
        AUTH_MODE_CACERT => {
            if data.ca_pem_block.is_empty() {
                return Err(missing("CA certificate"));
            }
        }
        AUTH_MODE_NONE => {}
        other => {
            return Err(FdkError::new(
                ErrKind::ContractInvalid,
                format!("unknown auth mode '{other}'"),
            ));
        }
    }
    Ok(())
}

fn build_mqtt_options(
    config: &ExternalMqttConfig,
    provider: &dyn SecretProvider,
) -> FdkResult<MqttOptions> {
    let (scheme, host, port) = parse_broker_url(&config.url)?;
    let client_id = if config.client_id.is_empty() {
        format!("fdk-{}", uuid::Uuid::new_v4())
    } else {
        config.client_id.clone()
    };

    let mut auth_mode = config.auth_mode.as_str();
    if auth_mode.is_empty() {
        warn!(target: "fdk.trigger.mqtt", "auth_mode is not set, defaulting to 'none'");
        auth_mode = AUTH_MODE_NONE;
    }
    let secret_data = get_secret_data(auth_mode, &config.secret_name, provider)?;
    if let Some(data) = &secret_data {
        validate_secret_data(auth_mode, &config.secret_name, data)?;
    }

    let mut options = MqttOptions::new(client_id, host, port);
    // rumqttc rejects keep-alive intervals under five seconds.
    options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive.max(5))));

    if config.will.enabled {
        options.set_last_will(LastWill::new(
            config.will.topic.clone(),
            config.will.payload.clone().into_bytes(),
            parse_qos(config.will.qos)?,
            config.will.retained,
        ));
    }

    let tls_scheme = matches!(scheme, "ssl" | "tls" | "mqtts" | "ssls");
    if let Some(data) = &secret_data {
        if auth_mode == AUTH_MODE_USERNAME_PASSWORD {
            options.set_credentials(data.username.clone(), data.password.clone());
        }
        let wants_tls = tls_scheme
            || auth_mode == AUTH_MODE_CLIENT_CERT
            || auth_mode == AUTH_MODE_CACERT;
        if wants_tls {
            if config.skip_cert_verify {
                warn!(target: "fdk.trigger.mqtt", "skip_cert_verify is not supported by the rustls transport and is ignored");
            }
            let client_auth = (auth_mode == AUTH_MODE_CLIENT_CERT)
                .then(|| (data.cert_pem_block.clone(), data.key_pem_block.clone()));
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: data.ca_pem_block.clone(),
                alpn: None,
                client_auth,
            }));
        }
    } else if tls_scheme {
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: Vec::new(),
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(options)
}

fn parse_qos(qos: u8) -> FdkResult<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(FdkError::new(
            ErrKind::ContractInvalid,
            format!("invalid QoS value '{other}'"),
        )),
    }
}

/// Split a broker URL of the form `scheme://host[:port]` into parts.
///
/// # Errors
///
/// Returns [`ErrKind::ContractInvalid`] for URLs without a host or with an
/// unparsable port.
fn parse_broker_url(url: &str) -> FdkResult<(&str, String, u16)> {
    let invalid = || {
        FdkError::new(
            ErrKind::ContractInvalid,
            format!("invalid MQTT broker url '{url}'"),
        )
    };

    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(invalid());
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => {
            let default_port = if matches!(scheme, "ssl" | "tls" | "mqtts" | "ssls") {
                8883
            } else {
                1883
            };
            (rest, default_port)
        }
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((scheme, host.to_string(), port))
}

fn non_zero(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}
