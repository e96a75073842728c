//! Queue consumer: one topic of JSON account payloads, at-least-once. Offsets
//! are stored only once the write committed, so a crash replays the message.
use std::time::Duration;

use mirror_common::auth::secret_matches;
use mirror_common::event::{AccountChangeEvent, AccountPayload};
use mirror_common::health::{HealthHandle, SourceState};
use mirror_common::metrics_consts::UNAUTHORIZED_MESSAGES;
use mirror_common::retry::{ReconnectPolicy, ReconnectState};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::{ClientConfig, Message};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::error::SourceError;
use crate::router::EventRouter;

pub const SERVICE: &str = "kafka";

const AUTHORIZATION_HEADER: &str = "authorization";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum Verdict {
    Apply(AccountChangeEvent),
    Unauthorized,
    /// Unreadable payload, stored and skipped.
    Poison(String),
}

/// Checks the shared secret before looking at the payload.
pub fn verdict(secret: &str, authorization: Option<&str>, payload: Option<&[u8]>) -> Verdict {
    if !secret_matches(secret, authorization) {
        return Verdict::Unauthorized;
    }
    let Some(payload) = payload else {
        return Verdict::Poison("empty payload".to_owned());
    };

    let parsed = serde_json::from_slice::<AccountPayload>(payload)
        .map_err(|error| error.to_string())
        .and_then(|payload| AccountChangeEvent::try_from(payload).map_err(|error| error.to_string()));
    match parsed {
        Ok(event) => Verdict::Apply(event),
        Err(reason) => Verdict::Poison(reason),
    }
}

fn authorization(message: &BorrowedMessage<'_>) -> Option<String> {
    let headers = message.headers()?;
    headers
        .iter()
        .find(|header| header.key.eq_ignore_ascii_case(AUTHORIZATION_HEADER))
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(str::to_owned)
}

pub struct KafkaSource {
    consumer: StreamConsumer,
    secret: String,
    router: EventRouter,
    policy: ReconnectPolicy,
}

impl KafkaSource {
    pub fn new(
        config: &KafkaConfig,
        hosts: &str,
        secret: &str,
        router: EventRouter,
        policy: ReconnectPolicy,
    ) -> Result<Self, SourceError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.offset_reset);

        client_config.set("enable.auto.offset.store", "false");

        if config.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.topic.as_str()])?;

        Ok(Self {
            consumer,
            secret: secret.to_owned(),
            router,
            policy,
        })
    }

    /// Consumes until cancelled. A message whose write keeps failing past the
    /// retry ceiling ends the source without storing its offset.
    pub async fn run(
        mut self,
        health: HealthHandle,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let mut failures = ReconnectState::new(self.policy);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        health.report_state(SourceState::Streaming).await;
        info!("kafka consumer started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    health.report_state(SourceState::Streaming).await;
                    continue;
                }
                message = self.consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(error) => {
                    warn!("failed to receive from kafka: {}", error);
                    health.report_state(SourceState::Erroring).await;
                    if !backoff(&mut failures, &cancel).await? {
                        break;
                    }
                    continue;
                }
            };

            let authorization = authorization(&message);
            let event = match verdict(&self.secret, authorization.as_deref(), message.payload()) {
                Verdict::Apply(event) => event,
                Verdict::Unauthorized => {
                    warn!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "dropping message with a bad authorization header"
                    );
                    metrics::counter!(UNAUTHORIZED_MESSAGES, "source" => SERVICE).increment(1);
                    self.consumer.store_offset_from_message(&message)?;
                    continue;
                }
                Verdict::Poison(reason) => {
                    warn!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "dropping unreadable message: {}",
                        reason
                    );
                    self.consumer.store_offset_from_message(&message)?;
                    continue;
                }
            };

            loop {
                match self.router.apply(vec![event.clone()]).await {
                    Ok(_) => {
                        failures.reset();
                        break;
                    }
                    Err(error) => {
                        warn!(
                            program = %event.program_id,
                            address = %event.address,
                            "failed to apply queued account: {}",
                            error
                        );
                        health.report_state(SourceState::Erroring).await;
                        if !backoff(&mut failures, &cancel).await? {
                            // Left unstored, redelivered after restart.
                            return self.shutdown(&health).await;
                        }
                    }
                }
            }

            self.consumer.store_offset_from_message(&message)?;
            health.report_state(SourceState::Streaming).await;
        }

        self.shutdown(&health).await
    }

    async fn shutdown(&self, health: &HealthHandle) -> Result<(), SourceError> {
        if let Err(error) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!("failed to commit stored offsets on shutdown: {}", error);
        }
        health.report_state(SourceState::Disconnected).await;
        info!("kafka consumer stopped");
        Ok(())
    }
}

/// Sleeps out the next retry delay. `Ok(false)` when cancelled meanwhile.
async fn backoff(
    failures: &mut ReconnectState,
    cancel: &CancellationToken,
) -> Result<bool, SourceError> {
    let Some(delay) = failures.on_failure() else {
        error!(attempts = failures.failures(), "kafka retry ceiling reached");
        return Err(SourceError::ReconnectCeiling {
            source_name: SERVICE,
            attempts: failures.failures(),
        });
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(false),
        _ = tokio::time::sleep(delay) => Ok(true),
    }
}
