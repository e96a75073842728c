//! # IngestionSource
//!
//! Connection lifecycle shared by the streaming sources: resume from the
//! cursor (or the chain head), stream until the connection ends, back off and
//! reconnect, give up at the ceiling.
//!
//! ```text
//! Disconnected → Connecting → Streaming → (Stale | Erroring) → Reconnecting → Connecting …
//! ```
use std::time::Duration;

use async_trait::async_trait;
use mirror_common::cursor::CursorStore;
use mirror_common::health::{HealthHandle, SourceState};
use mirror_common::metrics_consts::SOURCE_RECONNECTS;
use mirror_common::retry::{ReconnectPolicy, ReconnectState};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::SourceError;

#[async_trait]
pub trait StreamingSource: Send {
    fn name(&self) -> &'static str;

    /// Runs one connection until the server ends it, it fails, it goes stale
    /// or the session is cancelled.
    async fn run_session(&mut self, session: &mut Session<'_>) -> Result<(), SourceError>;
}

/// One connection's view of the cursor, the cancellation signal and health.
pub struct Session<'a> {
    resume: Option<String>,
    cursor: &'a mut CursorStore,
    cancel: &'a CancellationToken,
    health: &'a HealthHandle,
    stale_check: Interval,
    delivered: bool,
}

impl<'a> Session<'a> {
    fn new(
        resume: Option<String>,
        cursor: &'a mut CursorStore,
        cancel: &'a CancellationToken,
        health: &'a HealthHandle,
        stale_check_interval: Duration,
    ) -> Self {
        let mut stale_check = interval_at(
            Instant::now() + stale_check_interval,
            stale_check_interval,
        );
        stale_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            resume,
            cursor,
            cancel,
            health,
            stale_check,
            delivered: false,
        }
    }

    /// The position to continue from, `None` to start at the chain head.
    pub fn resume(&self) -> Option<&str> {
        self.resume.as_deref()
    }

    /// Call once the stream is open.
    pub async fn connected(&mut self) {
        self.cursor.mark_connected();
        self.health.report_state(SourceState::Streaming).await;
    }

    /// Records a durably applied batch.
    pub async fn commit(&mut self, token: String, block_height: Option<u64>) -> Result<(), SourceError> {
        self.delivered = true;
        self.cursor.update(token, block_height, false).await?;
        Ok(())
    }

    /// Moves the cursor back, written out immediately.
    pub async fn rewind(&mut self, token: String, block_height: Option<u64>) -> Result<(), SourceError> {
        self.cursor.update(token, block_height, true).await?;
        Ok(())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves on every stale check tick with an error once the stream has
    /// been silent too long. Keeps the health deadline fresh otherwise.
    pub async fn check_stale(&mut self) -> Result<(), SourceError> {
        self.stale_check.tick().await;
        if self.cursor.is_stale() {
            return Err(SourceError::Stale);
        }
        self.health.report_state(SourceState::Streaming).await;
        Ok(())
    }
}

pub struct SourceRunner {
    pub policy: ReconnectPolicy,
    pub stale_check_interval: Duration,
}

impl SourceRunner {
    /// Drives a source until cancelled or until it reaches the reconnect
    /// ceiling. The pending cursor is flushed either way.
    pub async fn run<S: StreamingSource>(
        &self,
        mut source: S,
        mut cursor: CursorStore,
        health: HealthHandle,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let name = source.name();
        let mut reconnect = ReconnectState::new(self.policy);

        while !cancel.is_cancelled() {
            health.report_state(SourceState::Connecting).await;

            let result = match cursor.check_staleness().await {
                Ok(resume) => {
                    if resume.is_none() {
                        info!(source = name, "no usable cursor, starting at chain head");
                    }
                    let mut session = Session::new(
                        resume,
                        &mut cursor,
                        &cancel,
                        &health,
                        self.stale_check_interval,
                    );
                    let result = source.run_session(&mut session).await;
                    if session.delivered {
                        reconnect.reset();
                    }
                    result
                }
                Err(error) => Err(error.into()),
            };

            if cancel.is_cancelled() {
                if let Err(error) = result {
                    warn!(source = name, "session ended during shutdown: {}", error);
                }
                break;
            }

            match result {
                Ok(()) => {
                    info!(source = name, "stream closed by server");
                    health.report_state(SourceState::Disconnected).await;
                }
                Err(SourceError::Stale) => {
                    health.report_state(SourceState::Stale).await;
                }
                Err(SourceError::InvalidPackage(reason)) => {
                    health.report_state(SourceState::Failed).await;
                    return Err(SourceError::InvalidPackage(reason));
                }
                Err(error) => {
                    warn!(source = name, "stream failed: {}", error);
                    health.report_state(SourceState::Erroring).await;
                }
            }

            metrics::counter!(SOURCE_RECONNECTS, "source" => name).increment(1);
            let Some(delay) = reconnect.on_failure() else {
                error!(
                    source = name,
                    attempts = reconnect.failures(),
                    "reconnect ceiling reached"
                );
                health.report_state(SourceState::Failed).await;
                if let Err(error) = cursor.flush().await {
                    warn!(source = name, "failed to flush cursor: {}", error);
                }
                return Err(SourceError::ReconnectCeiling {
                    source_name: name,
                    attempts: reconnect.failures(),
                });
            };

            health.report_state(SourceState::Reconnecting).await;
            info!(source = name, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        cursor.flush().await?;
        health.report_state(SourceState::Disconnected).await;
        info!(source = name, "source stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use mirror_common::cursor::{CursorRepository, MemoryCursorRepository};
    use mirror_common::health::HealthRegistry;

    use super::*;

    enum Script {
        Fail,
        DeliverThenFail(&'static str),
        /// Waits on the stale check until it trips.
        Silent,
        WaitForCancel,
    }

    struct FakeSource {
        script: VecDeque<Script>,
        started: Arc<Mutex<Vec<Instant>>>,
        resumes: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl StreamingSource for FakeSource {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn run_session(&mut self, session: &mut Session<'_>) -> Result<(), SourceError> {
            self.started.lock().unwrap().push(Instant::now());
            self.resumes
                .lock()
                .unwrap()
                .push(session.resume().map(str::to_owned));

            match self.script.pop_front().unwrap_or(Script::Fail) {
                Script::Fail => Err(SourceError::Fatal("connection reset".to_owned())),
                Script::DeliverThenFail(token) => {
                    session.connected().await;
                    session.commit(token.to_owned(), Some(1)).await?;
                    Err(SourceError::Fatal("connection reset".to_owned()))
                }
                Script::Silent => {
                    session.connected().await;
                    loop {
                        session.check_stale().await?;
                    }
                }
                Script::WaitForCancel => {
                    session.connected().await;
                    session.cancel_token().cancelled().await;
                    Ok(())
                }
            }
        }
    }

    struct Harness {
        started: Arc<Mutex<Vec<Instant>>>,
        resumes: Arc<Mutex<Vec<Option<String>>>>,
        repository: Arc<MemoryCursorRepository>,
    }

    async fn run(
        script: Vec<Script>,
        max_attempts: u32,
        cancel: CancellationToken,
    ) -> (Result<(), SourceError>, Harness) {
        let harness = Harness {
            started: Default::default(),
            resumes: Default::default(),
            repository: Arc::new(MemoryCursorRepository::new()),
        };
        let source = FakeSource {
            script: script.into(),
            started: harness.started.clone(),
            resumes: harness.resumes.clone(),
        };
        let cursor = CursorStore::new("fake", harness.repository.clone(), Duration::from_secs(300));
        let health = HealthRegistry::new("liveness")
            .register("fake", time::Duration::seconds(60))
            .await;
        let runner = SourceRunner {
            policy: ReconnectPolicy::new(
                2,
                Duration::from_millis(1000),
                Duration::from_secs(60),
                max_attempts,
            ),
            stale_check_interval: Duration::from_secs(30),
        };

        let result = runner.run(source, cursor, health, cancel).await;
        (result, harness)
    }

    fn gaps(started: &[Instant]) -> Vec<Duration> {
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_then_gives_up_at_the_ceiling() {
        let (result, harness) = run(vec![], 5, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(SourceError::ReconnectCeiling { attempts: 5, .. })
        ));
        let started = harness.started.lock().unwrap();
        assert_eq!(started.len(), 5);
        assert_eq!(
            gaps(&started),
            vec![
                Duration::ZERO,
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivering_resets_the_failure_count() {
        let script = vec![
            Script::Fail,
            Script::Fail,
            Script::DeliverThenFail("c1"),
            Script::Fail,
        ];
        let (result, harness) = run(script, 3, CancellationToken::new()).await;

        assert!(result.is_err());
        // Two failures, a delivering session, then two more before hitting 3.
        let started = harness.started.lock().unwrap();
        assert_eq!(started.len(), 5);
        assert_eq!(
            gaps(&started),
            vec![
                Duration::ZERO,
                Duration::from_millis(1000),
                Duration::ZERO,
                Duration::from_millis(1000),
            ]
        );

        // The delivered token was flushed on the way out and resumed from.
        let resumes = harness.resumes.lock().unwrap();
        assert_eq!(resumes[3], Some("c1".to_owned()));
        drop(resumes);
        let stored = harness.repository.latest("fake").await.unwrap().unwrap();
        assert_eq!(stored.token, "c1");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_goes_stale_and_restarts_at_head() {
        let script = vec![Script::DeliverThenFail("c1"), Script::Silent, Script::Fail];
        let (result, harness) = run(script, 3, CancellationToken::new()).await;

        assert!(result.is_err());
        let resumes = harness.resumes.lock().unwrap();
        assert_eq!(resumes[1], Some("c1".to_owned()));
        // After 300s of silence the cursor is no longer trusted.
        assert_eq!(resumes[2], None);

        let started = harness.started.lock().unwrap();
        assert!(started[2] - started[1] >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_cleanly() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let (result, harness) = run(vec![Script::WaitForCancel], 5, cancel).await;
        assert!(result.is_ok());
        assert_eq!(harness.started.lock().unwrap().len(), 1);
    }
}
