//! Liveness of the ingestion sources and background loops.
//!
//! Each source registers a component and reports its state machine transitions.
//! The process is live when every component is either streaming or working its
//! way back to a stream, and none missed its reporting deadline. A source that
//! gave up (`Failed`) or that stopped reporting fails the check.
use std::collections::HashMap;
use std::fmt;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Where a source is in its connect / stream / reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    Disconnected,
    Connecting,
    Streaming,
    Stale,
    Erroring,
    Reconnecting,
    /// Reached the reconnect ceiling, the source will not try again.
    Failed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Connecting => "connecting",
            SourceState::Streaming => "streaming",
            SourceState::Stale => "stale",
            SourceState::Erroring => "erroring",
            SourceState::Reconnecting => "reconnecting",
            SourceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    Starting,
    /// Working as expected until the deadline, must report again before it.
    HealthyUntil {
        state: SourceState,
        until: OffsetDateTime,
    },
    Unhealthy(SourceState),
    /// Missed its deadline.
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self.components)).into_response()
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Reports a state machine transition. Every state but `Failed` counts as
    /// alive for another deadline.
    pub async fn report_state(&self, state: SourceState) {
        let status = match state {
            SourceState::Failed => ComponentStatus::Unhealthy(state),
            state => ComponentStatus::HealthyUntil {
                state,
                until: OffsetDateTime::now_utc().add(self.deadline),
            },
        };
        self.report_status(status).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(error) = self.sender.send(message).await {
            warn!(component = %self.component, "failed to report health status: {}", error)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<HealthMessage>(64);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let writer = components.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match writer.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    Err(_) => warn!("poisoned health registry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = OffsetDateTime::now_utc();

        // No component registered yet means nothing is running.
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let component = match component {
                ComponentStatus::HealthyUntil { until, .. } if *until > now => component.clone(),
                ComponentStatus::HealthyUntil { .. } => {
                    status.healthy = false;
                    ComponentStatus::Stalled
                }
                other => {
                    status.healthy = false;
                    other.clone()
                }
            };
            status.components.insert(name.clone(), component);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Sub;

    use super::*;

    async fn eventually<F: Fn() -> bool>(check: F) {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
        assert_eq!(
            registry.get_status().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn follows_source_states() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("geyser", Duration::seconds(30)).await;
        eventually(|| registry.get_status().components.len() == 1).await;
        assert!(!registry.get_status().healthy);

        handle.report_state(SourceState::Streaming).await;
        eventually(|| registry.get_status().healthy).await;

        // Reconnecting still counts as alive.
        handle.report_state(SourceState::Reconnecting).await;
        eventually(|| {
            matches!(
                registry.get_status().components.get("geyser"),
                Some(ComponentStatus::HealthyUntil {
                    state: SourceState::Reconnecting,
                    ..
                })
            )
        })
        .await;
        assert!(registry.get_status().healthy);

        handle.report_state(SourceState::Failed).await;
        eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("kafka", Duration::seconds(30)).await;
        handle
            .report_status(ComponentStatus::HealthyUntil {
                state: SourceState::Streaming,
                until: OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            })
            .await;

        eventually(|| {
            registry.get_status().components.get("kafka") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_failed_component_fails_the_check() {
        let registry = HealthRegistry::new("liveness");
        let first = registry.register("one", Duration::seconds(30)).await;
        let second = registry.register("two", Duration::seconds(30)).await;
        first.report_state(SourceState::Streaming).await;
        second.report_state(SourceState::Streaming).await;
        eventually(|| registry.get_status().healthy).await;

        second.report_state(SourceState::Failed).await;
        eventually(|| !registry.get_status().healthy).await;
        assert_eq!(registry.get_status().into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
