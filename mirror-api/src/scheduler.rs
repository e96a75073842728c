use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use mirror_common::config::{ConfigError, CronJobKind};
use mirror_common::schema::SchemaRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::integrity::IntegrityChecker;
use crate::refresh::{FullRefresh, TriggerStatus};

/// Accepts the five-field form as well, firing at second zero.
pub fn parse_schedule(name: &str, expression: &str) -> Result<Schedule, ConfigError> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    };

    Schedule::from_str(&normalized).map_err(|error| ConfigError::InvalidSchedule {
        name: name.to_owned(),
        schedule: expression.to_owned(),
        reason: error.to_string(),
    })
}

/// Time left until the next firing after `now`.
pub fn next_delay(schedule: &Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or_default())
}

fn job_name(kind: CronJobKind) -> &'static str {
    match kind {
        CronJobKind::Refresh => "refresh",
        CronJobKind::IntegrityCheck => "integrity-check",
    }
}

/// Spawns one task per configured job. Schedules are validated up front so a
/// bad expression fails startup.
pub fn schedule_jobs(
    registry: &SchemaRegistry,
    refresh: Arc<FullRefresh>,
    integrity: Arc<IntegrityChecker>,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, ConfigError> {
    let mut jobs = Vec::new();
    for (program, job) in registry.cron_jobs() {
        let schedule = parse_schedule(job_name(job.name), &job.schedule)?;
        jobs.push((program.to_owned(), job.name, schedule));
    }

    Ok(jobs
        .into_iter()
        .map(|(program, kind, schedule)| {
            info!(program = %program, job = job_name(kind), "scheduling job");
            tokio::spawn(run_job(
                program,
                kind,
                schedule,
                refresh.clone(),
                integrity.clone(),
                cancel.clone(),
            ))
        })
        .collect())
}

async fn run_job(
    program: String,
    kind: CronJobKind,
    schedule: Schedule,
    refresh: Arc<FullRefresh>,
    integrity: Arc<IntegrityChecker>,
    cancel: CancellationToken,
) {
    while let Some(delay) = next_delay(&schedule, Utc::now()) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let status = match kind {
            CronJobKind::Refresh => refresh.trigger(vec![program.clone()]),
            CronJobKind::IntegrityCheck => integrity.trigger(vec![program.clone()]),
        };
        match status {
            TriggerStatus::Accepted => info!(program = %program, job = job_name(kind), "scheduled job started"),
            TriggerStatus::Busy => info!(
                program = %program,
                job = job_name(kind),
                "previous run still in progress, skipping"
            ),
        }
    }
}
