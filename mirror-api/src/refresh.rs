//! Full resync of a program from a `getProgramAccounts` listing, followed by
//! garbage collection of every row the sweep did not touch.
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mirror_common::metrics_consts::{
    DECODE_MISSES, REFRESH_ACCOUNTS, REFRESH_DURATION, ROWS_GARBAGE_COLLECTED,
};
use mirror_common::pipeline::{AccountProcessor, SharedRegistry, WriteOrigin};
use mirror_common::rpc::ChainClient;
use mirror_common::single_flight::{FlightPermit, SingleFlight};
use mirror_common::upsert::garbage_collect;
use serde_derive::Serialize;
use sqlx::PgPool;
use tracing::{error, info};

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Accepted,
    Busy,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub accounts: usize,
    pub written: usize,
    pub decode_misses: usize,
    pub garbage_collected: u64,
}

pub struct FullRefresh {
    processor: AccountProcessor,
    chain: ChainClient,
    chunk_size: usize,
    flight: SingleFlight,
}

impl FullRefresh {
    pub fn new(pool: PgPool, registry: SharedRegistry, chain: ChainClient, chunk_size: usize) -> Self {
        Self {
            processor: AccountProcessor::new(pool, registry, WriteOrigin::Refresh),
            chain,
            chunk_size: chunk_size.max(1),
            flight: SingleFlight::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Claims the single-flight slot, `None` while a sweep is running.
    pub fn try_start(&self) -> Option<FlightPermit> {
        self.flight.try_acquire()
    }

    /// Starts a background sweep over `programs` unless one is running.
    pub fn trigger(self: &Arc<Self>, programs: Vec<String>) -> TriggerStatus {
        let Some(permit) = self.try_start() else {
            return TriggerStatus::Busy;
        };

        let refresh = self.clone();
        tokio::spawn(async move {
            refresh.run(&programs).await;
            drop(permit);
        });
        TriggerStatus::Accepted
    }

    /// Refreshes each program in turn. A failing program does not stop the
    /// ones after it.
    pub async fn run(&self, programs: &[String]) {
        for program in programs {
            let start = Instant::now();
            match self.refresh_program(program).await {
                Ok(summary) => info!(
                    program = %program,
                    accounts = summary.accounts,
                    written = summary.written,
                    decode_misses = summary.decode_misses,
                    garbage_collected = summary.garbage_collected,
                    "refresh finished"
                ),
                Err(error) => error!(program = %program, "refresh failed: {}", error),
            }
            metrics::histogram!(REFRESH_DURATION, "program" => program.clone())
                .record(start.elapsed().as_secs_f64());
        }
    }

    pub async fn refresh_program(&self, program_id: &str) -> Result<RefreshSummary, JobError> {
        let pool = self.processor.pool();
        // Database clock, the same one that stamps refreshed_at.
        let sweep_start: DateTime<Utc> = sqlx::query_scalar("SELECT now()").fetch_one(pool).await?;

        let accounts = self.chain.get_program_accounts(program_id).await?;
        metrics::counter!(REFRESH_ACCOUNTS, "program" => program_id.to_owned())
            .increment(accounts.len() as u64);
        info!(program = program_id, accounts = accounts.len(), "refreshing program");

        let registry = self.processor.registry().current();
        let mut summary = RefreshSummary {
            accounts: accounts.len(),
            ..Default::default()
        };

        for chunk in accounts.chunks(self.chunk_size) {
            let mut txn = pool.begin().await?;
            for account in chunk {
                let Some((registered, decoded)) = registry.decode(program_id, &account.data) else {
                    metrics::counter!(DECODE_MISSES, "program" => program_id.to_owned())
                        .increment(1);
                    summary.decode_misses += 1;
                    continue;
                };
                self.processor
                    .write_decoded(&mut txn, &registered, &account.pubkey, &decoded, None)
                    .await?;
                summary.written += 1;
            }
            txn.commit().await?;
        }

        for registered in registry.accounts_for_program(program_id) {
            let table = &registered.table.name;
            let removed = garbage_collect(pool, table, sweep_start).await?;
            if removed > 0 {
                info!(table = %table, rows = removed, "removed rows missing from the chain");
            }
            metrics::counter!(ROWS_GARBAGE_COLLECTED, "table" => table.to_string())
                .increment(removed);
            summary.garbage_collected += removed;
        }

        Ok(summary)
    }
}
