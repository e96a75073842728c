//! Re-reads recently refreshed rows from the chain and repairs the ones that
//! drifted.
use std::collections::HashSet;
use std::sync::Arc;

use mirror_common::event::AccountChangeEvent;
use mirror_common::metrics::record_correction;
use mirror_common::pipeline::{AccountProcessor, ProcessOutcome, SharedRegistry, WriteOrigin};
use mirror_common::rpc::{ChainClient, MAX_MULTIPLE_ACCOUNTS};
use mirror_common::schema::{ADDRESS_COLUMN, REFRESHED_AT_COLUMN};
use mirror_common::single_flight::SingleFlight;
use mirror_common::upsert::{delete, UpsertOutcome};
use pg_escape::quote_identifier;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::error::JobError;
use crate::refresh::TriggerStatus;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegritySummary {
    pub checked: usize,
    pub corrected: usize,
    pub deleted: usize,
}

pub struct IntegrityChecker {
    processor: AccountProcessor,
    chain: ChainClient,
    window_hours: u32,
    flight: SingleFlight,
}

impl IntegrityChecker {
    pub fn new(pool: PgPool, registry: SharedRegistry, chain: ChainClient, window_hours: u32) -> Self {
        Self {
            processor: AccountProcessor::new(pool, registry, WriteOrigin::IntegrityCheck),
            chain,
            window_hours,
            flight: SingleFlight::new(),
        }
    }

    pub fn trigger(self: &Arc<Self>, programs: Vec<String>) -> TriggerStatus {
        let Some(permit) = self.flight.try_acquire() else {
            return TriggerStatus::Busy;
        };

        let checker = self.clone();
        tokio::spawn(async move {
            for program in &programs {
                match checker.check_program(program).await {
                    Ok(summary) => info!(
                        program = %program,
                        checked = summary.checked,
                        corrected = summary.corrected,
                        deleted = summary.deleted,
                        "integrity check finished"
                    ),
                    Err(error) => error!(program = %program, "integrity check failed: {}", error),
                }
            }
            drop(permit);
        });
        TriggerStatus::Accepted
    }

    async fn sample(&self, program_id: &str) -> Result<Vec<String>, JobError> {
        let registry = self.processor.registry().current();
        let mut seen = HashSet::new();
        let mut addresses = Vec::new();

        for registered in registry.accounts_for_program(program_id) {
            let rows: Vec<String> = sqlx::query_scalar(&format!(
                "SELECT {} FROM {} WHERE {} >= now() - make_interval(hours => $1) ORDER BY 1",
                quote_identifier(ADDRESS_COLUMN),
                registered.table.name.as_quoted_identifier(),
                quote_identifier(REFRESHED_AT_COLUMN),
            ))
            .bind(self.window_hours as i32)
            .fetch_all(self.processor.pool())
            .await?;

            addresses.extend(rows.into_iter().filter(|address| seen.insert(address.clone())));
        }

        Ok(addresses)
    }

    pub async fn check_program(&self, program_id: &str) -> Result<IntegritySummary, JobError> {
        let addresses = self.sample(program_id).await?;
        let registry = self.processor.registry().current();
        let mut summary = IntegritySummary::default();

        for batch in addresses.chunks(MAX_MULTIPLE_ACCOUNTS) {
            let accounts = self.chain.get_multiple_accounts(batch).await?;
            let mut txn = self.processor.pool().begin().await?;

            for (address, account) in batch.iter().zip(accounts) {
                summary.checked += 1;
                match account {
                    Some(account) if account.owner == program_id => {
                        let event = AccountChangeEvent::update(program_id, address, account.data, None);
                        let outcome = self.processor.process_event(&mut txn, &registry, &event).await?;
                        if outcome == ProcessOutcome::Written(UpsertOutcome::Updated { corrected: true }) {
                            summary.corrected += 1;
                        }
                    }
                    // Closed, or handed over to another program.
                    _ => {
                        for registered in registry.accounts_for_program(program_id) {
                            if delete(&mut txn, &registered.table.name, address).await? {
                                warn!(
                                    table = %registered.table.name,
                                    address = %address,
                                    "account no longer exists on chain, deleted"
                                );
                                record_correction(
                                    WriteOrigin::IntegrityCheck.as_str(),
                                    &registered.table.name.to_string(),
                                );
                                summary.deleted += 1;
                            }
                        }
                    }
                }
            }

            txn.commit().await?;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::MockServer;
    use serde_json::json;

    use super::*;
    use crate::fixtures::{authority, migrated_registry, rpc_account, stored_count, PROGRAM};

    #[sqlx::test(migrations = "../migrations")]
    async fn repairs_drifted_and_closed_accounts(db: PgPool) {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .json_body_partial(r#"{"method": "getMultipleAccounts"}"#);
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "context": {"slot": 10},
                        "value": [rpc_account(5), rpc_account(7), null]
                    }
                }));
            })
            .await;

        let registry = migrated_registry(&db).await;
        sqlx::query(
            r#"
INSERT INTO public.counters (address, authority, count, refreshed_at) VALUES
    ('a-same', $1, 5, now()),
    ('b-drifted', $1, 6, now()),
    ('c-closed', $1, 1, now()),
    ('d-old', $1, 1, now() - interval '3 days')
            "#,
        )
        .bind(authority())
        .execute(&db)
        .await
        .unwrap();

        let chain = ChainClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let checker = IntegrityChecker::new(db.clone(), registry, chain, 24);

        let summary = checker.check_program(PROGRAM).await.unwrap();
        lookup.assert_async().await;

        assert_eq!(summary.checked, 3);
        assert_eq!(summary.deleted, 1);
        // a-same already matched the chain.
        assert_eq!(summary.corrected, 1);
        assert_eq!(stored_count(&db, "b-drifted").await.as_deref(), Some("7"));
        assert_eq!(stored_count(&db, "c-closed").await, None);
        // Outside the window, not looked at.
        assert_eq!(stored_count(&db, "d-old").await.as_deref(), Some("1"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn empty_window_makes_no_calls(db: PgPool) {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST);
                then.status(500);
            })
            .await;

        let registry = migrated_registry(&db).await;
        let chain = ChainClient::new(&server.base_url(), Duration::from_secs(5)).unwrap();
        let checker = IntegrityChecker::new(db, registry, chain, 24);

        assert_eq!(checker.check_program(PROGRAM).await.unwrap(), IntegritySummary::default());
        lookup.assert_hits_async(0).await;
    }
}
