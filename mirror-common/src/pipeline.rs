//! # Account pipeline
//!
//! decode → sanitize → plugins → upsert, shared by every source and by the
//! bulk refresh. Each call runs inside one transaction supplied by the caller
//! or opened here.
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::{debug, warn};

use crate::decoder::Decoded;
use crate::event::AccountChangeEvent;
use crate::metrics::record_correction;
use crate::metrics_consts::{
    DECODE_MISSES, PROCESS_DURATION, ROWS_DELETED, ROWS_WRITTEN, WRITE_FAILURES,
};
use crate::plugins::run_plugins;
use crate::sanitize::{sanitize_account, FieldMap};
use crate::schema::{RegisteredAccount, SchemaRegistry, ADDRESS_COLUMN, LAST_BLOCK_HEIGHT_COLUMN};
use crate::upsert::{delete, fetch_existing, is_older_than_stored, upsert, UpsertOutcome};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("plugin {plugin} failed: {reason}")]
    Plugin { plugin: &'static str, reason: String },
}

/// Which path a write came through. Decides how it is labelled and whether
/// overwriting a differing row counts as a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Stream,
    Queue,
    Webhook,
    Refresh,
    IntegrityCheck,
}

impl WriteOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOrigin::Stream => "stream",
            WriteOrigin::Queue => "queue",
            WriteOrigin::Webhook => "webhook",
            WriteOrigin::Refresh => "refresh",
            WriteOrigin::IntegrityCheck => "integrity_check",
        }
    }

    fn counts_corrections(&self) -> bool {
        matches!(
            self,
            WriteOrigin::Webhook | WriteOrigin::Refresh | WriteOrigin::IntegrityCheck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Written(UpsertOutcome),
    Deleted { rows: u64 },
    /// No configured account type parsed the data.
    DecodeMiss,
    /// The owning program is not mirrored.
    Irrelevant,
}

/// The live registry. Reloads swap in a new one; readers keep whichever they
/// cloned for the duration of their work.
#[derive(Debug, Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<SchemaRegistry>>>,
}

impl SharedRegistry {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    pub fn current(&self) -> Arc<SchemaRegistry> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, registry: SchemaRegistry) {
        let registry = Arc::new(registry);
        match self.inner.write() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountProcessor {
    pool: PgPool,
    registry: SharedRegistry,
    origin: WriteOrigin,
}

impl AccountProcessor {
    pub fn new(pool: PgPool, registry: SharedRegistry, origin: WriteOrigin) -> Self {
        Self {
            pool,
            registry,
            origin,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn origin(&self) -> WriteOrigin {
        self.origin
    }

    /// Applies a batch of events atomically: either all of them are
    /// committed or none is.
    pub async fn process_batch(
        &self,
        events: &[AccountChangeEvent],
    ) -> Result<Vec<ProcessOutcome>, PipelineError> {
        let registry = self.registry.current();
        let mut txn = self.pool.begin().await?;

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            match self.process_event(&mut txn, &registry, event).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    metrics::counter!(WRITE_FAILURES, "origin" => self.origin.as_str())
                        .increment(1);
                    return Err(error);
                }
            }
        }

        txn.commit().await?;
        Ok(outcomes)
    }

    pub async fn process(&self, event: &AccountChangeEvent) -> Result<ProcessOutcome, PipelineError> {
        let outcomes = self.process_batch(std::slice::from_ref(event)).await?;
        Ok(outcomes
            .into_iter()
            .next()
            .unwrap_or(ProcessOutcome::Irrelevant))
    }

    pub async fn process_event(
        &self,
        conn: &mut PgConnection,
        registry: &SchemaRegistry,
        event: &AccountChangeEvent,
    ) -> Result<ProcessOutcome, PipelineError> {
        let start = Instant::now();

        let outcome = if event.is_delete {
            self.delete_everywhere(conn, registry, event).await?
        } else if !registry.is_tracked(&event.program_id) {
            ProcessOutcome::Irrelevant
        } else {
            match registry.decode(&event.program_id, &event.data) {
                Some((account, decoded)) => {
                    let outcome = self
                        .write_decoded(conn, &account, &event.address, &decoded, event.slot)
                        .await?;
                    ProcessOutcome::Written(outcome)
                }
                None => {
                    metrics::counter!(DECODE_MISSES, "program" => event.program_id.clone())
                        .increment(1);
                    debug!(
                        program = %event.program_id,
                        address = %event.address,
                        "no configured account type matched, dropping"
                    );
                    ProcessOutcome::DecodeMiss
                }
            }
        };

        metrics::histogram!(PROCESS_DURATION, "origin" => self.origin.as_str())
            .record(start.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Removes an address from the tables of its program, or from every table
    /// when the owner is unknown (a closed account has none).
    async fn delete_everywhere(
        &self,
        conn: &mut PgConnection,
        registry: &SchemaRegistry,
        event: &AccountChangeEvent,
    ) -> Result<ProcessOutcome, PipelineError> {
        let accounts: Vec<&Arc<RegisteredAccount>> = if registry.is_tracked(&event.program_id) {
            registry.accounts_for_program(&event.program_id).iter().collect()
        } else {
            registry.accounts().collect()
        };

        let mut rows = 0;
        for account in accounts {
            if delete(conn, &account.table.name, &event.address).await? {
                rows += 1;
                metrics::counter!(ROWS_DELETED, "table" => account.table.name.to_string())
                    .increment(1);
            }
        }

        Ok(ProcessOutcome::Deleted { rows })
    }

    /// Writes an already decoded account, running its plugins first. Nothing
    /// runs when the stored row comes from a later block.
    pub async fn write_decoded(
        &self,
        conn: &mut PgConnection,
        account: &RegisteredAccount,
        address: &str,
        decoded: &Decoded,
        slot: Option<u64>,
    ) -> Result<UpsertOutcome, PipelineError> {
        let mut fields = sanitize_account(decoded);
        fields.insert(ADDRESS_COLUMN.to_owned(), Value::String(address.to_owned()));
        fields.insert(
            LAST_BLOCK_HEIGHT_COLUMN.to_owned(),
            slot.map(|slot| Value::String(slot.to_string()))
                .unwrap_or(Value::Null),
        );

        self.write_fields(conn, account, fields, slot).await
    }

    async fn write_fields(
        &self,
        conn: &mut PgConnection,
        account: &RegisteredAccount,
        fields: FieldMap,
        slot: Option<u64>,
    ) -> Result<UpsertOutcome, PipelineError> {
        let table = &account.table;
        let address = fields
            .get(ADDRESS_COLUMN)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let previous = fetch_existing(conn, &table.name, &address).await?;
        if is_older_than_stored(previous.as_ref(), slot) {
            debug!(table = %table.name, address = %address, "stored row is newer, skipping");
            return Ok(UpsertOutcome::Skipped);
        }

        let fields = run_plugins(&account.plugins, fields, previous.as_ref(), conn, slot).await?;
        let outcome = upsert(conn, table, &fields, previous.as_ref()).await?;

        match outcome {
            UpsertOutcome::Skipped => {
                debug!(table = %table.name, address = %address, "stored row is newer, skipping");
            }
            UpsertOutcome::Updated { corrected: true } if self.origin.counts_corrections() => {
                warn!(
                    table = %table.name,
                    address = %address,
                    origin = self.origin.as_str(),
                    "stored row differed from chain state, corrected"
                );
                record_correction(self.origin.as_str(), &table.name.to_string());
            }
            _ => {}
        }

        if outcome != UpsertOutcome::Skipped {
            metrics::counter!(ROWS_WRITTEN, "table" => table.name.to_string(), "origin" => self.origin.as_str())
                .increment(1);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::config::ConfigDocument;
    use crate::decoder::tests::{sample_idl, wallet_bytes};
    use crate::idl::Idl;
    use crate::reconcile::tests::seed_key_material;
    use crate::reconcile::DEFAULT_ADDRESS;

    fn registry() -> SchemaRegistry {
        let document: ConfigDocument = serde_json::from_value(json!({
            "configs": [{
                "programId": "prog",
                "idlPath": "unused",
                "accounts": [
                    {"type": "Legacy", "table": "legacy"},
                    {"type": "Wallet", "table": "wallets"}
                ]
            }]
        }))
        .unwrap();
        SchemaRegistry::build(&document, &HashMap::from([("prog".to_owned(), sample_idl())]))
            .unwrap()
    }

    #[test]
    fn shared_registry_swaps_whole_registries() {
        let shared = SharedRegistry::new(SchemaRegistry::default());
        let before = shared.current();
        assert!(!before.is_tracked("prog"));

        shared.replace(registry());
        assert!(shared.current().is_tracked("prog"));
        // Readers holding the old one are unaffected.
        assert!(!before.is_tracked("prog"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn writes_decoded_accounts_and_deletes(db: PgPool) {
        let registry = registry();
        registry.migrate(&db).await.unwrap();
        let processor =
            AccountProcessor::new(db.clone(), SharedRegistry::new(registry), WriteOrigin::Stream);

        let update = AccountChangeEvent::update("prog", "w1", wallet_bytes([3; 32], 42, Some("gm")), Some(7));
        assert_eq!(
            processor.process(&update).await.unwrap(),
            ProcessOutcome::Written(UpsertOutcome::Inserted)
        );
        assert_eq!(
            processor.process(&update).await.unwrap(),
            ProcessOutcome::Written(UpsertOutcome::Updated { corrected: false })
        );

        let row: Value = sqlx::query_scalar("SELECT to_jsonb(w) FROM public.wallets w WHERE address = 'w1'")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(row["balance"], json!(42));
        assert_eq!(row["memo"], json!("gm"));
        assert_eq!(row["kind"], json!({"share": {"amount": 60}}));
        assert_eq!(row["last_block_height"], json!(7));

        let miss = AccountChangeEvent::update("prog", "w2", vec![0; 4], Some(8));
        assert_eq!(processor.process(&miss).await.unwrap(), ProcessOutcome::DecodeMiss);

        let other = AccountChangeEvent::update("other", "w3", vec![0; 64], Some(8));
        assert_eq!(processor.process(&other).await.unwrap(), ProcessOutcome::Irrelevant);

        let closed = AccountChangeEvent::delete("", "w1", Some(9));
        assert_eq!(
            processor.process(&closed).await.unwrap(),
            ProcessOutcome::Deleted { rows: 1 }
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn a_failing_event_rolls_back_the_batch(db: PgPool) {
        let registry = registry();
        registry.migrate(&db).await.unwrap();
        let processor =
            AccountProcessor::new(db.clone(), SharedRegistry::new(registry), WriteOrigin::Stream);

        sqlx::query("ALTER TABLE public.wallets ADD CONSTRAINT small_balance CHECK (balance < 100)")
            .execute(&db)
            .await
            .unwrap();

        let events = [
            AccountChangeEvent::update("prog", "ok", wallet_bytes([1; 32], 1, None), Some(1)),
            AccountChangeEvent::update("prog", "bad", wallet_bytes([1; 32], 1_000, None), Some(1)),
        ];
        assert!(processor.process_batch(&events).await.is_err());

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM public.wallets")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    fn recipient_registry() -> SchemaRegistry {
        let idl: Idl = serde_json::from_value(json!({
            "accounts": [{"name": "Recipient", "discriminator": [4, 4, 4, 4, 4, 4, 4, 4]}],
            "types": [{
                "name": "Recipient",
                "type": {"kind": "struct", "fields": [
                    {"name": "asset", "type": "publicKey"},
                    {"name": "destination", "type": "publicKey"}
                ]}
            }]
        }))
        .unwrap();
        let document: ConfigDocument = serde_json::from_value(json!({
            "configs": [{
                "programId": "rewards",
                "idlPath": "unused",
                "accounts": [{
                    "type": "Recipient",
                    "table": "recipients",
                    "plugins": [{
                        "type": "ExplodeRecipientDestinationOwnership",
                        "config": {"role": "recipient"}
                    }]
                }]
            }]
        }))
        .unwrap();
        SchemaRegistry::build(&document, &HashMap::from([("rewards".to_owned(), Arc::new(idl))]))
            .unwrap()
    }

    fn recipient_bytes(asset: [u8; 32], destination: [u8; 32]) -> Vec<u8> {
        let mut data = vec![4u8; 8];
        data.extend_from_slice(&asset);
        data.extend_from_slice(&destination);
        data
    }

    fn key(bytes: [u8; 32]) -> String {
        bs58::encode(bytes).into_string()
    }

    async fn allocations(db: &PgPool, asset: &str) -> Vec<(String, String, String)> {
        sqlx::query_as(
            "SELECT destination, shares::text, kind FROM share_allocations WHERE asset = $1 ORDER BY destination",
        )
        .bind(asset)
        .fetch_all(db)
        .await
        .unwrap()
    }

    async fn stored_destination(db: &PgPool) -> String {
        sqlx::query_scalar("SELECT destination FROM public.recipients WHERE address = 'r1'")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn older_slot_leaves_row_and_allocations_alone(db: PgPool) {
        let registry = recipient_registry();
        registry.migrate(&db).await.unwrap();
        sqlx::query("CREATE TABLE public.mini_fanouts (address TEXT PRIMARY KEY, shares JSONB)")
            .execute(&db)
            .await
            .unwrap();

        let (asset, wallet, fanout) = ([1u8; 32], [2u8; 32], [3u8; 32]);
        sqlx::query("INSERT INTO public.mini_fanouts VALUES ($1, $2)")
            .bind(key(fanout))
            .bind(json!([
                {"wallet": "A", "delegate": DEFAULT_ADDRESS, "share": {"share": {"amount": 60}}},
                {"wallet": "B", "delegate": DEFAULT_ADDRESS, "share": {"share": {"amount": 40}}}
            ]))
            .execute(&db)
            .await
            .unwrap();
        seed_key_material(&db, &key(asset)).await;

        let processor =
            AccountProcessor::new(db.clone(), SharedRegistry::new(registry), WriteOrigin::Stream);
        let direct = vec![(key(wallet), "100".to_owned(), "direct".to_owned())];

        let to_wallet = AccountChangeEvent::update("rewards", "r1", recipient_bytes(asset, wallet), Some(20));
        assert_eq!(
            processor.process(&to_wallet).await.unwrap(),
            ProcessOutcome::Written(UpsertOutcome::Inserted)
        );
        assert_eq!(allocations(&db, &key(asset)).await, direct);

        // A replay from before the stored block must not move the allocations.
        let replayed = AccountChangeEvent::update("rewards", "r1", recipient_bytes(asset, fanout), Some(19));
        assert_eq!(
            processor.process(&replayed).await.unwrap(),
            ProcessOutcome::Written(UpsertOutcome::Skipped)
        );
        assert_eq!(stored_destination(&db).await, key(wallet));
        assert_eq!(allocations(&db, &key(asset)).await, direct);

        let to_fanout = AccountChangeEvent::update("rewards", "r1", recipient_bytes(asset, fanout), Some(21));
        assert!(matches!(
            processor.process(&to_fanout).await.unwrap(),
            ProcessOutcome::Written(UpsertOutcome::Updated { .. })
        ));
        assert_eq!(stored_destination(&db).await, key(fanout));
        assert_eq!(
            allocations(&db, &key(asset)).await,
            vec![
                ("A".to_owned(), "60".to_owned(), "fanout".to_owned()),
                ("B".to_owned(), "40".to_owned(), "fanout".to_owned()),
            ]
        );
    }
}
