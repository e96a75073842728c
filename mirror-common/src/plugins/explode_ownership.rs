use std::sync::Arc;

use async_trait::async_trait;
use pg_escape::quote_identifier;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgConnection;
use tracing::debug;

use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::plugins::{parse_plugin_config, Plugin};
use crate::reconcile::{
    parse_shares, plan_fanout, AllocationKind, AllocationStore, ApplyOutcome, FanoutShare,
    ShareFields, DEFAULT_ADDRESS,
};
use crate::sanitize::FieldMap;
use crate::schema::{IndexDef, TableName, ADDRESS_COLUMN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnershipRole {
    /// The table holds fan-out accounts with a share list.
    Fanout,
    /// The table holds per-asset recipients with a destination pointer.
    Recipient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplodeOwnershipConfig {
    pub role: OwnershipRole,
    #[serde(default = "default_recipient_table")]
    pub recipient_table: String,
    #[serde(default = "default_fanout_table")]
    pub fanout_table: String,
    #[serde(default = "default_key_material_table")]
    pub key_material_table: String,
    #[serde(default = "default_allocation_table")]
    pub allocation_table: String,
    #[serde(default = "default_entity_key_column")]
    pub entity_key_column: String,
    #[serde(default = "default_shares_field")]
    pub shares_field: String,
    #[serde(default = "default_asset_field")]
    pub asset_field: String,
    #[serde(default = "default_destination_field")]
    pub destination_field: String,
    #[serde(default = "default_wallet_field")]
    pub wallet_field: String,
    #[serde(default = "default_delegate_field")]
    pub delegate_field: String,
    #[serde(default = "default_share_field")]
    pub share_field: String,
}

fn default_recipient_table() -> String {
    "public.recipients".to_owned()
}

fn default_fanout_table() -> String {
    "public.mini_fanouts".to_owned()
}

fn default_key_material_table() -> String {
    "public.key_to_assets".to_owned()
}

fn default_allocation_table() -> String {
    "public.share_allocations".to_owned()
}

fn default_entity_key_column() -> String {
    "encoded_entity_key".to_owned()
}

fn default_shares_field() -> String {
    "shares".to_owned()
}

fn default_asset_field() -> String {
    "asset".to_owned()
}

fn default_destination_field() -> String {
    "destination".to_owned()
}

fn default_wallet_field() -> String {
    "wallet".to_owned()
}

fn default_delegate_field() -> String {
    "delegate".to_owned()
}

fn default_share_field() -> String {
    "share".to_owned()
}

/// Explodes fan-out ownership into `share_allocations` rows whenever a fan-out
/// changes its shares or a recipient changes where it points.
#[derive(Debug)]
pub struct ExplodeRecipientDestinationOwnership {
    config: ExplodeOwnershipConfig,
    recipients: TableName,
    fanouts: TableName,
    share_fields: ShareFields,
    store: AllocationStore,
}

impl ExplodeRecipientDestinationOwnership {
    pub const NAME: &'static str = "ExplodeRecipientDestinationOwnership";

    pub fn new(config: ExplodeOwnershipConfig) -> Self {
        Self {
            recipients: TableName::parse(&config.recipient_table),
            fanouts: TableName::parse(&config.fanout_table),
            share_fields: ShareFields {
                wallet: config.wallet_field.clone(),
                delegate: config.delegate_field.clone(),
                share: config.share_field.clone(),
            },
            store: AllocationStore {
                allocations: TableName::parse(&config.allocation_table),
                key_material: TableName::parse(&config.key_material_table),
                entity_key_column: config.entity_key_column.clone(),
            },
            config,
        }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Plugin>, ConfigError> {
        Ok(Arc::new(Self::new(parse_plugin_config(Self::NAME, config)?)))
    }

    fn shares_of(&self, account: Option<&FieldMap>) -> Vec<FanoutShare> {
        parse_shares(
            account.and_then(|account| account.get(&self.config.shares_field)),
            &self.share_fields,
        )
    }

    async fn assets_pointing_at(
        &self,
        conn: &mut PgConnection,
        fanout: &str,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar(&format!(
            "SELECT {} FROM {} WHERE {} = $1",
            quote_identifier(&self.config.asset_field),
            self.recipients.as_quoted_identifier(),
            quote_identifier(&self.config.destination_field)
        ))
        .bind(fanout)
        .fetch_all(&mut *conn)
        .await
    }

    /// The stored share list of a fan-out account, `None` if the address is
    /// not a known fan-out.
    async fn stored_fanout_shares(
        &self,
        conn: &mut PgConnection,
        address: &str,
    ) -> Result<Option<Vec<FanoutShare>>, sqlx::Error> {
        let shares: Option<Option<Value>> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(f) -> $2 FROM {} f WHERE {} = $1",
            self.fanouts.as_quoted_identifier(),
            quote_identifier(ADDRESS_COLUMN)
        ))
        .bind(address)
        .bind(&self.config.shares_field)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(shares.map(|shares| parse_shares(shares.as_ref(), &self.share_fields)))
    }

    async fn on_fanout(
        &self,
        account: &FieldMap,
        previous: Option<&FieldMap>,
        conn: &mut PgConnection,
        block_height: Option<u64>,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let Some(address) = account.get(ADDRESS_COLUMN).and_then(Value::as_str) else {
            return Ok(ApplyOutcome::default());
        };

        let plan = plan_fanout(&self.shares_of(previous), &self.shares_of(Some(account)));
        if plan.is_empty() {
            return Ok(ApplyOutcome::default());
        }

        let mut total = ApplyOutcome::default();
        for asset in self.assets_pointing_at(conn, address).await? {
            let outcome = self
                .store
                .apply_fanout_plan(conn, &asset, &plan, block_height)
                .await?;
            total.written += outcome.written;
            total.deleted += outcome.deleted;
            total.corrected += outcome.corrected;
        }
        Ok(total)
    }

    async fn on_recipient(
        &self,
        account: &FieldMap,
        previous: Option<&FieldMap>,
        conn: &mut PgConnection,
        block_height: Option<u64>,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let field = |row: &FieldMap, name: &str| {
            row.get(name).and_then(Value::as_str).map(str::to_owned)
        };

        let Some(asset) = field(account, &self.config.asset_field) else {
            return Ok(ApplyOutcome::default());
        };
        let new_destination = field(account, &self.config.destination_field)
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_owned());
        let old_destination = previous.and_then(|row| field(row, &self.config.destination_field));

        if old_destination.as_deref() == Some(new_destination.as_str()) {
            return Ok(ApplyOutcome::default());
        }

        let mut outcome = ApplyOutcome::default();
        if let Some(old) = old_destination.as_deref() {
            if old != DEFAULT_ADDRESS && self.stored_fanout_shares(conn, old).await?.is_some() {
                outcome.deleted += self
                    .store
                    .delete_kind(conn, &asset, AllocationKind::Fanout)
                    .await?;
            }
        }

        if new_destination == DEFAULT_ADDRESS {
            outcome.deleted += self.store.delete_asset(conn, &asset).await?;
            return Ok(outcome);
        }

        let applied = match self.stored_fanout_shares(conn, &new_destination).await? {
            Some(shares) => {
                let plan = plan_fanout(&[], &shares);
                self.store
                    .apply_fanout_plan(conn, &asset, &plan, block_height)
                    .await?
            }
            None => {
                self.store
                    .write_direct(conn, &asset, &new_destination, block_height)
                    .await?
            }
        };

        Ok(ApplyOutcome {
            written: applied.written,
            deleted: outcome.deleted + applied.deleted,
            corrected: applied.corrected,
        })
    }
}

#[async_trait]
impl Plugin for ExplodeRecipientDestinationOwnership {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_indexes(&self) -> Vec<IndexDef> {
        match self.config.role {
            OwnershipRole::Recipient => {
                vec![IndexDef::on(&[self.config.destination_field.as_str()])]
            }
            OwnershipRole::Fanout => Vec::new(),
        }
    }

    async fn process_account(
        &self,
        account: FieldMap,
        previous: Option<&FieldMap>,
        txn: &mut PgConnection,
        block_height: Option<u64>,
    ) -> Result<FieldMap, PipelineError> {
        let outcome = match self.config.role {
            OwnershipRole::Fanout => self.on_fanout(&account, previous, txn, block_height).await?,
            OwnershipRole::Recipient => {
                self.on_recipient(&account, previous, txn, block_height)
                    .await?
            }
        };

        if outcome != ApplyOutcome::default() {
            debug!(
                role = ?self.config.role,
                written = outcome.written,
                deleted = outcome.deleted,
                corrected = outcome.corrected,
                "reconciled share allocations"
            );
        }

        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::reconcile::tests::seed_key_material;

    fn plugin(role: &str) -> ExplodeRecipientDestinationOwnership {
        let config: ExplodeOwnershipConfig = serde_json::from_value(json!({"role": role})).unwrap();
        ExplodeRecipientDestinationOwnership::new(config)
    }

    fn map(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn shares(entries: &[(&str, u64)]) -> Value {
        Value::Array(
            entries
                .iter()
                .map(|(wallet, amount)| {
                    json!({
                        "wallet": wallet,
                        "delegate": DEFAULT_ADDRESS,
                        "share": {"share": {"amount": amount}}
                    })
                })
                .collect(),
        )
    }

    async fn setup(db: &PgPool) {
        sqlx::query("CREATE TABLE public.recipients (address TEXT PRIMARY KEY, asset TEXT, destination TEXT)")
            .execute(db)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE public.mini_fanouts (address TEXT PRIMARY KEY, shares JSONB)")
            .execute(db)
            .await
            .unwrap();
        seed_key_material(db, "asset-1").await;
    }

    async fn allocations(db: &PgPool) -> Vec<(String, String, String)> {
        sqlx::query_as(
            "SELECT destination, shares::text, kind FROM share_allocations WHERE asset = 'asset-1' ORDER BY destination",
        )
        .fetch_all(db)
        .await
        .unwrap()
    }

    #[test]
    fn parses_config_with_defaults() {
        let plugin = plugin("recipient");
        assert_eq!(plugin.config.role, OwnershipRole::Recipient);
        assert_eq!(plugin.fanouts, TableName::new("public", "mini_fanouts"));
        assert_eq!(plugin.store.allocations, TableName::new("public", "share_allocations"));
        assert_eq!(plugin.add_indexes(), vec![IndexDef::on(&["destination"])]);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn recipient_pointer_moves_between_wallet_fanout_and_default(db: PgPool) {
        setup(&db).await;
        sqlx::query("INSERT INTO public.mini_fanouts VALUES ('fanout-1', $1)")
            .bind(shares(&[("A", 60), ("B", 40)]))
            .execute(&db)
            .await
            .unwrap();
        let plugin = plugin("recipient");
        let mut txn = db.begin().await.unwrap();

        let direct = map(json!({"address": "r1", "asset": "asset-1", "destination": "W"}));
        plugin
            .process_account(direct.clone(), None, &mut txn, Some(1))
            .await
            .unwrap();

        let fanout = map(json!({"address": "r1", "asset": "asset-1", "destination": "fanout-1"}));
        plugin
            .process_account(fanout.clone(), Some(&direct), &mut txn, Some(2))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(
            allocations(&db).await,
            vec![
                ("A".to_owned(), "60".to_owned(), "fanout".to_owned()),
                ("B".to_owned(), "40".to_owned(), "fanout".to_owned()),
            ]
        );

        let mut txn = db.begin().await.unwrap();
        let cleared = map(json!({"address": "r1", "asset": "asset-1", "destination": DEFAULT_ADDRESS}));
        plugin
            .process_account(cleared, Some(&fanout), &mut txn, Some(3))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert!(allocations(&db).await.is_empty());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn fanout_share_change_reaches_every_pointing_asset(db: PgPool) {
        setup(&db).await;
        sqlx::query("INSERT INTO public.recipients VALUES ('r1', 'asset-1', 'fanout-1')")
            .execute(&db)
            .await
            .unwrap();
        let plugin = plugin("fanout");
        let mut txn = db.begin().await.unwrap();

        let before = map(json!({"address": "fanout-1", "shares": shares(&[("A", 60), ("B", 40)])}));
        plugin
            .process_account(before.clone(), None, &mut txn, Some(1))
            .await
            .unwrap();

        let after = map(json!({"address": "fanout-1", "shares": shares(&[("A", 60), ("C", 40)])}));
        plugin
            .process_account(after, Some(&before), &mut txn, Some(2))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(
            allocations(&db).await,
            vec![
                ("A".to_owned(), "60".to_owned(), "fanout".to_owned()),
                ("C".to_owned(), "40".to_owned(), "fanout".to_owned()),
            ]
        );
    }
}
