//! # Ownership reconciliation
//!
//! Keeps `share_allocations` in line with fan-out accounts and the recipient
//! accounts pointing at them. Planning is pure; applying the plan runs inside
//! the caller's transaction.
use std::collections::BTreeMap;

use pg_escape::quote_identifier;
use serde_json::Value;
use sqlx::PgConnection;
use tracing::{debug, warn};

use crate::metrics::record_correction;
use crate::schema::TableName;

/// The all-zero key, meaning "unset" wherever a key is optional on chain.
pub const DEFAULT_ADDRESS: &str = "11111111111111111111111111111111";

/// Shares given to a wallet that receives an asset's rewards directly.
pub const DIRECT_SHARES: u128 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareAmount {
    Proportional(u128),
    Fixed(u128),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutShare {
    pub wallet: String,
    pub delegate: Option<String>,
    pub amount: ShareAmount,
}

impl FanoutShare {
    pub fn proportional(wallet: &str, amount: u128) -> Self {
        Self {
            wallet: wallet.to_owned(),
            delegate: None,
            amount: ShareAmount::Proportional(amount),
        }
    }

    /// Where rewards for this share end up: the delegate unless it is unset.
    pub fn destination(&self) -> &str {
        match self.delegate.as_deref() {
            Some(delegate) if delegate != DEFAULT_ADDRESS => delegate,
            _ => &self.wallet,
        }
    }
}

/// Field names of one entry of a fan-out account's share list.
#[derive(Debug, Clone)]
pub struct ShareFields {
    pub wallet: String,
    pub delegate: String,
    pub share: String,
}

impl Default for ShareFields {
    fn default() -> Self {
        Self {
            wallet: "wallet".to_owned(),
            delegate: "delegate".to_owned(),
            share: "share".to_owned(),
        }
    }
}

/// Reads a sanitized share list, skipping entries it cannot interpret.
pub fn parse_shares(value: Option<&Value>, fields: &ShareFields) -> Vec<FanoutShare> {
    let Some(Value::Array(entries)) = value else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let share = parse_share(entry, fields);
            if share.is_none() {
                warn!(entry = %entry, "skipping malformed fan-out share");
            }
            share
        })
        .collect()
}

fn parse_share(entry: &Value, fields: &ShareFields) -> Option<FanoutShare> {
    let wallet = entry.get(&fields.wallet)?.as_str()?.to_owned();
    let delegate = entry
        .get(&fields.delegate)
        .and_then(Value::as_str)
        .map(str::to_owned);

    let Value::Object(shape) = entry.get(&fields.share)? else {
        return None;
    };
    let (kind, payload) = shape.iter().next()?;
    let amount = parse_amount(payload.get("amount")?)?;
    let amount = match kind.to_ascii_lowercase().as_str() {
        "share" => ShareAmount::Proportional(amount),
        "fixed" => ShareAmount::Fixed(amount),
        _ => return None,
    };

    Some(FanoutShare {
        wallet,
        delegate,
        amount,
    })
}

fn parse_amount(value: &Value) -> Option<u128> {
    match value {
        Value::Number(number) => number.as_u64().map(u128::from),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationKey {
    pub owner: String,
    pub destination: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareShape {
    pub shares: u128,
    pub fixed_amount: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAllocation {
    pub key: AllocationKey,
    pub shape: ShareShape,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutPlan {
    pub total_shares: u128,
    pub deletes: Vec<AllocationKey>,
    pub inserts: Vec<PlannedAllocation>,
    pub updates: Vec<PlannedAllocation>,
}

impl FanoutPlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn writes(&self) -> impl Iterator<Item = (&PlannedAllocation, bool)> {
        self.inserts
            .iter()
            .map(|planned| (planned, true))
            .chain(self.updates.iter().map(|planned| (planned, false)))
    }
}

/// Merges shares with the same owner and destination.
pub fn merge_shares(shares: &[FanoutShare]) -> BTreeMap<AllocationKey, ShareShape> {
    let mut merged: BTreeMap<AllocationKey, ShareShape> = BTreeMap::new();
    for share in shares {
        let shape = merged
            .entry(AllocationKey {
                owner: share.wallet.clone(),
                destination: share.destination().to_owned(),
            })
            .or_default();
        match share.amount {
            ShareAmount::Proportional(amount) => shape.shares += amount,
            ShareAmount::Fixed(amount) => shape.fixed_amount += amount,
        }
    }
    merged
}

fn total_shares(merged: &BTreeMap<AllocationKey, ShareShape>) -> u128 {
    merged.values().map(|shape| shape.shares).sum()
}

/// Diffs two share lists of one fan-out. A changed total rewrites every row,
/// since each of them carries it.
pub fn plan_fanout(old: &[FanoutShare], new: &[FanoutShare]) -> FanoutPlan {
    let old = merge_shares(old);
    let new = merge_shares(new);
    let old_total = total_shares(&old);
    let new_total = total_shares(&new);

    let deletes = old
        .keys()
        .filter(|key| !new.contains_key(*key))
        .cloned()
        .collect();

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    for (key, shape) in &new {
        let planned = PlannedAllocation {
            key: key.clone(),
            shape: *shape,
        };
        match old.get(key) {
            None => inserts.push(planned),
            Some(previous) if previous != shape || old_total != new_total => updates.push(planned),
            Some(_) => {}
        }
    }

    FanoutPlan {
        total_shares: new_total,
        deletes,
        inserts,
        updates,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Direct,
    Fanout,
}

impl AllocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationKind::Direct => "direct",
            AllocationKind::Fanout => "fanout",
        }
    }

    fn other(&self) -> Self {
        match self {
            AllocationKind::Direct => AllocationKind::Fanout,
            AllocationKind::Fanout => AllocationKind::Direct,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMaterial {
    pub entity_key: Option<String>,
    pub key_serialization: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub written: u64,
    pub deleted: u64,
    pub corrected: u64,
}

/// Where allocations and key material live.
#[derive(Debug, Clone)]
pub struct AllocationStore {
    pub allocations: TableName,
    pub key_material: TableName,
    pub entity_key_column: String,
}

impl AllocationStore {
    pub async fn key_material(
        &self,
        conn: &mut PgConnection,
        asset: &str,
    ) -> Result<Option<KeyMaterial>, sqlx::Error> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(&format!(
            r#"
SELECT {}::text, key_serialization #>> '{{}}'
FROM {} WHERE asset = $1
LIMIT 1
            "#,
            quote_identifier(&self.entity_key_column),
            self.key_material.as_quoted_identifier()
        ))
        .bind(asset)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|(entity_key, key_serialization)| KeyMaterial {
            entity_key,
            key_serialization,
        }))
    }

    pub async fn delete_kind(
        &self,
        conn: &mut PgConnection,
        asset: &str,
        kind: AllocationKind,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE asset = $1 AND kind = $2",
            self.allocations.as_quoted_identifier()
        ))
        .bind(asset)
        .bind(kind.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_asset(
        &self,
        conn: &mut PgConnection,
        asset: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE asset = $1",
            self.allocations.as_quoted_identifier()
        ))
        .bind(asset)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_allocation(
        &self,
        conn: &mut PgConnection,
        asset: &str,
        key: &AllocationKey,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE asset = $1 AND owner = $2 AND destination = $3 AND kind = 'fanout'",
            self.allocations.as_quoted_identifier()
        ))
        .bind(asset)
        .bind(&key.owner)
        .bind(&key.destination)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Upserts one allocation, removing rows of the other kind first. Returns
    /// the stored shape the row had before, if any.
    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        conn: &mut PgConnection,
        asset: &str,
        planned: &PlannedAllocation,
        total_shares: u128,
        kind: AllocationKind,
        key_material: &KeyMaterial,
        block_height: Option<u64>,
    ) -> Result<Option<(ShareShape, u128)>, sqlx::Error> {
        self.delete_kind(conn, asset, kind.other()).await?;

        let existing: Option<(String, String, String)> = sqlx::query_as(&format!(
            r#"
SELECT shares::text, total_shares::text, fixed_amount::text
FROM {} WHERE asset = $1 AND owner = $2 AND destination = $3
FOR UPDATE
            "#,
            self.allocations.as_quoted_identifier()
        ))
        .bind(asset)
        .bind(&planned.key.owner)
        .bind(&planned.key.destination)
        .fetch_optional(&mut *conn)
        .await?;

        sqlx::query(&format!(
            r#"
INSERT INTO {}
    (asset, owner, destination, shares, total_shares, fixed_amount, kind,
     entity_key, key_serialization, last_block_height, updated_at)
VALUES ($1, $2, $3, $4::numeric, $5::numeric, $6::numeric, $7, $8, $9, $10::numeric, now())
ON CONFLICT (asset, owner, destination) DO UPDATE SET
    shares = EXCLUDED.shares,
    total_shares = EXCLUDED.total_shares,
    fixed_amount = EXCLUDED.fixed_amount,
    kind = EXCLUDED.kind,
    entity_key = EXCLUDED.entity_key,
    key_serialization = EXCLUDED.key_serialization,
    last_block_height = EXCLUDED.last_block_height,
    updated_at = now()
            "#,
            self.allocations.as_quoted_identifier()
        ))
        .bind(asset)
        .bind(&planned.key.owner)
        .bind(&planned.key.destination)
        .bind(planned.shape.shares.to_string())
        .bind(total_shares.to_string())
        .bind(planned.shape.fixed_amount.to_string())
        .bind(kind.as_str())
        .bind(&key_material.entity_key)
        .bind(&key_material.key_serialization)
        .bind(block_height.map(|height| height.to_string()))
        .execute(&mut *conn)
        .await?;

        Ok(existing.and_then(|(shares, total, fixed)| {
            Some((
                ShareShape {
                    shares: shares.parse().ok()?,
                    fixed_amount: fixed.parse().ok()?,
                },
                total.parse().ok()?,
            ))
        }))
    }

    /// Applies a fan-out plan to one asset.
    pub async fn apply_fanout_plan(
        &self,
        conn: &mut PgConnection,
        asset: &str,
        plan: &FanoutPlan,
        block_height: Option<u64>,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let mut outcome = ApplyOutcome::default();

        for key in &plan.deletes {
            outcome.deleted += self.delete_allocation(conn, asset, key).await?;
        }

        if plan.inserts.is_empty() && plan.updates.is_empty() {
            return Ok(outcome);
        }

        let key_material = match self.key_material(conn, asset).await? {
            Some(key_material) => key_material,
            None => {
                warn!(
                    asset = asset,
                    "no key material for asset, writing fan-out rows without it"
                );
                KeyMaterial::default()
            }
        };

        for (planned, expected_new) in plan.writes() {
            let existing = self
                .write(
                    conn,
                    asset,
                    planned,
                    plan.total_shares,
                    AllocationKind::Fanout,
                    &key_material,
                    block_height,
                )
                .await?;
            outcome.written += 1;

            let drifted = match existing {
                Some(stored) => expected_new && stored != (planned.shape, plan.total_shares),
                None => !expected_new,
            };
            if drifted {
                outcome.corrected += 1;
                record_correction("reconcile", &self.allocations.to_string());
            }
        }

        debug!(asset = asset, ?outcome, "applied fan-out plan");
        Ok(outcome)
    }

    /// Points an asset directly at a wallet. Skips the write when the asset
    /// has no key material.
    pub async fn write_direct(
        &self,
        conn: &mut PgConnection,
        asset: &str,
        wallet: &str,
        block_height: Option<u64>,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let Some(key_material) = self.key_material(conn, asset).await? else {
            warn!(
                asset = asset,
                wallet = wallet,
                "no key material for asset, skipping direct allocation"
            );
            return Ok(ApplyOutcome::default());
        };

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE asset = $1 AND kind = 'direct' AND destination <> $2",
            self.allocations.as_quoted_identifier()
        ))
        .bind(asset)
        .bind(wallet)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        let planned = PlannedAllocation {
            key: AllocationKey {
                owner: wallet.to_owned(),
                destination: wallet.to_owned(),
            },
            shape: ShareShape {
                shares: DIRECT_SHARES,
                fixed_amount: 0,
            },
        };
        self.write(
            conn,
            asset,
            &planned,
            DIRECT_SHARES,
            AllocationKind::Direct,
            &key_material,
            block_height,
        )
        .await?;

        Ok(ApplyOutcome {
            written: 1,
            deleted,
            corrected: 0,
        })
    }
}
