//! Row writes for mirrored account tables.
use chrono::{DateTime, Utc};
use pg_escape::quote_identifier;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};

use crate::sanitize::{values_equivalent, FieldMap};
use crate::schema::{
    TableName, TableSchema, ADDRESS_COLUMN, LAST_BLOCK_HEIGHT_COLUMN, REFRESHED_AT_COLUMN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// `corrected` is set when an overwritten column held a different value.
    Updated { corrected: bool },
    /// The stored row came from a later block.
    Skipped,
}

/// Reads the stored row as JSON and locks it for the rest of the transaction.
/// Top level numbers come back as their exact decimal text, NUMERIC(40, 0)
/// does not fit a JSON number.
pub async fn fetch_existing(
    conn: &mut PgConnection,
    table: &TableName,
    address: &str,
) -> Result<Option<FieldMap>, sqlx::Error> {
    let row: Option<Value> = sqlx::query_scalar(&format!(
        r#"
SELECT (
    SELECT jsonb_object_agg(
        c.key,
        CASE WHEN jsonb_typeof(c.value) = 'number' THEN to_jsonb(c.value #>> '{{}}') ELSE c.value END
    )
    FROM jsonb_each(to_jsonb(t)) c
)
FROM {} t WHERE {} = $1 FOR UPDATE
        "#,
        table.as_quoted_identifier(),
        quote_identifier(ADDRESS_COLUMN)
    ))
    .bind(address)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.and_then(|row| match row {
        Value::Object(map) => Some(map),
        _ => None,
    }))
}

/// Whether the stored row was written from a later block than `slot`, the
/// same rule the upsert statement applies.
pub fn is_older_than_stored(previous: Option<&FieldMap>, slot: Option<u64>) -> bool {
    let Some(slot) = slot else {
        return false;
    };
    let stored = previous
        .and_then(|previous| previous.get(LAST_BLOCK_HEIGHT_COLUMN))
        .and_then(|value| match value {
            Value::String(text) => text.parse::<u128>().ok(),
            Value::Number(number) => number.as_u64().map(u128::from),
            _ => None,
        });

    stored.is_some_and(|stored| u128::from(slot) < stored)
}

/// Writes `row` keyed by its `address`. Keys that are not columns of the table
/// are ignored, as are update columns the row does not carry.
pub async fn upsert(
    conn: &mut PgConnection,
    table: &TableSchema,
    row: &FieldMap,
    previous: Option<&FieldMap>,
) -> Result<UpsertOutcome, sqlx::Error> {
    let columns: Vec<&str> = table
        .column_names()
        .filter(|column| *column != REFRESHED_AT_COLUMN && row.contains_key(*column))
        .collect();

    let updates: Vec<&str> = table
        .update_on_duplicate
        .iter()
        .map(String::as_str)
        .filter(|column| row.contains_key(*column))
        .collect();

    let statement = upsert_statement(&table.name, &columns, &updates);
    let inserted: Option<bool> = sqlx::query_scalar(&statement)
        .bind(Value::Object(row.clone()))
        .fetch_optional(&mut *conn)
        .await?;

    let outcome = match inserted {
        None => UpsertOutcome::Skipped,
        Some(true) => UpsertOutcome::Inserted,
        Some(false) => UpsertOutcome::Updated {
            corrected: previous
                .map(|previous| differs(previous, row, &updates))
                .unwrap_or(false),
        },
    };

    Ok(outcome)
}

fn differs(previous: &FieldMap, row: &FieldMap, columns: &[&str]) -> bool {
    columns.iter().any(|column| {
        let stored = previous.get(*column).unwrap_or(&Value::Null);
        let fresh = row.get(*column).unwrap_or(&Value::Null);
        !values_equivalent(stored, fresh)
    })
}

fn upsert_statement(table: &TableName, columns: &[&str], updates: &[&str]) -> String {
    let quoted_table = table.as_quoted_identifier();
    let refreshed_at = quote_identifier(REFRESHED_AT_COLUMN);
    let last_block_height = quote_identifier(LAST_BLOCK_HEIGHT_COLUMN);

    let quoted: Vec<String> = columns
        .iter()
        .map(|column| quote_identifier(column).into_owned())
        .collect();
    let selected: Vec<String> = quoted.iter().map(|column| format!("r.{column}")).collect();

    let mut assignments: Vec<String> = updates
        .iter()
        .map(|column| {
            let column = quote_identifier(column);
            format!("{column} = EXCLUDED.{column}")
        })
        .collect();
    assignments.push(format!("{refreshed_at} = EXCLUDED.{refreshed_at}"));
    assignments.push(format!(
        "{last_block_height} = COALESCE(EXCLUDED.{last_block_height}, {quoted_table}.{last_block_height})"
    ));

    format!(
        r#"
INSERT INTO {quoted_table} ({columns}, {refreshed_at})
SELECT {selected}, now() FROM jsonb_populate_record(NULL::{quoted_table}, $1) r
ON CONFLICT ({address}) DO UPDATE SET {assignments}
WHERE EXCLUDED.{last_block_height} IS NULL
   OR {quoted_table}.{last_block_height} IS NULL
   OR EXCLUDED.{last_block_height} >= {quoted_table}.{last_block_height}
RETURNING (xmax = 0)
        "#,
        columns = quoted.join(", "),
        selected = selected.join(", "),
        address = quote_identifier(ADDRESS_COLUMN),
        assignments = assignments.join(", "),
    )
}

pub async fn delete(
    conn: &mut PgConnection,
    table: &TableName,
    address: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE {} = $1",
        table.as_quoted_identifier(),
        quote_identifier(ADDRESS_COLUMN)
    ))
    .bind(address)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Deletes every row the current sweep did not touch.
pub async fn garbage_collect(
    pool: &PgPool,
    table: &TableName,
    refreshed_before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE {} < $1",
        table.as_quoted_identifier(),
        quote_identifier(REFRESHED_AT_COLUMN)
    ))
    .bind(refreshed_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::{ColumnDef, IndexDef};

    fn wallet_table() -> TableSchema {
        TableSchema {
            name: TableName::new("public", "wallets"),
            columns: vec![
                ColumnDef::new("owner", "TEXT"),
                ColumnDef::new("balance", "NUMERIC(40, 0)"),
                ColumnDef::new("blob", "BYTEA"),
                ColumnDef::new("city", "TEXT"),
            ],
            indexes: vec![IndexDef::on(&["refreshed_at"])],
            update_on_duplicate: vec![
                "owner".to_owned(),
                "balance".to_owned(),
                "blob".to_owned(),
            ],
        }
    }

    fn row(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn stored(pool: &PgPool, address: &str) -> FieldMap {
        let mut conn = pool.acquire().await.unwrap();
        fetch_existing(&mut conn, &TableName::new("public", "wallets"), address)
            .await
            .unwrap()
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn inserts_then_updates(db: PgPool) {
        let table = wallet_table();
        table.migrate(&db).await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let first = row(json!({
            "address": "a1",
            "owner": "o1",
            "balance": "18446744073709551615",
            "blob": "\\x0102",
            "city": "Paris",
            "last_block_height": "10"
        }));
        assert_eq!(
            upsert(&mut conn, &table, &first, None).await.unwrap(),
            UpsertOutcome::Inserted
        );

        let previous = fetch_existing(&mut conn, &table.name, "a1").await.unwrap();
        assert_eq!(
            upsert(&mut conn, &table, &first, previous.as_ref())
                .await
                .unwrap(),
            UpsertOutcome::Updated { corrected: false }
        );

        let second = row(json!({
            "address": "a1",
            "owner": "o2",
            "balance": "5",
            "blob": "\\x0102",
            "city": "Berlin",
            "last_block_height": "11"
        }));
        let previous = fetch_existing(&mut conn, &table.name, "a1").await.unwrap();
        assert_eq!(
            upsert(&mut conn, &table, &second, previous.as_ref())
                .await
                .unwrap(),
            UpsertOutcome::Updated { corrected: true }
        );
        drop(conn);

        let stored = stored(&db, "a1").await;
        assert_eq!(stored["owner"], json!("o2"));
        assert_eq!(stored["balance"], json!("5"));
        assert_eq!(stored["blob"], json!("\\x0102"));
        // Not an update column, keeps its first value.
        assert_eq!(stored["city"], json!("Paris"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn older_block_never_overwrites(db: PgPool) {
        let table = wallet_table();
        table.migrate(&db).await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let newer = row(json!({"address": "a2", "owner": "new", "last_block_height": "20"}));
        let older = row(json!({"address": "a2", "owner": "old", "last_block_height": "19"}));

        upsert(&mut conn, &table, &newer, None).await.unwrap();
        assert_eq!(
            upsert(&mut conn, &table, &older, None).await.unwrap(),
            UpsertOutcome::Skipped
        );
        drop(conn);

        assert_eq!(stored(&db, "a2").await["owner"], json!("new"));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn detects_corrections_past_u64(db: PgPool) {
        let table = wallet_table();
        table.migrate(&db).await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let first = row(json!({"address": "a3", "balance": "340282366920938463463374607431768211455"}));
        upsert(&mut conn, &table, &first, None).await.unwrap();

        let previous = fetch_existing(&mut conn, &table.name, "a3").await.unwrap();
        assert_eq!(
            previous.as_ref().unwrap()["balance"],
            json!("340282366920938463463374607431768211455")
        );
        assert_eq!(
            upsert(&mut conn, &table, &first, previous.as_ref())
                .await
                .unwrap(),
            UpsertOutcome::Updated { corrected: false }
        );

        // Differs only past the precision of a float.
        let second = row(json!({"address": "a3", "balance": "340282366920938463463374607431768211454"}));
        let previous = fetch_existing(&mut conn, &table.name, "a3").await.unwrap();
        assert_eq!(
            upsert(&mut conn, &table, &second, previous.as_ref())
                .await
                .unwrap(),
            UpsertOutcome::Updated { corrected: true }
        );
    }

    #[test]
    fn compares_slots_with_the_stored_height() {
        let stored = row(json!({"address": "a4", "last_block_height": "20"}));

        assert!(is_older_than_stored(Some(&stored), Some(19)));
        assert!(!is_older_than_stored(Some(&stored), Some(20)));
        assert!(!is_older_than_stored(Some(&stored), None));
        assert!(!is_older_than_stored(None, Some(1)));

        let unset = row(json!({"address": "a4", "last_block_height": null}));
        assert!(!is_older_than_stored(Some(&unset), Some(1)));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn deletes_and_collects_garbage(db: PgPool) {
        let table = wallet_table();
        table.migrate(&db).await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        upsert(&mut conn, &table, &row(json!({"address": "stale"})), None)
            .await
            .unwrap();
        upsert(&mut conn, &table, &row(json!({"address": "gone"})), None)
            .await
            .unwrap();
        assert!(delete(&mut conn, &table.name, "gone").await.unwrap());
        assert!(!delete(&mut conn, &table.name, "gone").await.unwrap());
        drop(conn);

        let sweep_start: DateTime<Utc> = sqlx::query_scalar("SELECT now()")
            .fetch_one(&db)
            .await
            .unwrap();
        let mut conn = db.acquire().await.unwrap();
        upsert(&mut conn, &table, &row(json!({"address": "fresh"})), None)
            .await
            .unwrap();
        drop(conn);

        let collected = garbage_collect(&db, &table.name, sweep_start).await.unwrap();
        assert_eq!(collected, 1);

        let remaining: Vec<String> = sqlx::query_scalar("SELECT address FROM public.wallets")
            .fetch_all(&db)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["fresh".to_owned()]);
    }
}
