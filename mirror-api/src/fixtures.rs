//! Shared test setup: one program with a single `Counter` account type.
use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use mirror_common::config::ConfigDocument;
use mirror_common::idl::Idl;
use mirror_common::pipeline::SharedRegistry;
use mirror_common::schema::SchemaRegistry;
use serde_json::{json, Value};
use sqlx::PgPool;

pub const PROGRAM: &str = "CounterProgram1111111111111111111111111111";
pub const DISCRIMINATOR: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
const AUTHORITY: [u8; 32] = [7; 32];

pub fn registry() -> SchemaRegistry {
    let idl: Idl = serde_json::from_value(json!({
        "accounts": [{"name": "Counter", "discriminator": DISCRIMINATOR}],
        "types": [{
            "name": "Counter",
            "type": {"kind": "struct", "fields": [
                {"name": "authority", "type": "publicKey"},
                {"name": "count", "type": "u64"}
            ]}
        }]
    }))
    .unwrap();
    let document: ConfigDocument = serde_json::from_value(json!({
        "configs": [{
            "programId": PROGRAM,
            "idlPath": "unused",
            "accounts": [{"type": "Counter", "table": "counters"}],
            "cronJobs": [{"name": "refresh", "schedule": "0 */5 * * * *"}]
        }]
    }))
    .unwrap();

    SchemaRegistry::build(&document, &HashMap::from([(PROGRAM.to_owned(), Arc::new(idl))]))
        .unwrap()
}

pub async fn migrated_registry(db: &PgPool) -> SharedRegistry {
    let registry = registry();
    registry.migrate(db).await.unwrap();
    SharedRegistry::new(registry)
}

pub fn counter_bytes(count: u64) -> Vec<u8> {
    let mut data = DISCRIMINATOR.to_vec();
    data.extend_from_slice(&AUTHORITY);
    data.extend_from_slice(&count.to_le_bytes());
    data
}

/// Authority every fixture counter carries, as stored in the table.
pub fn authority() -> String {
    bs58::encode(AUTHORITY).into_string()
}

pub fn counter_base64(count: u64) -> String {
    base64::engine::general_purpose::STANDARD.encode(counter_bytes(count))
}

/// Raw account the way the chain RPC returns it.
pub fn rpc_account(count: u64) -> Value {
    json!({
        "owner": PROGRAM,
        "lamports": 1_000_000,
        "data": [counter_base64(count), "base64"],
        "executable": false
    })
}

pub async fn stored_count(db: &PgPool, address: &str) -> Option<String> {
    sqlx::query_scalar("SELECT count::text FROM public.counters WHERE address = $1")
        .bind(address)
        .fetch_optional(db)
        .await
        .unwrap()
}
