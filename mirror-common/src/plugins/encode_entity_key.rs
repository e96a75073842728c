use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgConnection;
use tracing::warn;

use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::plugins::{parse_plugin_config, Plugin};
use crate::sanitize::{from_pg_hex, FieldMap};
use crate::schema::{ColumnDef, IndexDef};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncodeEntityKeyConfig {
    pub entity_key_field: String,
    pub key_serialization_field: String,
    pub output_column: String,
}

impl Default for EncodeEntityKeyConfig {
    fn default() -> Self {
        Self {
            entity_key_field: "entity_key".to_owned(),
            key_serialization_field: "key_serialization".to_owned(),
            output_column: "encoded_entity_key".to_owned(),
        }
    }
}

/// Renders a raw entity key as text, base58 or UTF-8 depending on how the
/// account says it was serialized.
#[derive(Debug)]
pub struct EncodeEntityKey {
    config: EncodeEntityKeyConfig,
}

impl EncodeEntityKey {
    pub const NAME: &'static str = "EncodeEntityKey";

    pub fn new(config: EncodeEntityKeyConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Plugin>, ConfigError> {
        Ok(Arc::new(Self::new(parse_plugin_config(Self::NAME, config)?)))
    }

    fn encode(&self, account: &FieldMap) -> Option<String> {
        let raw = account.get(&self.config.entity_key_field)?.as_str()?;
        let bytes = from_pg_hex(raw)?;
        let serialization = account
            .get(&self.config.key_serialization_field)
            .and_then(serialization_tag)
            .unwrap_or_default();

        match serialization.to_ascii_lowercase().as_str() {
            "b58" => Some(bs58::encode(bytes).into_string()),
            _ => match String::from_utf8(bytes) {
                Ok(text) => Some(text),
                Err(_) => {
                    warn!(
                        serialization = %serialization,
                        "entity key is not valid utf-8, leaving it unencoded"
                    );
                    None
                }
            },
        }
    }
}

/// Unit enums sanitize to their tag, anything else keeps its single key.
fn serialization_tag(value: &Value) -> Option<String> {
    match value {
        Value::String(tag) => Some(tag.clone()),
        Value::Object(map) if map.len() == 1 => map.keys().next().cloned(),
        _ => None,
    }
}

#[async_trait]
impl Plugin for EncodeEntityKey {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_columns(&self) -> Vec<ColumnDef> {
        vec![ColumnDef::new(&self.config.output_column, "TEXT")]
    }

    fn add_indexes(&self) -> Vec<IndexDef> {
        vec![IndexDef::on(&[self.config.output_column.as_str()])]
    }

    fn update_on_duplicate_fields(&self) -> Vec<String> {
        vec![self.config.output_column.clone()]
    }

    async fn process_account(
        &self,
        mut account: FieldMap,
        _previous: Option<&FieldMap>,
        _txn: &mut PgConnection,
        _block_height: Option<u64>,
    ) -> Result<FieldMap, PipelineError> {
        let encoded = self.encode(&account).map(Value::String).unwrap_or(Value::Null);
        account.insert(self.config.output_column.clone(), encoded);
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sanitize::to_pg_hex;

    fn account(key: &[u8], serialization: Value) -> FieldMap {
        let Value::Object(map) = json!({
            "entity_key": to_pg_hex(key),
            "key_serialization": serialization,
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn encodes_by_serialization() {
        let plugin = EncodeEntityKey::new(EncodeEntityKeyConfig::default());

        assert_eq!(
            plugin.encode(&account(b"hotspot-1", json!("utf8"))),
            Some("hotspot-1".to_owned())
        );
        assert_eq!(
            plugin.encode(&account(&[0, 0, 1], json!("b58"))),
            Some(bs58::encode([0u8, 0, 1]).into_string())
        );
        assert_eq!(plugin.encode(&account(&[0xff, 0xfe], json!("utf8"))), None);
    }

    #[test]
    fn missing_key_yields_none() {
        let plugin = EncodeEntityKey::new(EncodeEntityKeyConfig::default());
        assert_eq!(plugin.encode(&FieldMap::new()), None);
    }
}
