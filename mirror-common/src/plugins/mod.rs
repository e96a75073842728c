//! Per-table hooks run between sanitizing an account and writing it.
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgConnection;

use crate::config::{ConfigError, PluginConfig};
use crate::pipeline::PipelineError;
use crate::sanitize::FieldMap;
use crate::schema::{ColumnDef, IndexDef};

pub mod encode_entity_key;
pub mod explode_ownership;
pub mod hex_location;

pub use encode_entity_key::EncodeEntityKey;
pub use explode_ownership::ExplodeRecipientDestinationOwnership;
pub use hex_location::ExtractHexLocation;

#[async_trait]
pub trait Plugin: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn add_columns(&self) -> Vec<ColumnDef> {
        Vec::new()
    }

    fn add_indexes(&self) -> Vec<IndexDef> {
        Vec::new()
    }

    /// Plugin columns that are rewritten when the row already exists. Plugin
    /// columns not listed here keep whatever was first written.
    fn update_on_duplicate_fields(&self) -> Vec<String> {
        Vec::new()
    }

    /// Receives the output of the previous plugin, including `address`, and
    /// the currently stored row if there is one.
    async fn process_account(
        &self,
        account: FieldMap,
        previous: Option<&FieldMap>,
        txn: &mut PgConnection,
        block_height: Option<u64>,
    ) -> Result<FieldMap, PipelineError>;
}

type PluginFactory = fn(&Value) -> Result<Arc<dyn Plugin>, ConfigError>;

const PLUGINS: &[(&str, PluginFactory)] = &[
    (
        ExplodeRecipientDestinationOwnership::NAME,
        ExplodeRecipientDestinationOwnership::from_config,
    ),
    (EncodeEntityKey::NAME, EncodeEntityKey::from_config),
    (ExtractHexLocation::NAME, ExtractHexLocation::from_config),
];

pub fn build_plugin(config: &PluginConfig) -> Result<Arc<dyn Plugin>, ConfigError> {
    let (_, factory) = PLUGINS
        .iter()
        .find(|(name, _)| *name == config.plugin_type)
        .ok_or_else(|| ConfigError::UnknownPlugin(config.plugin_type.clone()))?;

    factory(&config.config)
}

/// Parses a plugin's `config` object, treating a missing one as empty.
pub(crate) fn parse_plugin_config<T: serde::de::DeserializeOwned>(
    plugin: &str,
    config: &Value,
) -> Result<T, ConfigError> {
    let config = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    serde_json::from_value(config).map_err(|error| ConfigError::InvalidPlugin {
        plugin: plugin.to_owned(),
        reason: error.to_string(),
    })
}

/// Runs the plugin chain in order, each plugin seeing the previous one's output.
pub async fn run_plugins(
    plugins: &[Arc<dyn Plugin>],
    mut account: FieldMap,
    previous: Option<&FieldMap>,
    txn: &mut PgConnection,
    block_height: Option<u64>,
) -> Result<FieldMap, PipelineError> {
    for plugin in plugins {
        account = plugin
            .process_account(account, previous, &mut *txn, block_height)
            .await?;
    }
    Ok(account)
}
