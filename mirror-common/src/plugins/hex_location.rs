use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_cache::sync::Cache;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgConnection;
use tracing::warn;

use crate::config::ConfigError;
use crate::metrics_consts::GEOCODE_LOOKUPS;
use crate::pipeline::PipelineError;
use crate::plugins::{parse_plugin_config, Plugin};
use crate::sanitize::FieldMap;
use crate::schema::ColumnDef;

const LOCATION_COLUMNS: [&str; 4] = ["street", "city", "state", "country"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractHexLocationConfig {
    /// Reverse-geocoding endpoint, the hex cell is appended as a path segment.
    pub url: String,
    #[serde(default = "default_location_field")]
    pub location_field: String,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_location_field() -> String {
    "location".to_owned()
}

fn default_cache_capacity() -> usize {
    50_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

impl Location {
    fn into_fields(self) -> [(&'static str, Option<String>); 4] {
        [
            ("street", self.street),
            ("city", self.city),
            ("state", self.state),
            ("country", self.country),
        ]
    }
}

/// Adds a street-level address for an H3 cell. Lookups happen only for rows
/// that do not exist yet, since the columns are never rewritten afterwards.
pub struct ExtractHexLocation {
    config: ExtractHexLocationConfig,
    client: reqwest::Client,
    cache: Cache<String, Location>,
}

impl std::fmt::Debug for ExtractHexLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractHexLocation")
            .field("config", &self.config)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ExtractHexLocation {
    pub const NAME: &'static str = "ExtractHexLocation";

    pub fn new(config: ExtractHexLocationConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        let cache = Cache::new(config.cache_capacity);

        Ok(Self {
            config,
            client,
            cache,
        })
    }

    pub fn from_config(config: &Value) -> Result<Arc<dyn Plugin>, ConfigError> {
        let config = parse_plugin_config(Self::NAME, config)?;
        let plugin = Self::new(config).map_err(|error| ConfigError::InvalidPlugin {
            plugin: Self::NAME.to_owned(),
            reason: error.to_string(),
        })?;
        Ok(Arc::new(plugin))
    }

    /// Resolves a cell, returning `None` on any failure.
    pub async fn lookup(&self, hex: &str) -> Option<Location> {
        if let Some(location) = self.cache.get(hex) {
            metrics::counter!(GEOCODE_LOOKUPS, "result" => "cached").increment(1);
            return Some(location);
        }

        let url = format!("{}/{}", self.config.url.trim_end_matches('/'), hex);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        let location = match response {
            Ok(response) => response.json::<Location>().await,
            Err(error) => Err(error),
        };

        match location {
            Ok(location) => {
                metrics::counter!(GEOCODE_LOOKUPS, "result" => "fetched").increment(1);
                self.cache.insert(hex.to_owned(), location.clone());
                Some(location)
            }
            Err(error) => {
                metrics::counter!(GEOCODE_LOOKUPS, "result" => "failed").increment(1);
                warn!(hex = %hex, "reverse geocoding failed: {}", error);
                None
            }
        }
    }
}

/// H3 cells are u64s, so they arrive as decimal text or as a JSON number.
fn location_hex(value: &Value) -> Option<String> {
    let cell = match value {
        Value::String(text) => text.parse::<u64>().ok()?,
        Value::Number(number) => number.as_u64()?,
        _ => return None,
    };
    Some(format!("{cell:x}"))
}

#[async_trait]
impl Plugin for ExtractHexLocation {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_columns(&self) -> Vec<ColumnDef> {
        LOCATION_COLUMNS
            .iter()
            .map(|name| ColumnDef::new(name, "TEXT"))
            .collect()
    }

    async fn process_account(
        &self,
        mut account: FieldMap,
        previous: Option<&FieldMap>,
        _txn: &mut PgConnection,
        _block_height: Option<u64>,
    ) -> Result<FieldMap, PipelineError> {
        if previous.is_some() {
            return Ok(account);
        }

        let location = match account
            .get(&self.config.location_field)
            .and_then(location_hex)
        {
            Some(hex) => self.lookup(&hex).await.unwrap_or_default(),
            None => Location::default(),
        };

        for (column, value) in location.into_fields() {
            account.insert(
                column.to_owned(),
                value.map(Value::String).unwrap_or(Value::Null),
            );
        }

        Ok(account)
    }
}
