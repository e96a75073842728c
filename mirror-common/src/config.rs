//! The operator's configuration document: which programs to mirror, which of
//! their account types land in which tables, and which plugins run on them.
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::idl::IdlError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration document {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse configuration document {path}: {error}")]
    Parse {
        path: String,
        error: serde_json::Error,
    },
    #[error(transparent)]
    Idl(#[from] IdlError),
    #[error("account type {account_type} is not declared in the idl of program {program_id}")]
    MissingAccount {
        program_id: String,
        account_type: String,
    },
    #[error("table {0} is mapped more than once")]
    DuplicateTable(String),
    #[error("unknown plugin {0}")]
    UnknownPlugin(String),
    #[error("invalid configuration for plugin {plugin}: {reason}")]
    InvalidPlugin { plugin: String, reason: String },
    #[error("invalid cron schedule {schedule} for job {name}: {reason}")]
    InvalidSchedule {
        name: String,
        schedule: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    pub configs: Vec<ProgramConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramConfig {
    pub program_id: String,
    pub idl_path: String,
    pub accounts: Vec<AccountEntry>,
    #[serde(default)]
    pub cron_jobs: Vec<CronJobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountEntry {
    #[serde(rename = "type")]
    pub account_type: String,
    pub table: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

fn default_schema() -> String {
    "public".to_owned()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CronJobKind {
    Refresh,
    IntegrityCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CronJobConfig {
    pub name: CronJobKind,
    pub schedule: String,
}

/// One account type of one program, flattened out of the document.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountTypeConfig {
    pub program_id: String,
    pub account_type: String,
    pub table_name: String,
    pub schema_name: String,
    pub plugins: Vec<PluginConfig>,
    pub cron_jobs: Vec<CronJobConfig>,
}

impl ConfigDocument {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let raw = std::fs::read(path.as_ref()).map_err(|error| ConfigError::Read {
            path: path_str.clone(),
            error,
        })?;

        Self::parse(&raw).map_err(|error| ConfigError::Parse {
            path: path_str,
            error,
        })
    }

    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Flattens the document in operator order, rejecting two account types
    /// that would share one table.
    pub fn account_types(&self) -> Result<Vec<AccountTypeConfig>, ConfigError> {
        let mut seen = HashSet::new();
        let mut flattened = Vec::new();

        for program in &self.configs {
            for account in &program.accounts {
                let qualified = format!("{}.{}", account.schema, account.table);
                if !seen.insert(qualified.clone()) {
                    return Err(ConfigError::DuplicateTable(qualified));
                }

                flattened.push(AccountTypeConfig {
                    program_id: program.program_id.clone(),
                    account_type: account.account_type.clone(),
                    table_name: account.table.clone(),
                    schema_name: account.schema.clone(),
                    plugins: account.plugins.clone(),
                    cron_jobs: program.cron_jobs.clone(),
                });
            }
        }

        Ok(flattened)
    }
}
