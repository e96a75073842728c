//! # SchemaRegistry
//!
//! Maps the configured account types onto Postgres tables, owns the decoders
//! and plugin chains for them, and creates or widens those tables on startup.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use pg_escape::quote_identifier;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{AccountTypeConfig, ConfigDocument, ConfigError, CronJobConfig};
use crate::decoder::{AccountDecoder, DecodeError, Decoded};
use crate::idl::{Idl, IdlFields, IdlType, IdlTypeDefTy};
use crate::plugins::{build_plugin, Plugin};
use crate::sanitize::to_snake_case;

/// Postgres truncates identifiers past this length.
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("failed to migrate table {table}: {error}")]
    Migrate { table: String, error: sqlx::Error },
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            schema: schema.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Parses `schema.table`, defaulting to the `public` schema.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", qualified),
        }
    }

    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_owned(),
            sql_type: sql_type.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub columns: Vec<String>,
}

impl IndexDef {
    pub fn on(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
        }
    }

    fn name_for(&self, table: &TableName) -> String {
        let mut name = format!("{}_{}_idx", table.name, self.columns.join("_"));
        name.truncate(MAX_IDENTIFIER_LEN);
        name
    }
}

/// Columns every mirrored table carries regardless of its IDL.
pub const ADDRESS_COLUMN: &str = "address";
pub const REFRESHED_AT_COLUMN: &str = "refreshed_at";
pub const LAST_BLOCK_HEIGHT_COLUMN: &str = "last_block_height";

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: TableName,
    /// Data columns, excluding the fixed ones.
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    /// Data columns overwritten when a row already exists.
    pub update_on_duplicate: Vec<String>,
}

impl TableSchema {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        [ADDRESS_COLUMN, REFRESHED_AT_COLUMN, LAST_BLOCK_HEIGHT_COLUMN]
            .into_iter()
            .chain(self.columns.iter().map(|c| c.name.as_str()))
    }

    fn create_table_statement(&self) -> String {
        let mut definitions = vec![
            format!("{} TEXT PRIMARY KEY", quote_identifier(ADDRESS_COLUMN)),
            format!(
                "{} TIMESTAMPTZ NOT NULL DEFAULT now()",
                quote_identifier(REFRESHED_AT_COLUMN)
            ),
            format!(
                "{} NUMERIC(40, 0)",
                quote_identifier(LAST_BLOCK_HEIGHT_COLUMN)
            ),
        ];
        definitions.extend(
            self.columns
                .iter()
                .map(|c| format!("{} {}", quote_identifier(&c.name), c.sql_type)),
        );

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name.as_quoted_identifier(),
            definitions.join(", ")
        )
    }

    /// Creates the table when missing and adds any column the catalog lacks.
    /// Never drops anything.
    pub async fn migrate(&self, pool: &PgPool) -> Result<(), SchemaError> {
        let err = |error| SchemaError::Migrate {
            table: self.name.to_string(),
            error,
        };

        let mut txn = pool.begin().await.map_err(err)?;

        // Serializes concurrent starts; IF NOT EXISTS alone still races on the catalog.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('account-mirror-migrate'))")
            .execute(&mut *txn)
            .await
            .map_err(err)?;

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_identifier(&self.name.schema)
        ))
        .execute(&mut *txn)
        .await
        .map_err(err)?;

        sqlx::query(&self.create_table_statement())
            .execute(&mut *txn)
            .await
            .map_err(err)?;

        let existing: HashSet<String> = sqlx::query_scalar(
            r#"
SELECT column_name::text FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
            "#,
        )
        .bind(&self.name.schema)
        .bind(&self.name.name)
        .fetch_all(&mut *txn)
        .await
        .map_err(err)?
        .into_iter()
        .collect();

        for column in self
            .columns
            .iter()
            .filter(|c| !existing.contains(&c.name))
        {
            info!(table = %self.name, column = %column.name, "adding missing column");
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                self.name.as_quoted_identifier(),
                quote_identifier(&column.name),
                column.sql_type
            ))
            .execute(&mut *txn)
            .await
            .map_err(err)?;
        }

        for index in &self.indexes {
            let columns: Vec<_> = index
                .columns
                .iter()
                .map(|c| quote_identifier(c).into_owned())
                .collect();
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_identifier(&index.name_for(&self.name)),
                self.name.as_quoted_identifier(),
                columns.join(", ")
            ))
            .execute(&mut *txn)
            .await
            .map_err(err)?;
        }

        txn.commit().await.map_err(err)?;
        debug!(table = %self.name, "table migrated");

        Ok(())
    }
}

/// Maps one IDL field type onto a column type.
pub fn column_type(ty: &IdlType) -> String {
    match ty {
        IdlType::Option(inner) | IdlType::COption(inner) => column_type(inner),
        IdlType::Vec(inner) | IdlType::Array(inner, _) => match inner.as_ref() {
            IdlType::U8 => "BYTEA".to_owned(),
            inner if is_primitive(inner) => format!("{}[]", column_type(inner)),
            _ => "JSONB".to_owned(),
        },
        other => primitive_column_type(other).unwrap_or("JSONB").to_owned(),
    }
}

fn primitive_column_type(ty: &IdlType) -> Option<&'static str> {
    let sql_type = match ty {
        IdlType::Bool => "BOOLEAN",
        IdlType::U8 | IdlType::I8 | IdlType::U16 | IdlType::I16 | IdlType::I32 => "INTEGER",
        IdlType::U32 => "BIGINT",
        IdlType::U64 | IdlType::I64 | IdlType::U128 | IdlType::I128 => "NUMERIC(40, 0)",
        IdlType::F32 | IdlType::F64 => "DOUBLE PRECISION",
        IdlType::String | IdlType::PublicKey => "TEXT",
        IdlType::Bytes => "BYTEA",
        _ => return None,
    };
    Some(sql_type)
}

fn is_primitive(ty: &IdlType) -> bool {
    primitive_column_type(ty).is_some()
}

/// Columns for the top-level fields of an account layout. Tuple layouts and
/// enums have no named fields and map to nothing.
pub fn idl_columns(layout: &IdlTypeDefTy) -> Vec<ColumnDef> {
    match layout {
        IdlTypeDefTy::Struct {
            fields: IdlFields::Named(fields),
        } => fields
            .iter()
            .map(|field| ColumnDef {
                name: to_snake_case(&field.name),
                sql_type: column_type(&field.ty),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// A configured account type, ready to decode and write.
#[derive(Debug)]
pub struct RegisteredAccount {
    pub config: AccountTypeConfig,
    pub decoder: AccountDecoder,
    pub table: TableSchema,
    pub plugins: Vec<Arc<dyn Plugin>>,
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    programs: HashMap<String, Vec<Arc<RegisteredAccount>>>,
    program_order: Vec<String>,
    cron_jobs: HashMap<String, Vec<CronJobConfig>>,
}

impl SchemaRegistry {
    /// Reads every IDL the document references and builds the registry.
    pub fn load(document: &ConfigDocument) -> Result<Self, ConfigError> {
        let mut idls = HashMap::new();
        for program in &document.configs {
            let idl = Idl::load(&program.idl_path)?;
            idls.insert(program.program_id.clone(), Arc::new(idl));
        }

        Self::build(document, &idls)
    }

    pub fn build(
        document: &ConfigDocument,
        idls: &HashMap<String, Arc<Idl>>,
    ) -> Result<Self, ConfigError> {
        let mut registry = SchemaRegistry::default();

        for program in &document.configs {
            registry
                .cron_jobs
                .insert(program.program_id.clone(), program.cron_jobs.clone());
        }

        for config in document.account_types()? {
            let missing = || ConfigError::MissingAccount {
                program_id: config.program_id.clone(),
                account_type: config.account_type.clone(),
            };

            let idl = idls.get(&config.program_id).ok_or_else(missing)?;
            let layout = idl.account_layout(&config.account_type).ok_or_else(missing)?;
            let decoder = AccountDecoder::new(idl.clone(), &config.account_type).map_err(
                |error| match error {
                    DecodeError::MissingAccount(_) | DecodeError::UnresolvedType(_) => missing(),
                    other => ConfigError::InvalidPlugin {
                        plugin: config.account_type.clone(),
                        reason: other.to_string(),
                    },
                },
            )?;

            let plugins = config
                .plugins
                .iter()
                .map(build_plugin)
                .collect::<Result<Vec<_>, _>>()?;

            let table = table_schema(&config, layout, &plugins);

            if !registry.programs.contains_key(&config.program_id) {
                registry.program_order.push(config.program_id.clone());
            }
            registry
                .programs
                .entry(config.program_id.clone())
                .or_default()
                .push(Arc::new(RegisteredAccount {
                    config,
                    decoder,
                    table,
                    plugins,
                }));
        }

        Ok(registry)
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.program_order.iter().map(String::as_str)
    }

    pub fn is_tracked(&self, program_id: &str) -> bool {
        self.programs.contains_key(program_id)
    }

    /// Account types of a program, in configuration order.
    pub fn accounts_for_program(&self, program_id: &str) -> &[Arc<RegisteredAccount>] {
        self.programs
            .get(program_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn table_for(&self, program_id: &str, account_type: &str) -> Option<&TableSchema> {
        self.accounts_for_program(program_id)
            .iter()
            .find(|account| account.config.account_type == account_type)
            .map(|account| &account.table)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Arc<RegisteredAccount>> {
        self.program_order
            .iter()
            .flat_map(|program| self.accounts_for_program(program))
    }

    pub fn cron_jobs(&self) -> impl Iterator<Item = (&str, &CronJobConfig)> {
        self.program_order.iter().flat_map(|program| {
            self.cron_jobs
                .get(program)
                .into_iter()
                .flatten()
                .map(move |job| (program.as_str(), job))
        })
    }

    /// Tries every account type of the program in configuration order and
    /// returns the first that decodes.
    pub fn decode(
        &self,
        program_id: &str,
        data: &[u8],
    ) -> Option<(Arc<RegisteredAccount>, Decoded)> {
        self.accounts_for_program(program_id)
            .iter()
            .find_map(|account| match account.decoder.decode(data) {
                Ok(decoded) => Some((account.clone(), decoded)),
                Err(error) => {
                    debug!(
                        program = program_id,
                        account_type = %account.config.account_type,
                        "trial decode failed: {}",
                        error
                    );
                    None
                }
            })
    }

    pub async fn migrate(&self, pool: &PgPool) -> Result<(), SchemaError> {
        for account in self.accounts() {
            account.table.migrate(pool).await?;
        }
        Ok(())
    }
}

fn table_schema(
    config: &AccountTypeConfig,
    layout: &IdlTypeDefTy,
    plugins: &[Arc<dyn Plugin>],
) -> TableSchema {
    let mut columns = idl_columns(layout);
    let mut update_on_duplicate: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    let mut indexes = vec![IndexDef::on(&[REFRESHED_AT_COLUMN])];

    for plugin in plugins {
        for column in plugin.add_columns() {
            if !columns.iter().any(|c| c.name == column.name) {
                columns.push(column);
            }
        }
        indexes.extend(plugin.add_indexes());
        for field in plugin.update_on_duplicate_fields() {
            if !update_on_duplicate.contains(&field) {
                update_on_duplicate.push(field);
            }
        }
    }

    TableSchema {
        name: TableName::new(&config.schema_name, &config.table_name),
        columns,
        indexes,
        update_on_duplicate,
    }
}
