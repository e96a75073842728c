//! # IDL
//!
//! Serde model of the Anchor-style interface description a program publishes.
//! Both the legacy layout (struct inline under `accounts[].type`) and the newer
//! one (account entry with a `discriminator`, struct under `types[]`) are read.
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdlError {
    #[error("failed to read idl at {path}: {error}")]
    Read {
        path: String,
        error: std::io::Error,
    },
    #[error("failed to parse idl at {path}: {error}")]
    Parse {
        path: String,
        error: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Idl {
    #[serde(default)]
    pub accounts: Vec<IdlAccountDef>,
    #[serde(default)]
    pub types: Vec<IdlTypeDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlAccountDef {
    pub name: String,
    #[serde(default)]
    pub discriminator: Option<Vec<u8>>,
    #[serde(rename = "type", default)]
    pub ty: Option<IdlTypeDefTy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlTypeDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IdlTypeDefTy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IdlTypeDefTy {
    Struct {
        #[serde(default)]
        fields: IdlFields,
    },
    Enum {
        variants: Vec<IdlEnumVariant>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdlFields {
    Named(Vec<IdlField>),
    Tuple(Vec<IdlType>),
}

impl Default for IdlFields {
    fn default() -> Self {
        IdlFields::Named(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: IdlType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdlEnumVariant {
    pub name: String,
    #[serde(default)]
    pub fields: Option<IdlFields>,
}

/// A field type. Anything the mirror cannot interpret is kept as `Unknown` so
/// schema mapping can still fall back to an opaque column.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawIdlType")]
pub enum IdlType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    U64,
    I64,
    F64,
    U128,
    I128,
    Bytes,
    String,
    PublicKey,
    Vec(Box<IdlType>),
    Array(Box<IdlType>, usize),
    Option(Box<IdlType>),
    COption(Box<IdlType>),
    Defined(String),
    Unknown(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdlType {
    Primitive(String),
    Vec { vec: Box<IdlType> },
    Array { array: (Box<IdlType>, Value) },
    Option { option: Box<IdlType> },
    COption { coption: Box<IdlType> },
    Defined { defined: DefinedRef },
    Other(Value),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinedRef {
    Name(String),
    Object { name: String },
}

impl From<RawIdlType> for IdlType {
    fn from(raw: RawIdlType) -> Self {
        match raw {
            RawIdlType::Primitive(name) => match name.as_str() {
                "bool" => IdlType::Bool,
                "u8" => IdlType::U8,
                "i8" => IdlType::I8,
                "u16" => IdlType::U16,
                "i16" => IdlType::I16,
                "u32" => IdlType::U32,
                "i32" => IdlType::I32,
                "f32" => IdlType::F32,
                "u64" => IdlType::U64,
                "i64" => IdlType::I64,
                "f64" => IdlType::F64,
                "u128" => IdlType::U128,
                "i128" => IdlType::I128,
                "bytes" => IdlType::Bytes,
                "string" => IdlType::String,
                "publicKey" | "pubkey" => IdlType::PublicKey,
                _ => IdlType::Unknown(name),
            },
            RawIdlType::Vec { vec } => IdlType::Vec(vec),
            RawIdlType::Array { array: (ty, len) } => match len.as_u64() {
                Some(len) => IdlType::Array(ty, len as usize),
                None => IdlType::Unknown(format!("array with length {len}")),
            },
            RawIdlType::Option { option } => IdlType::Option(option),
            RawIdlType::COption { coption } => IdlType::COption(coption),
            RawIdlType::Defined { defined } => match defined {
                DefinedRef::Name(name) | DefinedRef::Object { name } => IdlType::Defined(name),
            },
            RawIdlType::Other(value) => IdlType::Unknown(value.to_string()),
        }
    }
}

impl Idl {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdlError> {
        let path_str = path.as_ref().display().to_string();
        let raw = std::fs::read(path.as_ref()).map_err(|error| IdlError::Read {
            path: path_str.clone(),
            error,
        })?;

        serde_json::from_slice(&raw).map_err(|error| IdlError::Parse {
            path: path_str,
            error,
        })
    }

    pub fn account(&self, name: &str) -> Option<&IdlAccountDef> {
        self.accounts.iter().find(|account| account.name == name)
    }

    pub fn type_def(&self, name: &str) -> Option<&IdlTypeDef> {
        self.types.iter().find(|ty| ty.name == name)
    }

    /// The struct layout of an account, looked up inline first and then among
    /// the named types.
    pub fn account_layout(&self, name: &str) -> Option<&IdlTypeDefTy> {
        let account = self.account(name)?;
        match &account.ty {
            Some(ty) => Some(ty),
            None => self.type_def(name).map(|def| &def.ty),
        }
    }
}
