//! Borsh decoding of account data against an IDL layout.
use std::sync::Arc;

use bytes::Buf;
use thiserror::Error;

use crate::idl::{Idl, IdlFields, IdlType, IdlTypeDefTy};

/// Accounts without an explicit discriminator in the IDL are still prefixed by
/// one this long.
pub const DEFAULT_DISCRIMINATOR_LEN: usize = 8;

const MAX_DEPTH: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("account type {0} is not declared in the idl")]
    MissingAccount(String),
    #[error("data does not start with the account discriminator")]
    DiscriminatorMismatch,
    #[error("needed {needed} more bytes but only {remaining} remain")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid option tag {0}")]
    InvalidOptionTag(u32),
    #[error("variant {index} out of range for enum {name}")]
    VariantOutOfRange { name: String, index: u8 },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("type {0} is not defined in the idl")]
    UnresolvedType(String),
    #[error("type {0} cannot be decoded")]
    UnsupportedType(String),
    #[error("type nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("vector of {len} elements is longer than the {remaining} bytes left")]
    LengthExceedsData { len: usize, remaining: usize },
}

/// Decoded value tree, kept close to the wire types so the sanitizer can
/// decide on representations by width.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Bool(bool),
    Unsigned { value: u128, bits: u8 },
    Signed { value: i128, bits: u8 },
    Float(f64),
    String(String),
    PublicKey([u8; 32]),
    Bytes(Vec<u8>),
    Array(Vec<Decoded>),
    Option(Option<Box<Decoded>>),
    Struct(Vec<(String, Decoded)>),
    Tuple(Vec<Decoded>),
    Enum {
        variant: String,
        fields: Option<Box<Decoded>>,
    },
}

/// Decoder for one account type of one program.
#[derive(Debug, Clone)]
pub struct AccountDecoder {
    idl: Arc<Idl>,
    account_type: String,
    discriminator: Option<Vec<u8>>,
}

impl AccountDecoder {
    pub fn new(idl: Arc<Idl>, account_type: &str) -> Result<Self, DecodeError> {
        let account = idl
            .account(account_type)
            .ok_or_else(|| DecodeError::MissingAccount(account_type.to_owned()))?;
        let discriminator = account.discriminator.clone();

        if idl.account_layout(account_type).is_none() {
            return Err(DecodeError::UnresolvedType(account_type.to_owned()));
        }

        Ok(Self {
            idl,
            account_type: account_type.to_owned(),
            discriminator,
        })
    }

    pub fn account_type(&self) -> &str {
        &self.account_type
    }

    pub fn decode(&self, data: &[u8]) -> Result<Decoded, DecodeError> {
        let mut buf = match &self.discriminator {
            Some(discriminator) => {
                if !data.starts_with(discriminator) {
                    return Err(DecodeError::DiscriminatorMismatch);
                }
                &data[discriminator.len()..]
            }
            None => {
                ensure(data, DEFAULT_DISCRIMINATOR_LEN)?;
                &data[DEFAULT_DISCRIMINATOR_LEN..]
            }
        };

        let layout = self
            .idl
            .account_layout(&self.account_type)
            .ok_or_else(|| DecodeError::UnresolvedType(self.account_type.clone()))?;

        self.decode_type_def(&self.account_type, layout, &mut buf, 0)
    }

    fn decode_type_def(
        &self,
        name: &str,
        def: &IdlTypeDefTy,
        buf: &mut &[u8],
        depth: usize,
    ) -> Result<Decoded, DecodeError> {
        match def {
            IdlTypeDefTy::Struct { fields } => self.decode_fields(fields, buf, depth),
            IdlTypeDefTy::Enum { variants } => {
                ensure(buf, 1)?;
                let index = buf.get_u8();
                let variant =
                    variants
                        .get(index as usize)
                        .ok_or_else(|| DecodeError::VariantOutOfRange {
                            name: name.to_owned(),
                            index,
                        })?;

                let fields = match &variant.fields {
                    Some(fields) => Some(Box::new(self.decode_fields(fields, buf, depth)?)),
                    None => None,
                };

                Ok(Decoded::Enum {
                    variant: variant.name.clone(),
                    fields,
                })
            }
        }
    }

    fn decode_fields(
        &self,
        fields: &IdlFields,
        buf: &mut &[u8],
        depth: usize,
    ) -> Result<Decoded, DecodeError> {
        match fields {
            IdlFields::Named(fields) => {
                let mut decoded = Vec::with_capacity(fields.len());
                for field in fields {
                    decoded.push((field.name.clone(), self.decode_type(&field.ty, buf, depth)?));
                }
                Ok(Decoded::Struct(decoded))
            }
            IdlFields::Tuple(types) => {
                let mut decoded = Vec::with_capacity(types.len());
                for ty in types {
                    decoded.push(self.decode_type(ty, buf, depth)?);
                }
                Ok(Decoded::Tuple(decoded))
            }
        }
    }

    fn decode_type(
        &self,
        ty: &IdlType,
        buf: &mut &[u8],
        depth: usize,
    ) -> Result<Decoded, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }

        let decoded = match ty {
            IdlType::Bool => {
                ensure(buf, 1)?;
                match buf.get_u8() {
                    0 => Decoded::Bool(false),
                    1 => Decoded::Bool(true),
                    other => return Err(DecodeError::InvalidBool(other)),
                }
            }
            IdlType::U8 => {
                ensure(buf, 1)?;
                unsigned(buf.get_u8().into(), 8)
            }
            IdlType::I8 => {
                ensure(buf, 1)?;
                signed(buf.get_i8().into(), 8)
            }
            IdlType::U16 => {
                ensure(buf, 2)?;
                unsigned(buf.get_u16_le().into(), 16)
            }
            IdlType::I16 => {
                ensure(buf, 2)?;
                signed(buf.get_i16_le().into(), 16)
            }
            IdlType::U32 => {
                ensure(buf, 4)?;
                unsigned(buf.get_u32_le().into(), 32)
            }
            IdlType::I32 => {
                ensure(buf, 4)?;
                signed(buf.get_i32_le().into(), 32)
            }
            IdlType::U64 => {
                ensure(buf, 8)?;
                unsigned(buf.get_u64_le().into(), 64)
            }
            IdlType::I64 => {
                ensure(buf, 8)?;
                signed(buf.get_i64_le().into(), 64)
            }
            IdlType::U128 => {
                ensure(buf, 16)?;
                unsigned(buf.get_u128_le(), 128)
            }
            IdlType::I128 => {
                ensure(buf, 16)?;
                signed(buf.get_i128_le(), 128)
            }
            IdlType::F32 => {
                ensure(buf, 4)?;
                Decoded::Float(buf.get_f32_le().into())
            }
            IdlType::F64 => {
                ensure(buf, 8)?;
                Decoded::Float(buf.get_f64_le())
            }
            IdlType::PublicKey => {
                ensure(buf, 32)?;
                let mut key = [0u8; 32];
                buf.copy_to_slice(&mut key);
                Decoded::PublicKey(key)
            }
            IdlType::Bytes => Decoded::Bytes(read_len_prefixed(buf)?),
            IdlType::String => {
                let raw = read_len_prefixed(buf)?;
                Decoded::String(String::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?)
            }
            IdlType::Vec(inner) => {
                ensure(buf, 4)?;
                let len = buf.get_u32_le() as usize;
                if **inner == IdlType::U8 {
                    ensure(buf, len)?;
                    Decoded::Bytes(take(buf, len))
                } else {
                    // Every element takes at least a byte, zero sized ones are
                    // not valid borsh.
                    if len > buf.len() {
                        return Err(DecodeError::LengthExceedsData {
                            len,
                            remaining: buf.len(),
                        });
                    }
                    self.decode_sequence(inner, len, buf, depth)?
                }
            }
            IdlType::Array(inner, len) => {
                if **inner == IdlType::U8 {
                    ensure(buf, *len)?;
                    Decoded::Bytes(take(buf, *len))
                } else {
                    self.decode_sequence(inner, *len, buf, depth)?
                }
            }
            IdlType::Option(inner) => {
                ensure(buf, 1)?;
                match buf.get_u8() {
                    0 => Decoded::Option(None),
                    1 => Decoded::Option(Some(Box::new(self.decode_type(inner, buf, depth + 1)?))),
                    other => return Err(DecodeError::InvalidOptionTag(other.into())),
                }
            }
            IdlType::COption(inner) => {
                ensure(buf, 4)?;
                match buf.get_u32_le() {
                    0 => Decoded::Option(None),
                    1 => Decoded::Option(Some(Box::new(self.decode_type(inner, buf, depth + 1)?))),
                    other => return Err(DecodeError::InvalidOptionTag(other)),
                }
            }
            IdlType::Defined(name) => {
                let def = self
                    .idl
                    .type_def(name)
                    .ok_or_else(|| DecodeError::UnresolvedType(name.clone()))?;
                self.decode_type_def(name, &def.ty, buf, depth + 1)?
            }
            IdlType::Unknown(name) => return Err(DecodeError::UnsupportedType(name.clone())),
        };

        Ok(decoded)
    }

    fn decode_sequence(
        &self,
        inner: &IdlType,
        len: usize,
        buf: &mut &[u8],
        depth: usize,
    ) -> Result<Decoded, DecodeError> {
        let mut items = Vec::with_capacity(len.min(buf.len()));
        for _ in 0..len {
            items.push(self.decode_type(inner, buf, depth + 1)?);
        }
        Ok(Decoded::Array(items))
    }
}

fn unsigned(value: u128, bits: u8) -> Decoded {
    Decoded::Unsigned { value, bits }
}

fn signed(value: i128, bits: u8) -> Decoded {
    Decoded::Signed { value, bits }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::UnexpectedEnd {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

fn take(buf: &mut &[u8], len: usize) -> Vec<u8> {
    let out = buf[..len].to_vec();
    buf.advance(len);
    out
}

fn read_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    ensure(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure(buf, len)?;
    Ok(take(buf, len))
}
