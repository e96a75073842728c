//! Minimal JSON-RPC client for the chain node.
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::metrics_consts::RPC_REQUESTS;

/// `getMultipleAccounts` rejects more keys than this per call.
pub const MAX_MULTIPLE_ACCOUNTS: usize = 100;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcAccount {
    pub pubkey: String,
    pub owner: String,
    pub lamports: u64,
    pub data: Vec<u8>,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Deserialize)]
struct RawAccount {
    owner: String,
    lamports: u64,
    /// `[payload, encoding]`
    data: (String, String),
}

#[derive(Deserialize)]
struct RawKeyedAccount {
    pubkey: String,
    account: RawAccount,
}

impl RawAccount {
    fn into_account(self, pubkey: String) -> Result<RpcAccount, RpcError> {
        let (payload, encoding) = self.data;
        if encoding != "base64" {
            return Err(RpcError::InvalidResponse(format!(
                "unexpected account encoding {encoding}"
            )));
        }
        let data = base64::engine::general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|error| RpcError::InvalidResponse(error.to_string()))?;

        Ok(RpcAccount {
            pubkey,
            owner: self.owner,
            lamports: self.lamports,
            data,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChainClient {
    client: reqwest::Client,
    url: String,
    commitment: String,
}

impl ChainClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.to_owned(),
            commitment: "confirmed".to_owned(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, RpcError> {
        metrics::counter!(RPC_REQUESTS, "method" => method).increment(1);

        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        response
            .result
            .ok_or_else(|| RpcError::InvalidResponse(format!("{method} returned no result")))
    }

    pub async fn get_slot(&self) -> Result<u64, RpcError> {
        self.call("getSlot", json!([{"commitment": self.commitment}]))
            .await
    }

    pub async fn get_program_accounts(&self, program_id: &str) -> Result<Vec<RpcAccount>, RpcError> {
        let accounts: Vec<RawKeyedAccount> = self
            .call(
                "getProgramAccounts",
                json!([program_id, {"encoding": "base64", "commitment": self.commitment}]),
            )
            .await?;

        accounts
            .into_iter()
            .map(|keyed| keyed.account.into_account(keyed.pubkey))
            .collect()
    }

    /// Fetches accounts in order, `None` for the ones that do not exist.
    pub async fn get_multiple_accounts(
        &self,
        pubkeys: &[String],
    ) -> Result<Vec<Option<RpcAccount>>, RpcError> {
        let mut accounts = Vec::with_capacity(pubkeys.len());

        for chunk in pubkeys.chunks(MAX_MULTIPLE_ACCOUNTS) {
            let response: WithContext<Vec<Option<RawAccount>>> = self
                .call(
                    "getMultipleAccounts",
                    json!([chunk, {"encoding": "base64", "commitment": self.commitment}]),
                )
                .await?;

            if response.value.len() != chunk.len() {
                return Err(RpcError::InvalidResponse(format!(
                    "asked for {} accounts, got {}",
                    chunk.len(),
                    response.value.len()
                )));
            }

            for (pubkey, raw) in chunk.iter().zip(response.value) {
                accounts.push(match raw {
                    Some(raw) => Some(raw.into_account(pubkey.clone())?),
                    None => None,
                });
            }
        }

        Ok(accounts)
    }
}
