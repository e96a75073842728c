//! Turns transactions into account events by re-reading the accounts they
//! touched from the chain.
use std::collections::HashSet;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::event::AccountChangeEvent;
use crate::metrics_consts::EVENTS_IRRELEVANT;
use crate::pipeline::SharedRegistry;
use crate::rpc::{ChainClient, RpcError};

/// Transaction as delivered by the transaction webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPayload {
    #[serde(default)]
    pub slot: Option<u64>,
    pub transaction: TransactionBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionBody {
    pub message: TransactionMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub account_keys: Vec<AccountKey>,
}

/// Either a bare key or the parsed `{pubkey, signer, writable}` form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountKey {
    Plain(String),
    Parsed { pubkey: String },
}

impl AccountKey {
    pub fn pubkey(&self) -> &str {
        match self {
            AccountKey::Plain(pubkey) | AccountKey::Parsed { pubkey } => pubkey,
        }
    }
}

impl TransactionPayload {
    pub fn account_keys(&self) -> impl Iterator<Item = &str> {
        self.transaction.message.account_keys.iter().map(AccountKey::pubkey)
    }
}

pub struct TransactionResolver {
    client: ChainClient,
    registry: SharedRegistry,
    irrelevant: Mutex<BloomFilter>,
}

impl TransactionResolver {
    pub fn new(client: ChainClient, registry: SharedRegistry, bloom: BloomFilter) -> Self {
        Self {
            client,
            registry,
            irrelevant: Mutex::new(bloom),
        }
    }

    fn is_known_irrelevant(&self, address: &str) -> bool {
        match self.irrelevant.lock() {
            Ok(bloom) => bloom.contains(address),
            Err(_) => false,
        }
    }

    fn remember_irrelevant(&self, address: &str) {
        if let Ok(mut bloom) = self.irrelevant.lock() {
            bloom.insert(address);
        }
    }

    /// Fetches the current state of every touched account not already known
    /// to be irrelevant. Accounts that no longer exist become deletes;
    /// accounts owned by untracked programs are remembered and dropped.
    pub async fn resolve<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a str>,
        slot: Option<u64>,
    ) -> Result<Vec<AccountChangeEvent>, RpcError> {
        let mut seen = HashSet::new();
        let candidates: Vec<String> = keys
            .into_iter()
            .filter(|key| seen.insert(*key))
            .filter(|key| !self.is_known_irrelevant(key))
            .map(str::to_owned)
            .collect();

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let accounts = self.client.get_multiple_accounts(&candidates).await?;
        let registry = self.registry.current();

        let mut events = Vec::new();
        for (address, account) in candidates.iter().zip(accounts) {
            match account {
                None => events.push(AccountChangeEvent::delete("", address, slot)),
                Some(account) if registry.is_tracked(&account.owner) => events.push(
                    AccountChangeEvent::update(&account.owner, address, account.data, slot),
                ),
                Some(account) => {
                    debug!(address = %address, owner = %account.owner, "untracked owner");
                    metrics::counter!(EVENTS_IRRELEVANT, "source" => "transaction").increment(1);
                    self.remember_irrelevant(address);
                }
            }
        }

        Ok(events)
    }
}
