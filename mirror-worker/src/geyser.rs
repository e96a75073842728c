//! Account and transaction subscription over the Yellowstone geyser protocol.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mirror_common::event::AccountChangeEvent;
use mirror_common::rpc::ChainClient;
use mirror_common::transactions::TransactionResolver;
use mirror_proto::geyser::geyser_client::GeyserClient;
use mirror_proto::geyser::subscribe_update::UpdateOneof;
use mirror_proto::geyser::{
    CommitmentLevel, SubscribeRequest, SubscribeRequestFilterAccounts,
    SubscribeRequestFilterTransactions, SubscribeRequestPing, SubscribeUpdateAccount,
    SubscribeUpdateTransaction,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use crate::error::SourceError;
use crate::router::EventRouter;
use crate::source::{Session, StreamingSource};

pub const SERVICE: &str = "geyser";

const FILTER: &str = "account-mirror";

pub struct GeyserSource {
    url: String,
    x_token: Option<AsciiMetadataValue>,
    connect_timeout: Duration,
    subscribe_transactions: bool,
    router: EventRouter,
    chain: ChainClient,
    resolver: TransactionResolver,
}

impl GeyserSource {
    pub fn new(
        url: &str,
        x_token: Option<&str>,
        connect_timeout: Duration,
        subscribe_transactions: bool,
        router: EventRouter,
        chain: ChainClient,
        resolver: TransactionResolver,
    ) -> Result<Self, SourceError> {
        let x_token = x_token
            .map(|token| {
                token
                    .parse()
                    .map_err(|_| SourceError::Metadata("x-token is not valid ascii".to_owned()))
            })
            .transpose()?;

        Ok(Self {
            url: url.to_owned(),
            x_token,
            connect_timeout,
            subscribe_transactions,
            router,
            chain,
            resolver,
        })
    }

    async fn connect(&self) -> Result<Channel, SourceError> {
        let mut endpoint = Endpoint::from_shared(self.url.clone())?
            .connect_timeout(self.connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(30)));
        if self.url.starts_with("https") {
            endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }
        Ok(endpoint.connect().await?)
    }

    async fn handle_account(
        &mut self,
        update: SubscribeUpdateAccount,
        session: &mut Session<'_>,
    ) -> Result<(), SourceError> {
        let Some(event) = account_event(&update) else {
            return Ok(());
        };
        self.router.apply(vec![event]).await?;
        session
            .commit(update.slot.to_string(), Some(update.slot))
            .await
    }

    async fn handle_transaction(
        &mut self,
        update: SubscribeUpdateTransaction,
        session: &mut Session<'_>,
    ) -> Result<(), SourceError> {
        let keys = transaction_keys(&update);
        let events = self
            .resolver
            .resolve(keys.iter().map(String::as_str), Some(update.slot))
            .await?;
        debug!(slot = update.slot, keys = keys.len(), events = events.len(), "resolved transaction");

        self.router.apply(events).await?;
        session
            .commit(update.slot.to_string(), Some(update.slot))
            .await
    }
}

/// Builds the subscription: every account owned by a tracked program and,
/// optionally, every successful non-vote transaction touching one.
pub fn subscribe_request(
    programs: &[String],
    subscribe_transactions: bool,
    from_slot: Option<u64>,
) -> SubscribeRequest {
    let mut transactions = HashMap::new();
    if subscribe_transactions {
        transactions.insert(
            FILTER.to_owned(),
            SubscribeRequestFilterTransactions {
                vote: Some(false),
                failed: Some(false),
                account_include: programs.to_vec(),
                account_exclude: Vec::new(),
            },
        );
    }

    SubscribeRequest {
        accounts: HashMap::from([(
            FILTER.to_owned(),
            SubscribeRequestFilterAccounts {
                account: Vec::new(),
                owner: programs.to_vec(),
            },
        )]),
        transactions,
        commitment: Some(CommitmentLevel::Confirmed as i32),
        ping: None,
        from_slot,
    }
}

/// A closed account arrives as a zero-lamport write.
pub fn account_event(update: &SubscribeUpdateAccount) -> Option<AccountChangeEvent> {
    let account = update.account.as_ref()?;
    let address = bs58::encode(&account.pubkey).into_string();
    let owner = bs58::encode(&account.owner).into_string();

    Some(if account.lamports == 0 {
        AccountChangeEvent::delete(&owner, &address, Some(update.slot))
    } else {
        AccountChangeEvent::update(&owner, &address, account.data.clone(), Some(update.slot))
    })
}

/// Static keys plus the ones loaded through lookup tables.
pub fn transaction_keys(update: &SubscribeUpdateTransaction) -> Vec<String> {
    let Some(info) = update.transaction.as_ref() else {
        return Vec::new();
    };

    let static_keys = info
        .transaction
        .as_ref()
        .and_then(|transaction| transaction.message.as_ref())
        .map(|message| message.account_keys.as_slice())
        .unwrap_or_default();
    let loaded = info
        .meta
        .as_ref()
        .map(|meta| {
            meta.loaded_writable_addresses
                .iter()
                .chain(meta.loaded_readonly_addresses.iter())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    static_keys
        .iter()
        .chain(loaded)
        .map(|key| bs58::encode(key).into_string())
        .collect()
}

#[async_trait]
impl StreamingSource for GeyserSource {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn run_session(&mut self, session: &mut Session<'_>) -> Result<(), SourceError> {
        let from_slot = match session.resume().and_then(|token| token.parse().ok()) {
            Some(slot) => slot,
            None => self.chain.get_slot().await?,
        };

        let programs: Vec<String> = self
            .router
            .processor()
            .registry()
            .current()
            .programs()
            .map(str::to_owned)
            .collect();

        let channel = self.connect().await?;
        let x_token = self.x_token.clone();
        let mut client = GeyserClient::with_interceptor(channel, move |mut request: tonic::Request<()>| {
            if let Some(token) = &x_token {
                request.metadata_mut().insert("x-token", token.clone());
            }
            Ok(request)
        });

        let (requests, outgoing) = mpsc::channel(8);
        requests
            .send(subscribe_request(
                &programs,
                self.subscribe_transactions,
                Some(from_slot),
            ))
            .await
            .map_err(|_| SourceError::RequestChannelClosed)?;

        let mut stream = client
            .subscribe(ReceiverStream::new(outgoing))
            .await?
            .into_inner();
        info!(from_slot, programs = programs.len(), "geyser subscription open");
        session.connected().await;

        let cancel = session.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                stale = session.check_stale() => stale?,
                message = stream.message() => {
                    let Some(update) = message? else {
                        return Ok(());
                    };
                    match update.update_oneof {
                        Some(UpdateOneof::Account(account)) => {
                            self.handle_account(account, session).await?
                        }
                        Some(UpdateOneof::Transaction(transaction)) => {
                            self.handle_transaction(transaction, session).await?
                        }
                        Some(UpdateOneof::Ping(_)) => {
                            let pong = SubscribeRequest {
                                ping: Some(SubscribeRequestPing { id: 1 }),
                                ..Default::default()
                            };
                            requests
                                .send(pong)
                                .await
                                .map_err(|_| SourceError::RequestChannelClosed)?;
                        }
                        Some(UpdateOneof::Slot(_)) | Some(UpdateOneof::Pong(_)) | None => {}
                    }
                }
            }
        }
    }
}
