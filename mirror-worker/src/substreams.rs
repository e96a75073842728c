//! Block feed over the Substreams v2 protocol. Each block carries the output of
//! a map module listing the account writes of tracked programs.
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use mirror_common::event::AccountChangeEvent;
use mirror_common::rpc::ChainClient;
use mirror_proto::mirror::v1::AccountChanges;
use mirror_proto::sf::substreams::rpc::v2::response::Message;
use mirror_proto::sf::substreams::rpc::v2::stream_client::StreamClient;
use mirror_proto::sf::substreams::rpc::v2::{BlockScopedData, BlockUndoSignal, Request};
use mirror_proto::sf::substreams::v1::{Modules, Package};
use prost::Message as _;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Code;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::router::EventRouter;
use crate::source::{Session, StreamingSource};

pub const SERVICE: &str = "substreams";

const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub struct SubstreamsSource {
    url: String,
    authorization: Option<AsciiMetadataValue>,
    connect_timeout: Duration,
    modules: Modules,
    output_module: String,
    router: EventRouter,
    chain: ChainClient,
}

impl SubstreamsSource {
    pub fn new(
        url: &str,
        api_token: Option<&str>,
        connect_timeout: Duration,
        package: Package,
        output_module: &str,
        router: EventRouter,
        chain: ChainClient,
    ) -> Result<Self, SourceError> {
        let modules = package
            .modules
            .ok_or_else(|| SourceError::InvalidPackage("package declares no modules".to_owned()))?;
        let authorization = api_token
            .map(|token| {
                format!("Bearer {token}").parse().map_err(|_| {
                    SourceError::Metadata("api token is not valid ascii".to_owned())
                })
            })
            .transpose()?;

        Ok(Self {
            url: url.to_owned(),
            authorization,
            connect_timeout,
            modules,
            output_module: output_module.to_owned(),
            router,
            chain,
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

    fn request(&self, resume: Option<&str>, head: Option<u64>) -> Request {
        Request {
            start_block_num: head.map(|slot| slot as i64).unwrap_or_default(),
            start_cursor: resume.unwrap_or_default().to_owned(),
            stop_block_num: 0,
            // Undone blocks only rewind the cursor. Rows they wrote stay until the
            // account is written again or swept by refresh.
            final_blocks_only: false,
            production_mode: true,
            output_module: self.output_module.clone(),
            modules: Some(self.modules.clone()),
        }
    }

    async fn handle_block(
        &mut self,
        block: BlockScopedData,
        session: &mut Session<'_>,
    ) -> Result<(), SourceError> {
        let height = block.clock.as_ref().map(|clock| clock.number);
        let events = account_changes(&block, &self.output_module)?;
        if !events.is_empty() {
            debug!(block = height, changes = events.len(), "applying block");
            self.router.apply(events).await?;
        }
        session.commit(block.cursor, height).await
    }

    async fn handle_undo(
        &mut self,
        undo: BlockUndoSignal,
        session: &mut Session<'_>,
    ) -> Result<(), SourceError> {
        let height = undo.last_valid_block.as_ref().map(|block| block.number);
        warn!(last_valid_block = height, "chain reorganised, rewinding cursor");
        session.rewind(undo.last_valid_cursor, height).await
    }
}

/// Reads a `.spkg` package file.
pub fn load_package(path: impl AsRef<Path>) -> Result<Package, SourceError> {
    let path = path.as_ref();
    let raw = std::fs::read(path)
        .map_err(|error| SourceError::InvalidPackage(format!("{}: {}", path.display(), error)))?;
    Package::decode(raw.as_slice())
        .map_err(|error| SourceError::InvalidPackage(format!("{}: {}", path.display(), error)))
}

/// Turns a block's module output into events. Blocks without output for the
/// module yield nothing. A change without its own slot takes the block's.
pub fn account_changes(
    block: &BlockScopedData,
    module: &str,
) -> Result<Vec<AccountChangeEvent>, prost::DecodeError> {
    let Some(output) = block.output.as_ref().filter(|output| output.name == module) else {
        return Ok(Vec::new());
    };
    let Some(value) = output.map_output.as_ref().map(|any| any.value.as_slice()) else {
        return Ok(Vec::new());
    };
    let block_number = block.clock.as_ref().map(|clock| clock.number);

    let changes = AccountChanges::decode(value)?;
    Ok(changes
        .changes
        .into_iter()
        .map(|change| {
            let slot = Some(change.slot).filter(|slot| *slot > 0).or(block_number);
            let address = bs58::encode(&change.address).into_string();
            let owner = bs58::encode(&change.owner).into_string();
            if change.deleted {
                AccountChangeEvent::delete(&owner, &address, slot)
            } else {
                AccountChangeEvent::update(&owner, &address, change.data, slot)
            }
        })
        .collect())
}

#[async_trait]
impl StreamingSource for SubstreamsSource {
    fn name(&self) -> &'static str {
        SERVICE
    }

    async fn run_session(&mut self, session: &mut Session<'_>) -> Result<(), SourceError> {
        let head = match session.resume() {
            Some(_) => None,
            None => Some(self.chain.get_slot().await?),
        };
        let request = self.request(session.resume(), head);

        let channel = self.connect().await?;
        let authorization = self.authorization.clone();
        let mut client = StreamClient::with_interceptor(channel, move |mut request: tonic::Request<()>| {
            if let Some(value) = &authorization {
                request.metadata_mut().insert("authorization", value.clone());
            }
            Ok(request)
        })
        .max_decoding_message_size(MAX_MESSAGE_SIZE);

        let mut stream = match client.blocks(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::InvalidArgument => {
                return Err(SourceError::InvalidPackage(status.message().to_owned()));
            }
            Err(status) => return Err(status.into()),
        };
        info!(
            start_block = head,
            resumed = head.is_none(),
            module = %self.output_module,
            "substreams session open"
        );
        session.connected().await;

        let cancel = session.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                stale = session.check_stale() => stale?,
                message = stream.message() => {
                    let Some(response) = message? else {
                        return Ok(());
                    };
                    match response.message {
                        Some(Message::BlockScopedData(block)) => {
                            self.handle_block(block, session).await?
                        }
                        Some(Message::BlockUndoSignal(undo)) => {
                            self.handle_undo(undo, session).await?
                        }
                        Some(Message::FatalError(error)) => {
                            return Err(SourceError::Fatal(format!(
                                "module {}: {}",
                                error.module, error.reason
                            )));
                        }
                        Some(Message::Session(init)) => {
                            debug!(trace_id = %init.trace_id, "session initialised");
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mirror_proto::mirror::v1::AccountChange;
    use mirror_proto::sf::substreams::rpc::v2::{AnyOutput, MapModuleOutput};
    use mirror_proto::sf::substreams::v1::Clock;

    use super::*;

    const MODULE: &str = "map_account_changes";

    fn block(module: &str, changes: Vec<AccountChange>) -> BlockScopedData {
        BlockScopedData {
            output: Some(MapModuleOutput {
                name: module.to_owned(),
                map_output: Some(AnyOutput {
                    type_url: "type.googleapis.com/mirror.v1.AccountChanges".to_owned(),
                    value: AccountChanges { changes }.encode_to_vec(),
                }),
            }),
            clock: Some(Clock {
                id: "block".to_owned(),
                number: 500,
            }),
            cursor: "cursor-500".to_owned(),
            final_block_height: 480,
        }
    }

    #[test]
    fn decodes_module_output_into_events() {
        let data = block(
            MODULE,
            vec![
                AccountChange {
                    address: vec![1; 32],
                    owner: vec![2; 32],
                    data: vec![7, 7],
                    deleted: false,
                    slot: 499,
                },
                AccountChange {
                    address: vec![3; 32],
                    owner: vec![2; 32],
                    data: vec![],
                    deleted: true,
                    slot: 0,
                },
            ],
        );

        let events = account_changes(&data, MODULE).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].address, bs58::encode([1u8; 32]).into_string());
        assert_eq!(events[0].program_id, bs58::encode([2u8; 32]).into_string());
        assert_eq!(events[0].data, vec![7, 7]);
        assert_eq!(events[0].slot, Some(499));
        assert!(events[1].is_delete);
        // Falls back to the block number.
        assert_eq!(events[1].slot, Some(500));
    }

    #[test]
    fn ignores_other_modules_and_empty_blocks() {
        let other = block("map_something_else", vec![AccountChange::default()]);
        assert!(account_changes(&other, MODULE).unwrap().is_empty());

        let empty = BlockScopedData {
            cursor: "c".to_owned(),
            ..Default::default()
        };
        assert!(account_changes(&empty, MODULE).unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage_output() {
        let mut data = block(MODULE, vec![]);
        data.output.as_mut().unwrap().map_output.as_mut().unwrap().value = vec![0xff, 0xff, 0xff];
        assert!(account_changes(&data, MODULE).is_err());
    }

    #[test]
    fn unreadable_package_is_invalid() {
        let result = load_package("/nonexistent/package.spkg");
        assert!(matches!(result, Err(SourceError::InvalidPackage(_))));
    }
}
