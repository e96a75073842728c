use serde::Deserialize;

/// A single account mutation observed by one of the ingestion sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountChangeEvent {
    pub program_id: String,
    pub address: String,
    pub data: Vec<u8>,
    pub is_delete: bool,
    pub slot: Option<u64>,
}

impl AccountChangeEvent {
    pub fn update(program_id: &str, address: &str, data: Vec<u8>, slot: Option<u64>) -> Self {
        Self {
            program_id: program_id.to_owned(),
            address: address.to_owned(),
            data,
            is_delete: false,
            slot,
        }
    }

    pub fn delete(program_id: &str, address: &str, slot: Option<u64>) -> Self {
        Self {
            program_id: program_id.to_owned(),
            address: address.to_owned(),
            data: Vec::new(),
            is_delete: true,
            slot,
        }
    }
}

/// Account payload as carried by the queue and the account webhook.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPayload {
    pub pubkey: String,
    pub program: String,
    /// Base64 account data.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub is_delete: bool,
    #[serde(default)]
    pub slot: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("account {address} carries invalid base64 data: {error}")]
pub struct PayloadDecodeError {
    pub address: String,
    pub error: base64::DecodeError,
}

impl TryFrom<AccountPayload> for AccountChangeEvent {
    type Error = PayloadDecodeError;

    fn try_from(payload: AccountPayload) -> Result<Self, Self::Error> {
        use base64::Engine;

        let data = if payload.is_delete {
            Vec::new()
        } else {
            base64::engine::general_purpose::STANDARD
                .decode(payload.data.as_bytes())
                .map_err(|error| PayloadDecodeError {
                    address: payload.pubkey.clone(),
                    error,
                })?
        };

        Ok(AccountChangeEvent {
            program_id: payload.program,
            address: payload.pubkey,
            data,
            is_delete: payload.is_delete,
            slot: payload.slot,
        })
    }
}
