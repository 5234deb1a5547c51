//! Durable settlement records, channel heads, and replayable responses.
//!
//! The embedded store keeps one JSON file per object under the configured
//! root: `settlements/` keyed by settlement id, `index/` mapping idempotency
//! keys to settlement ids, `heads/` holding the latest accepted credit state
//! per channel, and `responses/` holding terminal responses for request-id
//! replay. Every write lands in a temp file first and is renamed into place,
//! through a single serializing writer, so the durable order always matches
//! the order the processors committed in.

use alloy_primitives::{B256, keccak256};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

use shield_types::credit::ChannelHead;
use shield_types::error::RelayerError;
use shield_types::proto::relay::{MerchantResult, PayResponse};
use shield_types::timestamp::UnixTimestamp;

/// Lifecycle of a direct payment inside the relayer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    #[serde(rename = "RECEIVED")]
    Received,
    #[serde(rename = "VERIFIED")]
    Verified,
    #[serde(rename = "SENT_ONCHAIN")]
    SentOnchain,
    #[serde(rename = "CONFIRMED")]
    Confirmed,
    #[serde(rename = "PAID_MERCHANT")]
    PaidMerchant,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
}

impl SettlementStatus {
    /// Terminal records replay their stored response on retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Done | SettlementStatus::Failed)
    }
}

/// One direct payment's durable trail, written after every stage so a crash
/// can resume exactly where the pipeline stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub settlement_id: String,
    pub idempotency_key: String,
    pub status: SettlementStatus,
    pub nullifier: B256,
    pub root: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_leaf_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_leaf_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_result: Option<MerchantResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: UnixTimestamp,
    /// The terminal response, replayed verbatim on idempotent retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_response: Option<PayResponse>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("store codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<StoreError> for RelayerError {
    fn from(value: StoreError) -> Self {
        RelayerError::internal(value.to_string())
    }
}

/// Durable key/value surface the processors write through.
#[async_trait::async_trait]
pub trait SettlementStore: Send + Sync {
    async fn get_by_settlement_id(&self, id: &str)
    -> Result<Option<SettlementRecord>, StoreError>;

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SettlementRecord>, StoreError>;

    async fn put(&self, record: &SettlementRecord) -> Result<(), StoreError>;

    async fn get_head(&self, channel_id: &B256) -> Result<Option<ChannelHead>, StoreError>;

    async fn put_head(&self, head: &ChannelHead) -> Result<(), StoreError>;

    async fn delete_head(&self, channel_id: &B256) -> Result<(), StoreError>;

    /// Terminal response previously stored for a credit request id.
    async fn get_response(&self, request_id: &B256)
    -> Result<Option<serde_json::Value>, StoreError>;

    async fn put_response(
        &self,
        request_id: &B256,
        response: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// File-backed store with atomic-rename writes.
pub struct FsStore {
    root: PathBuf,
    /// Serializes writers so durable order matches commit order.
    writer: Mutex<()>,
}

impl FsStore {
    /// Opens (and lays out) a store under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["settlements", "index", "heads", "responses"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self {
            root,
            writer: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn settlement_path(&self, id: &str) -> PathBuf {
        self.root.join("settlements").join(format!("{id}.json"))
    }

    fn index_path(&self, key: &str) -> PathBuf {
        // Idempotency keys are caller-supplied; hash them into a safe name.
        let digest = keccak256(key.as_bytes());
        self.root.join("index").join(format!("{digest:x}.json"))
    }

    fn head_path(&self, channel_id: &B256) -> PathBuf {
        self.root.join("heads").join(format!("{channel_id:x}.json"))
    }

    fn response_path(&self, request_id: &B256) -> PathBuf {
        self.root
            .join("responses")
            .join(format!("{request_id:x}.json"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl SettlementStore for FsStore {
    async fn get_by_settlement_id(
        &self,
        id: &str,
    ) -> Result<Option<SettlementRecord>, StoreError> {
        Self::read_json(&self.settlement_path(id)).await
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SettlementRecord>, StoreError> {
        let Some(settlement_id) = Self::read_json::<String>(&self.index_path(key)).await? else {
            return Ok(None);
        };
        self.get_by_settlement_id(&settlement_id).await
    }

    async fn put(&self, record: &SettlementRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.write_atomic(&self.settlement_path(&record.settlement_id), &bytes)
            .await?;
        let index = serde_json::to_vec(&record.settlement_id)?;
        self.write_atomic(&self.index_path(&record.idempotency_key), &index)
            .await
    }

    async fn get_head(&self, channel_id: &B256) -> Result<Option<ChannelHead>, StoreError> {
        Self::read_json(&self.head_path(channel_id)).await
    }

    async fn put_head(&self, head: &ChannelHead) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(head)?;
        self.write_atomic(&self.head_path(&head.state.channel_id), &bytes)
            .await
    }

    async fn delete_head(&self, channel_id: &B256) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        match fs::remove_file(self.head_path(channel_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_response(
        &self,
        request_id: &B256,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Self::read_json(&self.response_path(request_id)).await
    }

    async fn put_response(
        &self,
        request_id: &B256,
        response: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(response)?;
        self.write_atomic(&self.response_path(request_id), &bytes)
            .await
    }
}
