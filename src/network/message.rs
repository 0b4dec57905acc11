//! Wire messages exchanged between peers: one JSON object per line.

use crate::blockchain::{Attestation, Block};
use crate::crypto::Address;
use crate::error::ChainError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame, newline included.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

pub const PROTOCOL_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Hello,
    HelloAck,
    Peers,
    Tx,
    Block,
    Attest,
    SyncReq,
    SyncRes,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub payload: serde_json::Value,
    pub sender: Address,
    pub timestamp: u64,
}

impl Message {
    pub fn new<P: Serialize>(msg_type: MessageType, payload: &P, sender: Address) -> Result<Self, ChainError> {
        Ok(Message {
            msg_type,
            payload: serde_json::to_value(payload)?,
            sender,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        })
    }

    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, ChainError> {
        P::deserialize(&self.payload).map_err(|e| {
            ChainError::Serialization(format!("Bad {:?} payload: {}", self.msg_type, e))
        })
    }

    pub fn to_line(&self) -> Result<String, ChainError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, ChainError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// Handshake opener sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub address: Address,
    /// Port the sender accepts connections on
    pub port: u16,
    pub version: String,
    pub network_id: u32,
    #[serde(default)]
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub address: Address,
    pub network_id: u32,
    #[serde(default)]
    pub height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeersPayload {
    pub endpoints: Vec<String>,
}

/// Keepalive for PING and PONG; carries the sender's height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub height: u64,
}

/// BLOCK payload: announcement summary plus the full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub proposer: Address,
    pub timestamp: u64,
    pub state_root: String,
    pub tx_count: usize,
    pub block: Block,
}

impl BlockPayload {
    pub fn from_block(block: &Block) -> Self {
        BlockPayload {
            height: block.height(),
            hash: block.hash_hex(),
            previous_hash: hex::encode(block.header.previous_hash),
            proposer: block.header.proposer.clone(),
            timestamp: block.header.timestamp,
            state_root: hex::encode(block.header.state_root),
            tx_count: block.transactions.len(),
            block: block.clone(),
        }
    }

    /// Dedup identity: first 16 hex chars of the block hash.
    pub fn block_id(&self) -> String {
        self.hash.chars().take(16).collect()
    }

    /// Checks that the summary describes the enclosed block.
    pub fn verify_summary(&self) -> Result<(), ChainError> {
        if self.block.hash_hex() != self.hash || self.block.height() != self.height {
            return Err(ChainError::Serialization(format!(
                "Block summary {} does not match enclosed block",
                self.block_id()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestPayload {
    pub attestation: Attestation,
}

/// Closed height range `[start_height, end_height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub start_height: u64,
    pub end_height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub blocks: Vec<Block>,
}

/// Reads one frame. `Ok(None)` means the peer closed the connection.
/// Frames that are not UTF-8 JSON surface as `Serialization` and leave the
/// stream at the next frame; oversized frames and I/O failures surface as
/// `NetworkError`, after which the stream is unusable.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, ChainError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let read = reader
        .take(MAX_FRAME_SIZE as u64)
        .read_until(b'\n', &mut frame)
        .await
        .map_err(|e| ChainError::NetworkError(e.to_string()))?;
    if read == 0 {
        return Ok(None);
    }
    if frame.last() != Some(&b'\n') {
        if read >= MAX_FRAME_SIZE {
            return Err(ChainError::NetworkError(format!(
                "Frame exceeds {} bytes",
                MAX_FRAME_SIZE
            )));
        }
        // EOF in the middle of a frame
        return Ok(None);
    }
    let line = String::from_utf8(frame)
        .map_err(|e| ChainError::Serialization(format!("Frame is not UTF-8: {}", e)))?;
    Message::from_line(&line).map(Some)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ChainError>
where
    W: AsyncWrite + Unpin,
{
    let line = message.to_line()?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ChainError::NetworkError(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| ChainError::NetworkError(e.to_string()))
}
