//! Wire messages for the streaming channel
//!
//! JSON text frames, tagged by `type`. Clients subscribe to channels and send
//! validation votes; the node pushes new blocks and validation outcomes.

use l2_runtime::{Address, Block, H256};
use serde::{Deserialize, Serialize};

/// Streaming channels a client can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    #[serde(alias = "newBlock", alias = "newBlocks")]
    Blocks,
    #[serde(alias = "validation")]
    Validations,
}

/// A validator's verdict on one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVote {
    pub validator: Address,
    pub height: u64,
    pub hash: H256,
    pub valid: bool,
}

/// Outcome of a vote after the node checked it against its own chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub validator: Address,
    pub name: String,
    pub height: u64,
    pub hash: H256,
    /// What the validator claimed
    pub valid: bool,
    /// Whether the claim holds against the stored block
    pub confirmed: bool,
    /// Uptime after this round
    pub uptime: f64,
    pub timestamp: i64,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe { channel: Channel },
    Unsubscribe { channel: Channel },
    Ping,
    Validate(ValidationVote),
}

/// Messages pushed by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Subscribed { channel: Channel },
    Unsubscribed { channel: Channel },
    Pong,
    NewBlock { block: Block },
    Validation { data: ValidationReport },
    Error { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"encoding failed: {}"}}"#, e)
        })
    }
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
