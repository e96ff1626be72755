//! Validator client - follows the node's block stream and votes on each block
//!
//! One parameterized process per validator: it subscribes to `blocks`, checks
//! that each block hashes correctly and extends the previous one, and reports
//! a `validate` vote back over the same connection.

use crate::types::{Channel, ClientMessage, ServerMessage, ValidationVote};
use futures::{SinkExt, StreamExt};
use l2_runtime::{Address, Block, H256};
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Why a received block was rejected
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LinkError {
    #[error("block {height} hash {claimed} does not match its header ({computed})")]
    HashMismatch {
        height: u64,
        claimed: H256,
        computed: H256,
    },

    #[error("expected block {expected}, received {got}")]
    HeightGap { expected: u64, got: u64 },

    #[error("block {height} does not extend {expected}")]
    ParentMismatch { height: u64, expected: H256 },
}

/// Tracks the last accepted block and checks that new ones extend it
#[derive(Debug, Default)]
pub struct ChainFollower {
    tip: Option<(u64, H256)>,
}

impl ChainFollower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last block seen, as (height, hash)
    pub fn tip(&self) -> Option<(u64, H256)> {
        self.tip
    }

    /// Check `block` against the tip. The tip moves to `block` either way, so
    /// one bad block costs one negative vote rather than every vote after it.
    pub fn observe(&mut self, block: &Block) -> Result<(), LinkError> {
        let result = self.check(block);
        self.tip = Some((block.height, block.hash));
        result
    }

    fn check(&self, block: &Block) -> Result<(), LinkError> {
        let computed = block.compute_hash();
        if computed != block.hash {
            return Err(LinkError::HashMismatch {
                height: block.height,
                claimed: block.hash,
                computed,
            });
        }

        let Some((height, hash)) = self.tip else {
            return Ok(());
        };
        if block.height != height + 1 {
            return Err(LinkError::HeightGap {
                expected: height + 1,
                got: block.height,
            });
        }
        if block.parent_hash != hash {
            return Err(LinkError::ParentMismatch {
                height: block.height,
                expected: hash,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorClientConfig {
    pub address: Address,
    pub name: String,
    /// WebSocket URL of the node, e.g. `ws://127.0.0.1:8546`
    pub node_url: String,
}

/// Validator client
pub struct ValidatorClient {
    config: ValidatorClientConfig,
    follower: ChainFollower,
    votes_sent: u64,
}

impl ValidatorClient {
    pub fn new(config: ValidatorClientConfig) -> Self {
        Self {
            config,
            follower: ChainFollower::new(),
            votes_sent: 0,
        }
    }

    pub fn votes_sent(&self) -> u64 {
        self.votes_sent
    }

    /// Build the vote for a received block
    pub fn vote(&mut self, block: &Block) -> ValidationVote {
        let valid = match self.follower.observe(block) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{} rejecting block {}: {}", self.config.name, block.height, e);
                false
            }
        };
        ValidationVote {
            validator: self.config.address,
            height: block.height,
            hash: block.hash,
            valid,
        }
    }

    /// Connect, subscribe and vote until the node closes the connection
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(self.config.node_url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        tracing::info!(
            "Validator {} ({}) connected to {}",
            self.config.name,
            self.config.address,
            self.config.node_url
        );

        let subscribe = ClientMessage::Subscribe {
            channel: Channel::Blocks,
        };
        ws_sender.send(Message::Text(subscribe.to_json())).await?;

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(data)) => {
                    ws_sender.send(Message::Pong(data)).await?;
                    continue;
                }
                Ok(Message::Close(_)) => {
                    tracing::warn!("Node closed connection");
                    break;
                }
                Err(e) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                _ => continue,
            };

            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::NewBlock { block }) => {
                    let vote = ClientMessage::Validate(self.vote(&block));
                    ws_sender.send(Message::Text(vote.to_json())).await?;
                    self.votes_sent += 1;
                    tracing::debug!("{} voted on block {}", self.config.name, block.height);
                }
                Ok(ServerMessage::Validation { data }) if data.validator == self.config.address => {
                    tracing::info!(
                        "{} block {} confirmed: {} (uptime {:.1}%)",
                        self.config.name,
                        data.height,
                        data.confirmed,
                        data.uptime
                    );
                }
                Ok(ServerMessage::Subscribed { channel }) => {
                    tracing::info!("{} subscribed to {:?}", self.config.name, channel);
                }
                Ok(ServerMessage::Error { message }) => {
                    tracing::warn!("Node reported: {}", message);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Unrecognized message from node: {}", e),
            }
        }

        Ok(())
    }
}

/// Builder for ValidatorClient
pub struct ValidatorClientBuilder {
    config: ValidatorClientConfig,
}

impl ValidatorClientBuilder {
    pub fn new(address: Address) -> Self {
        Self {
            config: ValidatorClientConfig {
                address,
                name: address.to_string(),
                node_url: "ws://127.0.0.1:8546".to_string(),
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn node_url(mut self, url: impl Into<String>) -> Self {
        self.config.node_url = url.into();
        self
    }

    pub fn build(self) -> ValidatorClient {
        ValidatorClient::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use l2_runtime::Bytes;

    fn block(height: u64, parent: H256) -> Block {
        Block::assemble(
            height,
            parent,
            1_700_000_000 + height as i64,
            vec![],
            0,
            30_000_000,
            Address([1u8; 20]),
            Bytes::default(),
        )
    }

    #[test]
    fn test_follows_linked_chain() {
        let mut follower = ChainFollower::new();
        let b1 = block(1, H256([9u8; 32]));
        let b2 = block(2, b1.hash);
        let b3 = block(3, b2.hash);

        assert_eq!(follower.observe(&b1), Ok(()));
        assert_eq!(follower.observe(&b2), Ok(()));
        assert_eq!(follower.observe(&b3), Ok(()));
        assert_eq!(follower.tip(), Some((3, b3.hash)));
    }

    #[test]
    fn test_rejects_broken_links() {
        let mut follower = ChainFollower::new();
        let b1 = block(1, H256::zero());
        follower.observe(&b1).unwrap();

        let skipped = block(3, b1.hash);
        assert_eq!(
            follower.observe(&skipped),
            Err(LinkError::HeightGap { expected: 2, got: 3 })
        );

        let orphan = block(4, H256([7u8; 32]));
        assert!(matches!(
            follower.observe(&orphan),
            Err(LinkError::ParentMismatch { height: 4, .. })
        ));

        let mut tampered = block(5, orphan.hash);
        tampered.gas_used = 1;
        assert!(matches!(
            follower.observe(&tampered),
            Err(LinkError::HashMismatch { height: 5, .. })
        ));
    }

    #[test]
    fn test_votes_carry_identity() {
        let me = Address([4u8; 20]);
        let mut client = ValidatorClientBuilder::new(me).name("Cortex").build();

        let b1 = block(1, H256::zero());
        let vote = client.vote(&b1);
        assert_eq!(vote.validator, me);
        assert_eq!(vote.hash, b1.hash);
        assert!(vote.valid);

        let vote = client.vote(&block(5, H256::zero()));
        assert!(!vote.valid);
        assert_eq!(client.votes_sent(), 0);
    }
}
