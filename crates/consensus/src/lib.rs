//! L2 Consensus - single-authority block production schedule
//!
//! - Validator registry with round-robin producer selection
//! - Uptime and reward bookkeeping driven by the block producer and by votes
//! - Streaming wire messages shared by the node and validator clients
//! - Validator client that follows the block stream and votes per block

pub mod registry;
pub mod types;
pub mod validator;

pub use registry::{UptimePolicy, ValidatorRegistry};
pub use types::*;
pub use validator::{ChainFollower, LinkError, ValidatorClient, ValidatorClientBuilder, ValidatorClientConfig};
