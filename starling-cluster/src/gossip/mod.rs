//! Gossip subsystem: versioned state, anti-entropy exchange, consensus.

mod consensus;
mod gossiper;
mod state;

pub use consensus::{ConsensusHandle, ConsensusProjection, ConsensusResult};
pub use gossiper::{GossipConfig, Gossiper};
pub use state::{CLUSTER_LEFT_KEY, GossipEnvelope, GossipState, VersionedValue};
