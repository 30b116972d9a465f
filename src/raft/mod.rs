pub mod node;
pub mod state_machine;

pub use node::{resolve_nodes_config, ConsensusNode, LocalNode, NodeEndpoint, NodeManager};
pub use state_machine::{LogEntry, ReplicatedEngine, StateMachine};
