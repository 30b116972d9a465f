pub mod collection;
pub mod error;
pub mod filter;
pub mod housekeeper;
pub mod index;
pub mod indexer;
pub mod raft;
pub mod schema;
pub mod search;
pub mod server;
pub mod store;

pub use collection::{Collection, CollectionManager, WriteOperation};
pub use error::{EngineError, EngineResult};
pub use indexer::BatchedIndexer;
pub use raft::{LocalNode, NodeEndpoint, NodeManager, ReplicatedEngine};
pub use search::SearchParams;
pub use server::{create_router, AppState};
pub use store::Store;
