use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub mod handlers;
pub mod routes;

pub use routes::create_router;

use crate::collection::CollectionManager;
use crate::housekeeper::Housekeeper;
use crate::indexer::BatchedIndexer;
use crate::raft::NodeManager;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CollectionManager>,
    pub indexer: Arc<BatchedIndexer>,
    pub node: Arc<NodeManager>,
    pub housekeeper: Arc<Housekeeper>,
    pub req_counter: Arc<AtomicU64>,
}

impl AppState {
    /// Process-unique write request id: wall-clock microseconds plus a
    /// monotonic low word, so ids stay unique across restarts.
    pub fn next_req_id(&self) -> u64 {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let low = self
            .req_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            & 0x3FF;
        (micros << 10) | low
    }
}
