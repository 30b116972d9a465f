pub mod cluster;
pub mod collections;
pub mod curation;
pub mod documents;
pub mod search;

pub use cluster::*;
pub use collections::*;
pub use curation::*;
pub use documents::*;
pub use search::*;

use crate::error::{EngineError, EngineResult};

use super::AppState;

/// Reads are gated on follower catch-up: a node that has not replayed the
/// log to its commit point serves 503s.
pub fn ensure_read_ready(state: &AppState) -> EngineResult<()> {
    if !state.node.engine().is_read_caught_up() {
        return Err(EngineError::Unavailable(
            "Not ready or lagging behind. Please retry after some time.".into(),
        ));
    }
    Ok(())
}
