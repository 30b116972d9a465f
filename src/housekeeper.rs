use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::store::Store;

/// An in-flight query tracked for the housekeeping loop.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub id: u64,
    pub description: String,
    pub started_at: u64,
}

/// Hooks the periodic housekeeping loop drives: in-flight query tracking with
/// slow-query logging, and store compaction on a long cadence.
pub struct Housekeeper {
    store: Arc<Store>,
    in_flight: DashMap<u64, TrackedRequest>,
    compaction_interval: Duration,
    last_compaction: Mutex<Instant>,
    slow_threshold: Duration,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Housekeeper {
    pub fn new(store: Arc<Store>, compaction_interval: Duration, slow_threshold: Duration) -> Self {
        Self {
            store,
            in_flight: DashMap::new(),
            compaction_interval,
            last_compaction: Mutex::new(Instant::now()),
            slow_threshold,
        }
    }

    pub fn add_req(&self, id: u64, description: String) {
        self.in_flight.insert(
            id,
            TrackedRequest {
                id,
                description,
                started_at: now_secs(),
            },
        );
    }

    pub fn remove_req(&self, id: u64) {
        self.in_flight.remove(&id);
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// One housekeeping tick: log queries that outlived the threshold, and
    /// compact the store on its own cadence.
    pub fn tick(&self) {
        let threshold = self.slow_threshold.as_secs();
        let now = now_secs();
        for request in self.in_flight.iter() {
            if now.saturating_sub(request.started_at) >= threshold {
                tracing::warn!(
                    "Long-running query (id {}, {}s): {}",
                    request.id,
                    now.saturating_sub(request.started_at),
                    request.description
                );
            }
        }

        let mut last = self.last_compaction.lock();
        if last.elapsed() >= self.compaction_interval {
            *last = Instant::now();
            drop(last);
            tracing::info!("Housekeeping: compacting the store");
            self.store.compact_all();
        }
    }

    /// Run the loop until `quit` flips. Spawned from `main`.
    pub fn run(&self, interval: Duration, quit: &std::sync::atomic::AtomicBool) {
        while !quit.load(std::sync::atomic::Ordering::SeqCst) {
            std::thread::sleep(interval);
            self.tick();
        }
    }
}
