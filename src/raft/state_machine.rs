use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::collection::CollectionManager;
use crate::error::{EngineError, EngineResult};
use crate::indexer::{BatchedIndexer, RequestMeta, WriteResponse};
use crate::store::Store;

/// A decoded consensus log entry: one chunk of a replicated HTTP write.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub meta: RequestMeta,
    #[serde(with = "serde_bytes_b64")]
    pub chunk: Vec<u8>,
    pub is_last_chunk: bool,
}

/// Chunks travel base64-inside-JSON so the log payload stays printable.
mod serde_bytes_b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

/// The contract the consensus library drives. The core supplies the single
/// implementation (`ReplicatedEngine`); transports call into it in log order.
pub trait StateMachine: Send + Sync {
    /// Apply one committed entry at `index`. A failure here poisons the
    /// index: the marker persists and the next boot skips the record.
    fn apply(&self, index: i64, entry: &LogEntry) -> EngineResult<()>;

    /// Quiesce writers, checkpoint the store and serialize component state
    /// into `dir`. Returns the manifest of written files.
    fn on_snapshot_save(&self, dir: &Path) -> EngineResult<Vec<String>>;

    /// Replace all local state with the snapshot in `dir`.
    fn on_snapshot_load(&self, dir: &Path) -> EngineResult<()>;

    fn on_leader_start(&self, term: i64);
    fn on_leader_stop(&self);
    fn on_configuration_committed(&self, peers: &[String]);
}

const DB_SNAPSHOT_DIR: &str = "db_snapshot";
const STATE_FILE: &str = "state.json";
const MANIFEST_FILE: &str = "manifest.json";

/// The replicated write path: decodes log entries into indexer work, owns the
/// applied-index watermark and the readiness bits, and drives snapshots.
pub struct ReplicatedEngine {
    store: Arc<Store>,
    manager: Arc<CollectionManager>,
    indexer: Arc<BatchedIndexer>,
    applied_index: AtomicI64,
    leader_term: AtomicI64,
    read_caught_up: AtomicBool,
    write_caught_up: AtomicBool,
    /// Response channels of writes this node originated, keyed by req id.
    pending: Mutex<HashMap<u64, oneshot::Sender<WriteResponse>>>,
}

impl ReplicatedEngine {
    pub fn new(
        store: Arc<Store>,
        manager: Arc<CollectionManager>,
        indexer: Arc<BatchedIndexer>,
    ) -> Self {
        Self {
            store,
            manager,
            indexer,
            applied_index: AtomicI64::new(0),
            leader_term: AtomicI64::new(-1),
            read_caught_up: AtomicBool::new(false),
            write_caught_up: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<CollectionManager> {
        &self.manager
    }

    pub fn indexer(&self) -> &Arc<BatchedIndexer> {
        &self.indexer
    }

    pub fn applied_index(&self) -> i64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    pub fn leader_term(&self) -> i64 {
        self.leader_term.load(Ordering::SeqCst)
    }

    pub fn is_read_caught_up(&self) -> bool {
        self.read_caught_up.load(Ordering::SeqCst)
    }

    pub fn is_write_caught_up(&self) -> bool {
        self.write_caught_up.load(Ordering::SeqCst)
    }

    pub fn set_caught_up(&self, read: bool, write: bool) {
        self.read_caught_up.store(read, Ordering::SeqCst);
        self.write_caught_up.store(write, Ordering::SeqCst);
    }

    /// Register the response channel for a write this node originated. The
    /// channel fires when the entry has been applied locally.
    pub fn register_pending(&self, req_id: u64) -> oneshot::Receiver<WriteResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req_id, tx);
        rx
    }

    pub fn boot(&self) -> EngineResult<()> {
        self.indexer.populate_skip_index()?;
        self.manager.load()?;
        self.read_caught_up.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl StateMachine for ReplicatedEngine {
    fn apply(&self, index: i64, entry: &LogEntry) -> EngineResult<()> {
        let mut meta = entry.meta.clone();
        meta.log_index = index;
        let notify = self.pending.lock().remove(&meta.req_id);

        // The drain worker wraps the actual apply in the poison marker; a
        // failure to even enqueue pins the marker here so the next boot can
        // skip the record.
        let applied = self
            .indexer
            .enqueue(meta, &entry.chunk, entry.is_last_chunk, notify);
        match applied {
            Ok(()) => {
                self.applied_index.store(index, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.indexer.persist_applying_index(index)?;
                tracing::error!("Apply failed at log index {}: {}", index, e);
                Err(EngineError::Fatal(format!(
                    "Apply failed at log index {}: {}",
                    index, e
                )))
            }
        }
    }

    fn on_snapshot_save(&self, dir: &Path) -> EngineResult<Vec<String>> {
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::Fatal(format!("Cannot create snapshot dir: {}", e)))?;

        // Snapshots see a quiesced indexer; enqueues keep landing meanwhile.
        let pause = self.indexer.pause_lock();
        let _guard = pause.write();

        let db_dir = dir.join(DB_SNAPSHOT_DIR);
        if db_dir.exists() {
            std::fs::remove_dir_all(&db_dir)
                .map_err(|e| EngineError::Fatal(format!("Cannot clear snapshot dir: {}", e)))?;
        }
        self.store.checkpoint(&db_dir)?;

        let state = json!({
            "applied_index": self.applied_index.load(Ordering::SeqCst),
            "batched_indexer": self.indexer.serialize_state(),
        });
        std::fs::write(dir.join(STATE_FILE), state.to_string())
            .map_err(|e| EngineError::Fatal(format!("Cannot write snapshot state: {}", e)))?;

        let manifest = vec![DB_SNAPSHOT_DIR.to_string(), STATE_FILE.to_string()];
        std::fs::write(
            dir.join(MANIFEST_FILE),
            json!({ "files": manifest }).to_string(),
        )
        .map_err(|e| EngineError::Fatal(format!("Cannot write snapshot manifest: {}", e)))?;

        tracing::info!("Snapshot saved to {:?}", dir);
        Ok(manifest)
    }

    fn on_snapshot_load(&self, dir: &Path) -> EngineResult<()> {
        let raw = std::fs::read_to_string(dir.join(STATE_FILE))
            .map_err(|e| EngineError::Fatal(format!("Cannot read snapshot state: {}", e)))?;
        let state: Value = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Fatal(format!("Corrupt snapshot state: {}", e)))?;

        self.store.reload(true, &dir.join(DB_SNAPSHOT_DIR))?;
        self.manager.load()?;
        self.indexer
            .load_state(state.get("batched_indexer").unwrap_or(&Value::Null));
        self.applied_index.store(
            state
                .get("applied_index")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            Ordering::SeqCst,
        );
        self.read_caught_up.store(true, Ordering::SeqCst);

        tracing::info!(
            "Snapshot loaded from {:?} (applied index {})",
            dir,
            self.applied_index()
        );
        Ok(())
    }

    fn on_leader_start(&self, term: i64) {
        self.leader_term.store(term, Ordering::SeqCst);
        self.write_caught_up.store(true, Ordering::SeqCst);
        tracing::info!("Became leader for term {}", term);
    }

    fn on_leader_stop(&self) {
        self.leader_term.store(-1, Ordering::SeqCst);
        self.write_caught_up.store(false, Ordering::SeqCst);

        // Pending writes fail fast so clients can retry at the new leader.
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send((
                503,
                json!({"message": "Not the leader anymore; retry at the new leader."}),
            ));
        }
        tracing::info!("Stepped down as leader");
    }

    fn on_configuration_committed(&self, peers: &[String]) {
        tracing::info!("Cluster configuration committed: {:?}", peers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::WriteOperation;
    use crate::indexer::WriteKind;
    use tempfile::TempDir;

    fn engine() -> (TempDir, Arc<ReplicatedEngine>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("db")).unwrap());
        let manager = Arc::new(CollectionManager::new(store.clone(), 1000));
        let indexer = Arc::new(BatchedIndexer::new(manager.clone(), store.clone(), 2));
        (dir, Arc::new(ReplicatedEngine::new(store, manager, indexer)))
    }

    #[test]
    fn test_log_entry_round_trip() {
        let entry = LogEntry {
            meta: RequestMeta {
                req_id: 5,
                log_index: 0,
                kind: WriteKind::WriteDocument {
                    collection: "books".into(),
                    action: "create".into(),
                },
            },
            chunk: br#"{"id": "0"}"#.to_vec(),
            is_last_chunk: true,
        };
        let encoded = serde_json::to_string(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.chunk, entry.chunk);
        assert_eq!(decoded.meta.req_id, 5);
        assert!(decoded.is_last_chunk);
    }

    #[test]
    fn test_chunk_codec_handles_binary() {
        for payload in [&b""[..], b"a", b"ab", b"abc", b"hello world \x00\xff"] {
            let entry = LogEntry {
                meta: RequestMeta {
                    req_id: 1,
                    log_index: 0,
                    kind: WriteKind::CreateCollection,
                },
                chunk: payload.to_vec(),
                is_last_chunk: false,
            };
            let encoded = serde_json::to_string(&entry).unwrap();
            let decoded: LogEntry = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded.chunk, payload);
        }
    }

    #[test]
    fn test_apply_advances_watermark_and_clears_marker() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("db")).unwrap());
        let manager = Arc::new(CollectionManager::new(store.clone(), 1000));
        let indexer = Arc::new(BatchedIndexer::new(manager.clone(), store.clone(), 2));
        let engine = ReplicatedEngine::new(store.clone(), manager, indexer);

        let entry = LogEntry {
            meta: RequestMeta {
                req_id: 1,
                log_index: 0,
                kind: WriteKind::CreateCollection,
            },
            chunk: br#"{"name": "books", "fields": [{"name": "t", "type": "string"}]}"#.to_vec(),
            is_last_chunk: true,
        };
        engine.apply(7, &entry).unwrap();
        assert_eq!(engine.applied_index(), 7);
        // A clean apply leaves no poison marker behind.
        assert!(store.scan("$XP").unwrap().is_empty());
    }

    #[test]
    fn test_leader_transitions() {
        let (_dir, engine) = engine();
        engine.on_leader_start(3);
        assert_eq!(engine.leader_term(), 3);
        assert!(engine.is_write_caught_up());

        let rx = engine.register_pending(99);
        engine.on_leader_stop();
        assert_eq!(engine.leader_term(), -1);
        let (code, _) = rx.blocking_recv().unwrap();
        assert_eq!(code, 503);
    }

    #[test]
    fn test_snapshot_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("db")).unwrap());
        let manager = Arc::new(CollectionManager::new(store.clone(), 1000));
        let indexer = Arc::new(BatchedIndexer::new(manager.clone(), store.clone(), 2));
        let engine = ReplicatedEngine::new(store, manager.clone(), indexer);

        manager
            .create_collection(&serde_json::json!({
                "name": "books",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": "points", "type": "int32"}
                ],
                "default_sorting_field": "points"
            }))
            .unwrap();
        for i in 0..50 {
            manager
                .add_document(
                    "books",
                    serde_json::json!({"id": i.to_string(), "title": format!("b{}", i), "points": i}),
                    WriteOperation::Create,
                )
                .unwrap();
        }
        engine.applied_index.store(50, Ordering::SeqCst);

        let snap_dir = dir.path().join("snapshot");
        let manifest = engine.on_snapshot_save(&snap_dir).unwrap();
        assert!(manifest.contains(&"state.json".to_string()));

        // Writes after the snapshot are rolled back by the restore.
        manager
            .add_document(
                "books",
                serde_json::json!({"id": "extra", "title": "extra", "points": 1}),
                WriteOperation::Create,
            )
            .unwrap();

        engine.on_snapshot_load(&snap_dir).unwrap();
        assert_eq!(engine.applied_index(), 50);
        let coll = manager.get_collection("books").unwrap();
        let coll = coll.read();
        assert_eq!(coll.indexes.num_documents(), 50);
        assert_eq!(coll.next_seq_id(), 50);
        assert_eq!(coll.seq_id_for("extra").unwrap(), None);
    }
}
