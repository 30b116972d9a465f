use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::collection::{CollectionManager, WriteOperation};
use crate::error::{EngineError, EngineResult};
use crate::store::{seek_upper_bound, Store, ASYNC_REQ_PREFIX, RAFT_LOG_PREFIX, SKIP_INDEX_PREFIX};

const GC_INTERVAL_SECONDS: u64 = 60;
const GC_PRUNE_MAX_SECONDS: u64 = 3600;

/// What a replicated write does once its body is fully reassembled.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteKind {
    CreateCollection,
    DropCollection { name: String },
    ImportDocuments { collection: String, action: String },
    WriteDocument { collection: String, action: String },
    DeleteDocument { collection: String, id: String },
}

impl WriteKind {
    /// The collection whose queue serializes this write.
    fn collection_name(&self) -> Option<&str> {
        match self {
            WriteKind::CreateCollection => None,
            WriteKind::DropCollection { name } => Some(name),
            WriteKind::ImportDocuments { collection, .. }
            | WriteKind::WriteDocument { collection, .. } => Some(collection),
            WriteKind::DeleteDocument { collection, .. } => Some(collection),
        }
    }
}

/// Write request metadata; the body arrives separately, possibly chunked.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RequestMeta {
    pub req_id: u64,
    pub log_index: i64,
    pub kind: WriteKind,
}

pub type WriteResponse = (u16, Value);

/// One in-flight request: chunk reassembly state plus the response channel.
struct ReqRes {
    meta: RequestMeta,
    start_ts: u64,
    last_updated: u64,
    num_chunks: u32,
    next_chunk_index: u32,
    /// Partial trailing JSON line carried across chunk boundaries.
    prev_req_body: String,
    is_complete: bool,
    notify: Option<oneshot::Sender<WriteResponse>>,
}

impl ReqRes {
    fn state_json(&self) -> Value {
        json!({
            "req_id": self.meta.req_id,
            "log_index": self.meta.log_index,
            "kind": serde_json::to_value(&self.meta.kind).unwrap_or(Value::Null),
            "start_ts": self.start_ts,
            "last_updated": self.last_updated,
            "num_chunks": self.num_chunks,
            "next_chunk_index": self.next_chunk_index,
            "prev_req_body": self.prev_req_body,
            "is_complete": self.is_complete,
        })
    }
}

/// The batched indexer: per-worker queues keyed by collection name so that
/// writes to one collection (and its reference-related collections) apply in
/// log order, with chunk reassembly, GC and a snapshot pause window.
pub struct BatchedIndexer {
    manager: Arc<CollectionManager>,
    store: Arc<Store>,
    num_threads: usize,
    queues: Vec<Mutex<VecDeque<u64>>>,
    queue_of_collection: Mutex<HashMap<String, usize>>,
    req_res: Mutex<BTreeMap<u64, ReqRes>>,
    queued_writes: AtomicI64,
    quit: AtomicBool,
    pause: RwLock<()>,
    skip_indices: Mutex<BTreeSet<i64>>,
    skip_writes: AtomicBool,
    last_gc: Mutex<Instant>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl BatchedIndexer {
    pub fn new(manager: Arc<CollectionManager>, store: Arc<Store>, num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            manager,
            store,
            num_threads,
            queues: (0..num_threads).map(|_| Mutex::new(VecDeque::new())).collect(),
            queue_of_collection: Mutex::new(HashMap::new()),
            req_res: Mutex::new(BTreeMap::new()),
            queued_writes: AtomicI64::new(0),
            quit: AtomicBool::new(false),
            pause: RwLock::new(()),
            skip_indices: Mutex::new(BTreeSet::new()),
            skip_writes: AtomicBool::new(false),
            last_gc: Mutex::new(Instant::now()),
        }
    }

    pub fn get_queued_writes(&self) -> i64 {
        self.queued_writes.load(Ordering::SeqCst)
    }

    pub fn set_skip_writes(&self, skip: bool) {
        self.skip_writes.store(skip, Ordering::SeqCst);
    }

    /// The pause lock: workers drain under shared mode; snapshot serializes
    /// state under exclusive mode without blocking enqueues.
    pub fn pause_lock(&self) -> &RwLock<()> {
        &self.pause
    }

    fn chunk_key(req_id: u64, chunk_index: u32) -> String {
        format!("{}{}_{:06}", RAFT_LOG_PREFIX, req_id, chunk_index)
    }

    fn req_chunk_prefix(req_id: u64) -> String {
        format!("{}{}_", RAFT_LOG_PREFIX, req_id)
    }

    // ==================== Enqueue ====================

    /// Accept one chunk of a write request. The chunk body is persisted under
    /// `$RL_<req_id>_<chunk>`; when the final chunk arrives the request is
    /// queued onto its collection's worker.
    pub fn enqueue(
        &self,
        meta: RequestMeta,
        chunk: &[u8],
        is_last_chunk: bool,
        notify: Option<oneshot::Sender<WriteResponse>>,
    ) -> EngineResult<()> {
        self.store.insert(
            &Self::chunk_key(meta.req_id, {
                let req_res = self.req_res.lock();
                req_res
                    .get(&meta.req_id)
                    .map(|r| r.num_chunks)
                    .unwrap_or(0)
            }),
            &String::from_utf8_lossy(chunk),
        )?;

        let req_id = meta.req_id;
        let queue_target = {
            let mut req_res = self.req_res.lock();
            let entry = req_res.entry(req_id).or_insert_with(|| ReqRes {
                meta: meta.clone(),
                start_ts: now_secs(),
                last_updated: now_secs(),
                num_chunks: 0,
                next_chunk_index: 0,
                prev_req_body: String::new(),
                is_complete: false,
                notify: None,
            });
            entry.num_chunks += 1;
            entry.last_updated = now_secs();
            if notify.is_some() {
                entry.notify = notify;
            }
            is_last_chunk.then(|| {
                entry
                    .meta
                    .kind
                    .collection_name()
                    .unwrap_or("")
                    .to_string()
            })
        };

        if let Some(collection) = queue_target {
            let queue_id = self.queue_for(&collection);
            self.queues[queue_id].lock().push_back(req_id);
            self.queued_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Queue assignment: writes to one collection serialize on one queue, and
    /// collections joined by references coalesce onto the same queue via a
    /// transitive closure over the reference graph.
    fn queue_for(&self, collection: &str) -> usize {
        let mut assigned = self.queue_of_collection.lock();
        if let Some(queue_id) = assigned.get(collection) {
            return *queue_id;
        }

        let mut closure: BTreeSet<String> = BTreeSet::new();
        let mut frontier = vec![collection.to_string()];
        while let Some(name) = frontier.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            for neighbor in self.manager.reference_neighbors(&name) {
                if !closure.contains(&neighbor) {
                    frontier.push(neighbor);
                }
            }
        }

        let queue_id = closure
            .iter()
            .find_map(|member| assigned.get(member).copied())
            .unwrap_or_else(|| {
                use std::collections::hash_map::DefaultHasher;
                use std::hash::{Hash, Hasher};
                let mut hasher = DefaultHasher::new();
                collection.hash(&mut hasher);
                (hasher.finish() % self.num_threads as u64) as usize
            });
        for member in closure {
            assigned.insert(member, queue_id);
        }
        queue_id
    }

    // ==================== Drain Workers ====================

    /// Spawn the drain workers. Threads exit after `stop()`.
    pub fn run(self: Arc<Self>) -> Vec<std::thread::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.num_threads);
        for queue_id in 0..self.num_threads {
            let indexer = Arc::clone(&self);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("indexer-{}", queue_id))
                    .spawn(move || indexer.worker_loop(queue_id))
                    .expect("spawn indexer worker"),
            );
        }
        handles
    }

    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    fn worker_loop(&self, queue_id: usize) {
        while !self.quit.load(Ordering::SeqCst) {
            let next = self.queues[queue_id].lock().pop_front();
            let Some(req_id) = next else {
                if queue_id == 0 {
                    self.maybe_gc();
                }
                std::thread::sleep(Duration::from_millis(10));
                continue;
            };

            // Snapshot holds this exclusively while serializing state.
            let _pause = self.pause.read();
            self.queued_writes.fetch_sub(1, Ordering::SeqCst);

            let meta = {
                let req_res = self.req_res.lock();
                req_res.get(&req_id).map(|r| r.meta.clone())
            };
            let Some(meta) = meta else {
                continue;
            };

            // The marker stays on disk for the whole drain: a crash mid-apply
            // leaves it behind and the next boot skips this log index.
            if meta.log_index >= 0 {
                if let Err(e) = self.persist_applying_index(meta.log_index) {
                    tracing::error!("Failed to persist applying-index marker: {}", e);
                }
            }
            let response = self.apply_request(&meta, req_id);
            self.finish_request(req_id, response);
            if meta.log_index >= 0 {
                if let Err(e) = self.clear_applying_index(meta.log_index) {
                    tracing::error!("Failed to clear applying-index marker: {}", e);
                }
            }
        }
    }

    fn apply_request(&self, meta: &RequestMeta, req_id: u64) -> WriteResponse {
        if self.skip_writes.load(Ordering::SeqCst) {
            return (
                422,
                json!({"message": "Skipping write as `skip-writes` is enabled on this node."}),
            );
        }
        if meta.log_index >= 0 && self.skip_indices.lock().contains(&meta.log_index) {
            tracing::warn!(
                "Skipping write at log index {} due to a persisted skip marker",
                meta.log_index
            );
            return (422, json!({"message": "Write skipped."}));
        }

        let chunks = match self.store.scan(&Self::req_chunk_prefix(req_id)) {
            Ok(chunks) => chunks,
            Err(e) => return (500, json!({"message": e.to_string()})),
        };

        match &meta.kind {
            WriteKind::CreateCollection => {
                let body = chunks.iter().map(|(_, v)| v.as_str()).collect::<String>();
                match serde_json::from_str::<Value>(&body)
                    .map_err(EngineError::from)
                    .and_then(|schema| self.manager.create_collection(&schema))
                {
                    Ok(summary) => (201, summary),
                    Err(e) => (e.code(), json!({"message": e.to_string()})),
                }
            }
            WriteKind::DropCollection { name } => {
                match self.manager.drop_collection(name, true, false) {
                    Ok(summary) => (200, summary),
                    Err(e) => (e.code(), json!({"message": e.to_string()})),
                }
            }
            WriteKind::WriteDocument { collection, action } => {
                let body = chunks.iter().map(|(_, v)| v.as_str()).collect::<String>();
                let result = WriteOperation::parse(action)
                    .and_then(|op| {
                        serde_json::from_str::<Value>(&body)
                            .map_err(EngineError::from)
                            .and_then(|doc| self.manager.add_document(collection, doc, op))
                    });
                match result {
                    Ok(doc) => (201, doc),
                    Err(e) => (e.code(), json!({"message": e.to_string()})),
                }
            }
            WriteKind::DeleteDocument { collection, id } => {
                match self.manager.delete_document(collection, id) {
                    Ok(doc) => (200, doc),
                    Err(e) => (e.code(), json!({"message": e.to_string()})),
                }
            }
            WriteKind::ImportDocuments { collection, action } => {
                self.apply_import(collection, action, req_id, &chunks)
            }
        }
    }

    /// JSON-lines import: lines are stitched across chunk boundaries through
    /// `prev_req_body`, each complete line dispatched as one document write.
    fn apply_import(
        &self,
        collection: &str,
        action: &str,
        req_id: u64,
        chunks: &[(String, String)],
    ) -> WriteResponse {
        let op = match WriteOperation::parse(action) {
            Ok(op) => op,
            Err(e) => return (e.code(), json!({"message": e.to_string()})),
        };

        let mut results: Vec<Value> = Vec::new();
        let mut num_imported = 0usize;
        let mut dispatch = |line: &str| {
            let line = line.trim();
            if line.is_empty() {
                return;
            }
            let outcome = serde_json::from_str::<Value>(line)
                .map_err(EngineError::from)
                .and_then(|doc| self.manager.add_document(collection, doc, op));
            match outcome {
                Ok(_) => {
                    num_imported += 1;
                    results.push(json!({"success": true}));
                }
                Err(e) => {
                    results.push(json!({
                        "success": false,
                        "error": e.to_string(),
                        "code": e.code(),
                        "document": line,
                    }));
                }
            }
        };

        for (chunk_index, (_, chunk)) in chunks.iter().enumerate() {
            let is_final = chunk_index == chunks.len() - 1;
            let stitched = {
                let mut req_res = self.req_res.lock();
                let prev = req_res
                    .get_mut(&req_id)
                    .map(|entry| std::mem::take(&mut entry.prev_req_body))
                    .unwrap_or_default();
                format!("{}{}", prev, chunk)
            };

            let mut lines: Vec<&str> = stitched.split('\n').collect();
            let tail = if is_final {
                None
            } else {
                lines.pop().map(String::from)
            };
            for line in lines {
                dispatch(line);
            }
            if let Some(tail) = tail {
                let mut req_res = self.req_res.lock();
                if let Some(entry) = req_res.get_mut(&req_id) {
                    entry.prev_req_body = tail;
                    entry.next_chunk_index = chunk_index as u32 + 1;
                }
            }
        }

        let success = results.iter().all(|r| r["success"] == json!(true));
        (
            200,
            json!({
                "success": success,
                "num_imported": num_imported,
                "results": results,
            }),
        )
    }

    fn finish_request(&self, req_id: u64, response: WriteResponse) {
        // Completed chunks are no longer needed.
        let prefix = Self::req_chunk_prefix(req_id);
        let upper = String::from_utf8_lossy(&seek_upper_bound(&prefix)).into_owned();
        if let Err(e) = self.store.delete_range(&prefix, &upper) {
            tracing::error!("Failed to prune chunks of request {}: {}", req_id, e);
        }

        // Terminal status record for later polling.
        let status = json!({
            "code": response.0,
            "message": response.1,
            "finished_at": now_secs(),
        });
        if let Err(e) = self
            .store
            .insert(&format!("{}{}", ASYNC_REQ_PREFIX, req_id), &status.to_string())
        {
            tracing::error!("Failed to persist status of request {}: {}", req_id, e);
        }

        let notify = {
            let mut req_res = self.req_res.lock();
            match req_res.get_mut(&req_id) {
                Some(entry) => {
                    entry.is_complete = true;
                    entry.last_updated = now_secs();
                    entry.notify.take()
                }
                None => None,
            }
        };
        if let Some(tx) = notify {
            let _ = tx.send(response);
        }
    }

    /// Terminal status of a request, if it has completed.
    pub fn request_status(&self, req_id: u64) -> EngineResult<Option<Value>> {
        match self.store.get(&format!("{}{}", ASYNC_REQ_PREFIX, req_id))? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    // ==================== GC ====================

    /// Once a minute, prune completed requests older than an hour.
    fn maybe_gc(&self) {
        {
            let mut last_gc = self.last_gc.lock();
            if last_gc.elapsed().as_secs() < GC_INTERVAL_SECONDS {
                return;
            }
            *last_gc = Instant::now();
        }
        let cutoff = now_secs().saturating_sub(GC_PRUNE_MAX_SECONDS);
        let mut req_res = self.req_res.lock();
        let before = req_res.len();
        req_res.retain(|_, entry| !(entry.is_complete && entry.last_updated < cutoff));
        let pruned = before - req_res.len();
        if pruned > 0 {
            tracing::info!("Pruned {} completed write request(s)", pruned);
        }
    }

    // ==================== Skip Index ====================

    /// Record the log index about to be applied; a crash during apply leaves
    /// this marker behind so the next boot can bypass the poison record.
    pub fn persist_applying_index(&self, log_index: i64) -> EngineResult<()> {
        self.store
            .insert(&format!("{}{}", SKIP_INDEX_PREFIX, log_index), "")
    }

    /// Clear the marker after a clean apply.
    pub fn clear_applying_index(&self, log_index: i64) -> EngineResult<()> {
        self.store
            .remove(&format!("{}{}", SKIP_INDEX_PREFIX, log_index))
    }

    /// Load persisted skip markers (crash leftovers) at boot.
    pub fn populate_skip_index(&self) -> EngineResult<()> {
        let mut skip = self.skip_indices.lock();
        for (key, _) in self.store.scan(SKIP_INDEX_PREFIX)? {
            if let Ok(index) = key[SKIP_INDEX_PREFIX.len()..].parse::<i64>() {
                tracing::warn!("Will skip replaying log index {} (poison marker)", index);
                skip.insert(index);
            }
        }
        Ok(())
    }

    pub fn clear_skip_indices(&self) -> EngineResult<()> {
        self.skip_indices.lock().clear();
        let upper = String::from_utf8_lossy(&seek_upper_bound(SKIP_INDEX_PREFIX)).into_owned();
        self.store.delete_range(SKIP_INDEX_PREFIX, &upper)
    }

    // ==================== Snapshot State ====================

    /// Serialize in-flight request state. The caller must hold the pause lock
    /// exclusively.
    pub fn serialize_state(&self) -> Value {
        let req_res = self.req_res.lock();
        json!({
            "queued_writes": self.queued_writes.load(Ordering::SeqCst),
            "req_res_map": req_res.values().map(ReqRes::state_json).collect::<Vec<_>>(),
        })
    }

    pub fn load_state(&self, state: &Value) {
        let mut req_res = self.req_res.lock();
        req_res.clear();
        for entry in state
            .get("req_res_map")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(meta) = entry.get("kind").and_then(|kind| {
                Some(RequestMeta {
                    req_id: entry.get("req_id")?.as_u64()?,
                    log_index: entry.get("log_index")?.as_i64()?,
                    kind: serde_json::from_value(kind.clone()).ok()?,
                })
            }) else {
                tracing::warn!("Skipping corrupt indexer state entry");
                continue;
            };
            let req_id = meta.req_id;
            req_res.insert(
                req_id,
                ReqRes {
                    meta,
                    start_ts: entry.get("start_ts").and_then(Value::as_u64).unwrap_or(0),
                    last_updated: entry
                        .get("last_updated")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    num_chunks: entry.get("num_chunks").and_then(Value::as_u64).unwrap_or(0)
                        as u32,
                    next_chunk_index: entry
                        .get("next_chunk_index")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32,
                    prev_req_body: entry
                        .get("prev_req_body")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    is_complete: entry
                        .get("is_complete")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    notify: None,
                },
            );
        }
        self.queued_writes.store(
            state
                .get("queued_writes")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            Ordering::SeqCst,
        );
    }
}
