use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, Options, ReadOptions, SingleThreaded,
              WriteBatch, WriteBatchIterator};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

type DB = DBWithThreadMode<SingleThreaded>;

/// Key namespace prefixes. Each prefix's scan upper bound is the prefix with
/// its last byte bumped to the next codepoint (backtick for `_`).
pub const COLLECTION_ID_KEY: &str = "$CI";
pub const COLLECTION_META_PREFIX: &str = "$CM_";
pub const COLLECTION_NEXT_SEQ_PREFIX: &str = "$CN_";
pub const SYMLINK_PREFIX: &str = "$SL_";
pub const PRESET_PREFIX: &str = "$PS_";
pub const STOPWORDS_PREFIX: &str = "$SW_";
pub const STEMMER_DICT_PREFIX: &str = "$SD_";
pub const RAFT_LOG_PREFIX: &str = "$RL_";
pub const SKIP_INDEX_PREFIX: &str = "$XP";
pub const OVERRIDE_SET_PREFIX: &str = "$OISET_";
pub const ASYNC_REQ_PREFIX: &str = "$ADQ_";

// Reserved by the wire format for model registries; never written by the core.
pub const NL_SEARCH_MODEL_PREFIX: &str = "$NLSP_";
pub const PERSONALIZATION_MODEL_PREFIX: &str = "$PER_";

/// A single operation inside an atomic write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Put(String, String),
    Delete(String),
}

/// Scan upper bound for a prefix: last byte replaced by its successor.
pub fn seek_upper_bound(prefix: &str) -> Vec<u8> {
    let mut bound = prefix.as_bytes().to_vec();
    if let Some(last) = bound.last_mut() {
        *last += 1;
    }
    bound
}

/// Durable ordered byte-key/byte-value map backed by RocksDB.
///
/// Process-wide lifetime: opened once at boot, closed at shutdown. `reload`
/// swaps the live DB for a snapshot's contents, so the handle sits behind an
/// `Option`: the old instance must be dropped before the directory is
/// replaced.
pub struct Store {
    db: RwLock<Option<DB>>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

fn db_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(4);
    opts.optimize_level_style_compaction(512 * 1024 * 1024);
    opts.set_write_buffer_size(4 * 1024 * 1024);
    opts.set_max_write_buffer_number(2);
    opts.set_keep_log_file_num(5);
    opts
}

impl Store {
    pub fn new<P: AsRef<Path>>(state_dir: P) -> EngineResult<Self> {
        let path = state_dir.as_ref().to_path_buf();
        let db = DB::open(&db_options(), &path)
            .map_err(|e| EngineError::Fatal(format!("Failed to open store at {:?}: {}", path, e)))?;
        Ok(Self {
            db: RwLock::new(Some(db)),
            path,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> MappedRwLockReadGuard<'_, DB> {
        RwLockReadGuard::map(self.db.read(), |db| db.as_ref().expect("store is open"))
    }

    // ==================== Point Operations ====================

    pub fn insert(&self, key: &str, value: &str) -> EngineResult<()> {
        self.db().put(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    /// Three-way get: `Ok(Some)` found, `Ok(None)` not found, `Err` store failure.
    pub fn get(&self, key: &str) -> EngineResult<Option<String>> {
        match self.db().get(key.as_bytes())? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> EngineResult<bool> {
        Ok(self.db().get(key.as_bytes())?.is_some())
    }

    pub fn remove(&self, key: &str) -> EngineResult<()> {
        self.db().delete(key.as_bytes())?;
        Ok(())
    }

    // ==================== Batches & Ranges ====================

    /// Apply a list of puts/deletes atomically.
    pub fn batch_write(&self, ops: Vec<StoreOp>) -> EngineResult<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                StoreOp::Put(k, v) => batch.put(k.as_bytes(), v.as_bytes()),
                StoreOp::Delete(k) => batch.delete(k.as_bytes()),
            }
        }
        self.db().write(batch)?;
        Ok(())
    }

    /// Keys and values under `prefix`, in lexicographic key order, bounded by
    /// the prefix's upper bound.
    pub fn scan(&self, prefix: &str) -> EngineResult<Vec<(String, String)>> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_upper_bound(seek_upper_bound(prefix));
        let db = self.db();
        let iter = db.iterator_opt(
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
            read_opts,
        );

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        Ok(out)
    }

    /// Like `scan`, but stops after `limit` entries.
    pub fn scan_limit(&self, prefix: &str, limit: usize) -> EngineResult<Vec<(String, String)>> {
        let mut out = self.scan(prefix)?;
        out.truncate(limit);
        Ok(out)
    }

    pub fn delete_range(&self, begin: &str, end: &str) -> EngineResult<()> {
        let mut batch = WriteBatch::default();
        batch.delete_range(begin.as_bytes(), end.as_bytes());
        self.db().write(batch)?;
        Ok(())
    }

    pub fn compact_range(&self, begin: &str, end: &str) {
        self.db()
            .compact_range(Some(begin.as_bytes()), Some(end.as_bytes()));
    }

    pub fn compact_all(&self) {
        self.db().compact_range(None::<&[u8]>, None::<&[u8]>);
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.db().flush()?;
        Ok(())
    }

    // ==================== WAL / Sequence Access ====================

    pub fn get_latest_seq(&self) -> u64 {
        self.db().latest_sequence_number()
    }

    /// Write batches recorded at sequence numbers > `seq`, up to `max` batches.
    pub fn get_updates_since(
        &self,
        seq: u64,
        max: usize,
    ) -> EngineResult<Vec<(u64, Vec<StoreOp>)>> {
        let db = self.db();
        let iter = db
            .get_updates_since(seq)
            .map_err(|e| EngineError::Fatal(format!("WAL iterator failed: {}", e)))?;

        let mut batches = Vec::new();
        for item in iter {
            if batches.len() >= max {
                break;
            }
            let (batch_seq, batch) = item?;
            let mut collector = OpCollector::default();
            batch.iterate(&mut collector);
            batches.push((batch_seq, collector.ops));
        }
        Ok(batches)
    }

    // ==================== Snapshot / Restore ====================

    /// Produce a consistent on-disk snapshot of the DB at `path`.
    pub fn checkpoint<P: AsRef<Path>>(&self, path: P) -> EngineResult<()> {
        let db = self.db();
        let checkpoint = Checkpoint::new(&db)
            .map_err(|e| EngineError::Fatal(format!("Checkpoint init failed: {}", e)))?;
        checkpoint
            .create_checkpoint(path.as_ref())
            .map_err(|e| EngineError::Fatal(format!("Checkpoint failed: {}", e)))?;
        Ok(())
    }

    /// Replace the live DB with a snapshot's contents. The existing handle is
    /// dropped first so the directory can be cleared and repopulated.
    pub fn reload(&self, clear: bool, snapshot_path: &Path) -> EngineResult<()> {
        let mut guard = self.db.write();
        guard.take();

        if clear && self.path.exists() {
            std::fs::remove_dir_all(&self.path)
                .map_err(|e| EngineError::Fatal(format!("Failed to clear state dir: {}", e)))?;
        }
        copy_dir(snapshot_path, &self.path)
            .map_err(|e| EngineError::Fatal(format!("Failed to restore snapshot: {}", e)))?;

        let db = DB::open(&db_options(), &self.path)
            .map_err(|e| EngineError::Fatal(format!("Failed to reopen store: {}", e)))?;
        *guard = Some(db);
        Ok(())
    }

    /// Drop the DB handle. Any later operation panics; callers close last.
    pub fn close(&self) {
        self.db.write().take();
    }
}

#[derive(Default)]
struct OpCollector {
    ops: Vec<StoreOp>,
}

impl WriteBatchIterator for OpCollector {
    fn put(&mut self, key: Box<[u8]>, value: Box<[u8]>) {
        self.ops.push(StoreOp::Put(
            String::from_utf8_lossy(&key).into_owned(),
            String::from_utf8_lossy(&value).into_owned(),
        ));
    }

    fn delete(&mut self, key: Box<[u8]>) {
        self.ops
            .push(StoreOp::Delete(String::from_utf8_lossy(&key).into_owned()));
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
