use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::{json, Value};

use super::curation::{Override, Synonym};
use super::{Collection, WriteOperation};
use crate::error::{EngineError, EngineResult};
use crate::filter::eval_filter;
use crate::schema::CollectionSchema;
use crate::search::{self, SearchParams};
use crate::store::{
    seek_upper_bound, Store, StoreOp, COLLECTION_ID_KEY, COLLECTION_META_PREFIX, OVERRIDE_SET_PREFIX,
    PRESET_PREFIX, STEMMER_DICT_PREFIX, STOPWORDS_PREFIX, SYMLINK_PREFIX,
};

/// Synonym records are persisted next to the collection meta namespace.
pub const SYNONYM_PREFIX: &str = "$SYN_";

/// Raw-JSON bytes accumulated during load are multiplied by this factor to
/// estimate peak indexing memory; the batch flushes at ~250 MiB.
const LOAD_MEM_FACTOR: usize = 7;
const LOAD_MEM_CEILING: usize = 250 * 1024 * 1024;

/// A short-lived handle to a collection. Readers take the inner lock in
/// shared mode; schema mutations take it exclusively. Handlers must release
/// the handle before operations that take the manager's own write lock.
#[derive(Clone)]
pub struct LockedCollection {
    inner: Arc<RwLock<Collection>>,
}

impl LockedCollection {
    pub fn read(&self) -> RwLockReadGuard<'_, Collection> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Collection> {
        self.inner.write()
    }
}

/// Owns every collection plus the process-wide symlink, preset, stopword and
/// stemmer-dictionary tables. Constructed once from `main` and passed by
/// reference into request handlers.
pub struct CollectionManager {
    store: Arc<Store>,
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
    symlinks: RwLock<HashMap<String, String>>,
    presets: RwLock<HashMap<String, Value>>,
    stopword_sets: RwLock<HashMap<String, HashSet<String>>>,
    stem_dictionaries: RwLock<HashMap<String, HashMap<String, String>>>,
    /// Forward references to collections that do not exist yet, keyed by the
    /// awaited collection's name.
    reference_backlog: Mutex<HashMap<String, Vec<String>>>,
    next_collection_id: AtomicU32,
    load_batch_size: usize,
}

impl CollectionManager {
    pub fn new(store: Arc<Store>, load_batch_size: usize) -> Self {
        Self {
            store,
            collections: RwLock::new(HashMap::new()),
            symlinks: RwLock::new(HashMap::new()),
            presets: RwLock::new(HashMap::new()),
            stopword_sets: RwLock::new(HashMap::new()),
            stem_dictionaries: RwLock::new(HashMap::new()),
            reference_backlog: Mutex::new(HashMap::new()),
            next_collection_id: AtomicU32::new(0),
            load_batch_size: load_batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ==================== Lifecycle ====================

    pub fn create_collection(&self, body: &Value) -> EngineResult<Value> {
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ClientError("Collection `name` is required.".into()))?
            .to_string();

        {
            let collections = self.collections.read();
            if collections.contains_key(&name) {
                return Err(EngineError::Conflict(format!(
                    "A collection with name `{}` already exists.",
                    name
                )));
            }
        }
        if self.symlinks.read().contains_key(&name) {
            return Err(EngineError::Conflict(format!(
                "An alias with name `{}` already exists.",
                name
            )));
        }

        let id = self.next_collection_id.fetch_add(1, Ordering::SeqCst);
        let schema = CollectionSchema::from_create_request(id, body)?;

        self.store.batch_write(vec![
            StoreOp::Put(Collection::meta_key(&name), schema.to_meta_json().to_string()),
            StoreOp::Put(Collection::next_seq_key(&name), "0".to_string()),
            StoreOp::Put(COLLECTION_ID_KEY.to_string(), (id + 1).to_string()),
        ])?;

        let mut collection = Collection::new(self.store.clone(), schema, 0);
        collection.analyzer.stem_dictionaries = self.stem_dictionaries.read().clone();

        // Wire references: forward edges now, queued edges for collections
        // that do not exist yet.
        let targets: Vec<String> = collection
            .schema
            .reference_fields()
            .filter_map(|f| {
                f.reference
                    .as_deref()
                    .and_then(|r| r.split_once('.'))
                    .map(|(c, _)| c.to_string())
            })
            .collect();
        for target in targets {
            let collections = self.collections.read();
            match collections.get(&target) {
                Some(existing) => {
                    existing.write().referenced_in.insert(name.clone());
                }
                None => {
                    self.reference_backlog
                        .lock()
                        .entry(target)
                        .or_default()
                        .push(name.clone());
                }
            }
        }

        // Drain the backlog waiting for this collection.
        if let Some(waiting) = self.reference_backlog.lock().remove(&name) {
            for waiter in waiting {
                collection.referenced_in.insert(waiter);
            }
        }

        let summary = collection.summary_json();
        self.collections
            .write()
            .insert(name, Arc::new(RwLock::new(collection)));
        Ok(summary)
    }

    pub fn drop_collection(
        &self,
        name: &str,
        remove_from_store: bool,
        compact: bool,
    ) -> EngineResult<Value> {
        let handle = {
            let mut collections = self.collections.write();
            collections.remove(name).ok_or_else(|| {
                EngineError::NotFound(format!("No collection with name `{}` found.", name))
            })?
        };
        let collection = handle.read();
        let summary = collection.summary_json();
        let collection_id = collection.schema.id;
        drop(collection);

        if remove_from_store {
            let doc_prefix = format!("{}_", collection_id);
            let upper = String::from_utf8_lossy(&seek_upper_bound(&doc_prefix)).into_owned();
            self.store.delete_range(&doc_prefix, &upper)?;
            self.store.batch_write(vec![
                StoreOp::Delete(Collection::meta_key(name)),
                StoreOp::Delete(Collection::next_seq_key(name)),
                StoreOp::Delete(format!("{}{}", OVERRIDE_SET_PREFIX, name)),
                StoreOp::Delete(format!("{}{}", SYNONYM_PREFIX, name)),
            ])?;
            if compact {
                self.store.compact_range(&doc_prefix, &upper);
            }
        }

        // Drop the reverse edges this collection held in others.
        for other in self.collections.read().values() {
            other.write().referenced_in.remove(name);
        }

        Ok(summary)
    }

    /// Resolve a name (following one symlink hop) to a collection handle.
    pub fn get_collection(&self, name: &str) -> Option<LockedCollection> {
        let collections = self.collections.read();
        if let Some(found) = collections.get(name) {
            return Some(LockedCollection {
                inner: found.clone(),
            });
        }
        let target = self.symlinks.read().get(name)?.clone();
        collections.get(&target).map(|found| LockedCollection {
            inner: found.clone(),
        })
    }

    pub fn list_collections(&self) -> Vec<Value> {
        let mut out: Vec<(i64, Value)> = self
            .collections
            .read()
            .values()
            .map(|handle| {
                let coll = handle.read();
                (coll.schema.created_at, coll.summary_json())
            })
            .collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        out.into_iter().map(|(_, v)| v).collect()
    }

    /// Clone a collection's schema, synonyms and overrides under a new name.
    /// Documents are not copied.
    pub fn clone_collection(&self, src_name: &str, body: &Value) -> EngineResult<Value> {
        let new_name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ClientError("Collection `name` is required.".into()))?;

        let (mut meta, synonyms, overrides) = {
            let src = self.get_collection(src_name).ok_or_else(|| {
                EngineError::NotFound(format!("No collection with name `{}` found.", src_name))
            })?;
            let src = src.read();
            (
                src.schema.to_meta_json(),
                src.synonyms.clone(),
                src.overrides.clone(),
            )
        };

        if let Some(obj) = meta.as_object_mut() {
            obj.insert("name".into(), json!(new_name));
            obj.remove("id");
            obj.remove("created_at");
        }
        let summary = self.create_collection(&meta)?;

        if let Some(created) = self.get_collection(new_name) {
            let mut coll = created.write();
            coll.synonyms = synonyms;
            coll.overrides = overrides;
            let name = coll.name().to_string();
            let synonyms_json: Vec<Value> = coll.synonyms.iter().map(Synonym::to_json).collect();
            let overrides_json: Vec<Value> = coll.overrides.iter().map(Override::to_json).collect();
            drop(coll);
            self.store.batch_write(vec![
                StoreOp::Put(
                    format!("{}{}", SYNONYM_PREFIX, name),
                    Value::Array(synonyms_json).to_string(),
                ),
                StoreOp::Put(
                    format!("{}{}", OVERRIDE_SET_PREFIX, name),
                    Value::Array(overrides_json).to_string(),
                ),
            ])?;
        }
        Ok(summary)
    }

    /// Alter a collection's schema: add fields, drop fields, then rebuild the
    /// in-memory indexes from the stored documents.
    pub fn alter_collection(&self, name: &str, body: &Value) -> EngineResult<Value> {
        let handle = self.get_collection(name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", name))
        })?;
        let mut coll = handle.write();

        let field_values = body
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::ClientError("`fields` must be an array.".into()))?;

        for field_value in field_values {
            let field_name = field_value
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::ClientError("Field `name` is required.".into()))?;
            if field_value.get("drop").and_then(Value::as_bool) == Some(true) {
                if !coll.schema.remove_field(field_name) {
                    return Err(EngineError::NotFound(format!(
                        "Field `{}` is not part of the schema.",
                        field_name
                    )));
                }
            } else {
                if coll.schema.field(field_name).is_some() {
                    return Err(EngineError::ClientError(format!(
                        "Field `{}` is already part of the schema.",
                        field_name
                    )));
                }
                let field = crate::schema::Field::from_json(field_value)?;
                coll.schema.fields.push(field);
            }
        }

        self.store.insert(
            &Collection::meta_key(name),
            &coll.schema.to_meta_json().to_string(),
        )?;

        // Rebuild the indexes so dropped fields disappear and added fields
        // cover the existing documents.
        coll.indexes = crate::index::CollectionIndexes::new();
        let docs = coll.stored_docs()?;
        for (seq_id, doc, _) in docs {
            coll.index_in_memory(seq_id, &doc)?;
        }

        Ok(coll.summary_json())
    }

    // ==================== Symlinks, Presets, Stopwords, Stemmers ====================

    pub fn upsert_symlink(&self, alias: &str, target: &str) -> EngineResult<()> {
        if self.collections.read().contains_key(alias) {
            return Err(EngineError::Conflict(format!(
                "A collection with name `{}` already exists.",
                alias
            )));
        }
        self.store
            .insert(&format!("{}{}", SYMLINK_PREFIX, alias), target)?;
        self.symlinks
            .write()
            .insert(alias.to_string(), target.to_string());
        Ok(())
    }

    pub fn delete_symlink(&self, alias: &str) -> EngineResult<()> {
        if self.symlinks.write().remove(alias).is_none() {
            return Err(EngineError::NotFound(format!(
                "Could not find an alias named `{}`.",
                alias
            )));
        }
        self.store.remove(&format!("{}{}", SYMLINK_PREFIX, alias))
    }

    pub fn list_symlinks(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .symlinks
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn get_symlink(&self, alias: &str) -> Option<String> {
        self.symlinks.read().get(alias).cloned()
    }

    pub fn upsert_preset(&self, name: &str, value: &Value) -> EngineResult<()> {
        if !value.is_object() {
            return Err(EngineError::ClientError(
                "A preset must be a JSON object of search parameters.".into(),
            ));
        }
        self.store
            .insert(&format!("{}{}", PRESET_PREFIX, name), &value.to_string())?;
        self.presets
            .write()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    pub fn delete_preset(&self, name: &str) -> EngineResult<()> {
        if self.presets.write().remove(name).is_none() {
            return Err(EngineError::NotFound(format!(
                "Could not find a preset named `{}`.",
                name
            )));
        }
        self.store.remove(&format!("{}{}", PRESET_PREFIX, name))
    }

    pub fn get_preset(&self, name: &str) -> Option<Value> {
        self.presets.read().get(name).cloned()
    }

    pub fn list_presets(&self) -> Vec<(String, Value)> {
        let mut out: Vec<(String, Value)> = self
            .presets
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn upsert_stopwords(&self, name: &str, words: &[String]) -> EngineResult<()> {
        let set: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
        self.store.insert(
            &format!("{}{}", STOPWORDS_PREFIX, name),
            &json!({ "stopwords": words }).to_string(),
        )?;
        self.stopword_sets.write().insert(name.to_string(), set);
        Ok(())
    }

    pub fn delete_stopwords(&self, name: &str) -> EngineResult<()> {
        if self.stopword_sets.write().remove(name).is_none() {
            return Err(EngineError::NotFound(format!(
                "Could not find a stopwords set named `{}`.",
                name
            )));
        }
        self.store.remove(&format!("{}{}", STOPWORDS_PREFIX, name))
    }

    pub fn get_stopwords(&self, name: &str) -> Option<HashSet<String>> {
        self.stopword_sets.read().get(name).cloned()
    }

    pub fn upsert_stem_dictionary(
        &self,
        name: &str,
        entries: HashMap<String, String>,
    ) -> EngineResult<()> {
        self.store.insert(
            &format!("{}{}", STEMMER_DICT_PREFIX, name),
            &serde_json::to_string(&entries)
                .map_err(|e| EngineError::Fatal(format!("Stemmer dictionary encode: {}", e)))?,
        )?;
        self.stem_dictionaries
            .write()
            .insert(name.to_string(), entries);
        // Collections pick up dictionary changes on their next write; refresh
        // the analyzers eagerly so reads see them too.
        let dicts = self.stem_dictionaries.read().clone();
        for handle in self.collections.read().values() {
            handle.write().analyzer.stem_dictionaries = dicts.clone();
        }
        Ok(())
    }

    // ==================== Curation Persistence ====================

    pub fn upsert_override(&self, coll_name: &str, ov: Override) -> EngineResult<()> {
        let handle = self.get_collection(coll_name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", coll_name))
        })?;
        let mut coll = handle.write();
        coll.overrides.retain(|existing| existing.id != ov.id);
        coll.overrides.push(ov);
        let payload: Vec<Value> = coll.overrides.iter().map(Override::to_json).collect();
        let name = coll.name().to_string();
        drop(coll);
        self.store.insert(
            &format!("{}{}", OVERRIDE_SET_PREFIX, name),
            &Value::Array(payload).to_string(),
        )
    }

    pub fn delete_override(&self, coll_name: &str, override_id: &str) -> EngineResult<()> {
        let handle = self.get_collection(coll_name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", coll_name))
        })?;
        let mut coll = handle.write();
        let before = coll.overrides.len();
        coll.overrides.retain(|existing| existing.id != override_id);
        if coll.overrides.len() == before {
            return Err(EngineError::NotFound(format!(
                "Could not find an override with id `{}`.",
                override_id
            )));
        }
        let payload: Vec<Value> = coll.overrides.iter().map(Override::to_json).collect();
        let name = coll.name().to_string();
        drop(coll);
        self.store.insert(
            &format!("{}{}", OVERRIDE_SET_PREFIX, name),
            &Value::Array(payload).to_string(),
        )
    }

    pub fn upsert_synonym(&self, coll_name: &str, synonym: Synonym) -> EngineResult<()> {
        let handle = self.get_collection(coll_name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", coll_name))
        })?;
        let mut coll = handle.write();
        coll.synonyms.retain(|existing| existing.id != synonym.id);
        coll.synonyms.push(synonym);
        let payload: Vec<Value> = coll.synonyms.iter().map(Synonym::to_json).collect();
        let name = coll.name().to_string();
        drop(coll);
        self.store.insert(
            &format!("{}{}", SYNONYM_PREFIX, name),
            &Value::Array(payload).to_string(),
        )
    }

    // ==================== Boot Load ====================

    /// Boot protocol: read the collection-id counter, construct every
    /// collection from its meta record in parallel, replay documents in
    /// batches bounded by count and estimated memory, then wire references
    /// and load the auxiliary tables.
    pub fn load(&self) -> EngineResult<()> {
        if let Some(raw) = self.store.get(COLLECTION_ID_KEY)? {
            let next = raw.parse::<u32>().map_err(|_| {
                EngineError::Fatal("Corrupt collection id counter.".into())
            })?;
            self.next_collection_id.store(next, Ordering::SeqCst);
        }

        // Auxiliary tables load first so analyzers see stemmer dictionaries.
        self.load_auxiliary_tables()?;

        let metas = self.store.scan(COLLECTION_META_PREFIX)?;
        let loaded: Vec<EngineResult<(String, Collection)>> = {
            use rayon::prelude::*;
            metas
                .par_iter()
                .map(|(_, raw)| self.load_one_collection(raw))
                .collect()
        };

        let mut collections = self.collections.write();
        for result in loaded {
            match result {
                Ok((name, collection)) => {
                    collections.insert(name, Arc::new(RwLock::new(collection)));
                }
                Err(e) => {
                    tracing::error!("Failed to load a collection: {}", e);
                    return Err(e);
                }
            }
        }
        drop(collections);

        // Rebuild the derived `referenced_in` edges from the forward data.
        let edges: Vec<(String, String)> = {
            let collections = self.collections.read();
            collections
                .iter()
                .flat_map(|(name, handle)| {
                    let coll = handle.read();
                    coll.schema
                        .reference_fields()
                        .filter_map(|f| {
                            f.reference
                                .as_deref()
                                .and_then(|r| r.split_once('.'))
                                .map(|(target, _)| (target.to_string(), name.clone()))
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (target, source) in edges {
            match self.get_collection(&target) {
                Some(handle) => {
                    handle.write().referenced_in.insert(source);
                }
                None => {
                    self.reference_backlog
                        .lock()
                        .entry(target)
                        .or_default()
                        .push(source);
                }
            }
        }

        tracing::info!(
            "Loaded {} collection(s) from the store",
            self.collections.read().len()
        );
        Ok(())
    }

    fn load_one_collection(&self, meta_raw: &str) -> EngineResult<(String, Collection)> {
        let meta: Value = serde_json::from_str(meta_raw)
            .map_err(|e| EngineError::Fatal(format!("Corrupt collection meta: {}", e)))?;
        let schema = CollectionSchema::from_meta_json(&meta)?;
        let name = schema.name.clone();

        let next_seq = self
            .store
            .get(&Collection::next_seq_key(&name))?
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(0);

        let mut collection = Collection::new(self.store.clone(), schema, next_seq);
        collection.analyzer.stem_dictionaries = self.stem_dictionaries.read().clone();

        // Replay documents with the dynamic flush threshold: batch count or
        // raw bytes x factor, whichever trips first.
        let mut batch: Vec<(u32, serde_json::Map<String, Value>)> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut total = 0usize;
        for (seq_id, doc, raw_len) in collection.stored_docs()? {
            batch.push((seq_id, doc));
            batch_bytes += raw_len;
            if batch.len() >= self.load_batch_size || batch_bytes * LOAD_MEM_FACTOR >= LOAD_MEM_CEILING
            {
                for (seq_id, doc) in batch.drain(..) {
                    collection.index_in_memory(seq_id, &doc)?;
                    total += 1;
                }
                batch_bytes = 0;
            }
        }
        for (seq_id, doc) in batch.drain(..) {
            collection.index_in_memory(seq_id, &doc)?;
            total += 1;
        }

        // Curation records: a corrupt row is logged and skipped, never fatal.
        if let Some(raw) = self.store.get(&format!("{}{}", SYNONYM_PREFIX, name))? {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(items)) => {
                    for item in items {
                        let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
                        match Synonym::from_json(id, &item) {
                            Ok(synonym) => collection.synonyms.push(synonym),
                            Err(e) => tracing::warn!("Skipping corrupt synonym in `{}`: {}", name, e),
                        }
                    }
                }
                _ => tracing::warn!("Skipping corrupt synonym set for `{}`", name),
            }
        }
        if let Some(raw) = self.store.get(&format!("{}{}", OVERRIDE_SET_PREFIX, name))? {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(items)) => {
                    for item in items {
                        let id = item.get("id").and_then(Value::as_str).unwrap_or_default();
                        match Override::from_json(id, &item) {
                            Ok(ov) => collection.overrides.push(ov),
                            Err(e) => {
                                tracing::warn!("Skipping corrupt override in `{}`: {}", name, e)
                            }
                        }
                    }
                }
                _ => tracing::warn!("Skipping corrupt override set for `{}`", name),
            }
        }

        tracing::info!("Loaded collection `{}` with {} document(s)", name, total);
        Ok((name, collection))
    }

    fn load_auxiliary_tables(&self) -> EngineResult<()> {
        for (key, target) in self.store.scan(SYMLINK_PREFIX)? {
            let alias = key[SYMLINK_PREFIX.len()..].to_string();
            self.symlinks.write().insert(alias, target);
        }
        for (key, raw) in self.store.scan(PRESET_PREFIX)? {
            let name = key[PRESET_PREFIX.len()..].to_string();
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.presets.write().insert(name, value);
                }
                Err(e) => tracing::warn!("Skipping corrupt preset `{}`: {}", name, e),
            }
        }
        for (key, raw) in self.store.scan(STOPWORDS_PREFIX)? {
            let name = key[STOPWORDS_PREFIX.len()..].to_string();
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    let words: HashSet<String> = value
                        .get("stopwords")
                        .and_then(Value::as_array)
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_lowercase)
                                .collect()
                        })
                        .unwrap_or_default();
                    self.stopword_sets.write().insert(name, words);
                }
                Err(e) => tracing::warn!("Skipping corrupt stopwords set `{}`: {}", name, e),
            }
        }
        for (key, raw) in self.store.scan(STEMMER_DICT_PREFIX)? {
            let name = key[STEMMER_DICT_PREFIX.len()..].to_string();
            match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(entries) => {
                    self.stem_dictionaries.write().insert(name, entries);
                }
                Err(e) => tracing::warn!("Skipping corrupt stemmer dictionary `{}`: {}", name, e),
            }
        }
        Ok(())
    }

    // ==================== Writes ====================

    /// Neighbors in the reference graph (both directions), used by the
    /// batched indexer to coalesce related collections onto one queue.
    pub fn reference_neighbors(&self, name: &str) -> Vec<String> {
        let Some(handle) = self.get_collection(name) else {
            return Vec::new();
        };
        let coll = handle.read();
        let mut out: Vec<String> = coll.referenced_in.iter().cloned().collect();
        out.extend(coll.schema.reference_fields().filter_map(|f| {
            f.reference
                .as_deref()
                .and_then(|r| r.split_once('.'))
                .map(|(target, _)| target.to_string())
        }));
        out
    }

    /// Reference resolver closure for document writes.
    fn resolve_foreign_id(&self, coll_name: &str, id: &str) -> EngineResult<Option<u32>> {
        match self.get_collection(coll_name) {
            Some(handle) => handle.read().seq_id_for(id),
            None => Ok(None),
        }
    }

    pub fn add_document(
        &self,
        coll_name: &str,
        doc: Value,
        op: WriteOperation,
    ) -> EngineResult<Value> {
        let handle = self.get_collection(coll_name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", coll_name))
        })?;
        let resolver =
            |foreign: &str, id: &str| -> EngineResult<Option<u32>> { self.resolve_foreign_id(foreign, id) };
        handle.write().add(doc, op, &resolver)
    }

    pub fn delete_document(&self, coll_name: &str, id: &str) -> EngineResult<Value> {
        let handle = self.get_collection(coll_name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", coll_name))
        })?;
        handle.write().remove_document(id)
    }

    /// Periodic vector-index rebuild: each HNSW graph re-inserts its live
    /// points into a fresh graph and swaps it in. Runs off the 30s wake.
    pub fn rebuild_vector_indexes(&self) {
        let handles: Vec<Arc<RwLock<Collection>>> =
            self.collections.read().values().cloned().collect();
        for handle in handles {
            let vectors: Vec<Arc<crate::index::HnswIndex>> = handle
                .read()
                .indexes
                .vector
                .values()
                .cloned()
                .collect();
            for index in vectors {
                index.rebuild();
            }
        }
    }

    // ==================== Search ====================

    /// Merge precedence: embedded parameters override the request; preset
    /// parameters fill gaps non-destructively; then parse and dispatch.
    pub fn do_search(
        &self,
        raw_params: BTreeMap<String, String>,
        embedded_params: BTreeMap<String, String>,
        coll_name: &str,
        start_ts: Instant,
    ) -> EngineResult<Value> {
        let mut merged = raw_params;
        if let Some(preset_name) = merged.get("preset").cloned() {
            if let Some(preset) = self.get_preset(&preset_name) {
                if let Some(obj) = preset.as_object() {
                    for (key, value) in obj {
                        let as_string = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        merged.entry(key.clone()).or_insert(as_string);
                    }
                }
            }
        }
        for (key, value) in embedded_params {
            merged.insert(key, value);
        }

        let params = SearchParams::from_map(&merged)?;
        let stopword_set = if params.stopwords.is_empty() {
            None
        } else {
            self.get_stopwords(&params.stopwords)
        };

        let handle = self.get_collection(coll_name).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", coll_name))
        })?;
        let coll = handle.read();
        search::execute(&coll, Some(self), &params, stopword_set.as_ref(), start_ts)
    }

    /// Union search: every sub-search contributes hits into one merged,
    /// re-sorted result list paginated by the first search's page size.
    pub fn do_union(
        &self,
        searches: Vec<BTreeMap<String, String>>,
        start_ts: Instant,
    ) -> EngineResult<Value> {
        if searches.is_empty() {
            return Err(EngineError::ClientError(
                "`searches` cannot be empty.".into(),
            ));
        }

        let per_page = searches[0]
            .get("per_page")
            .or_else(|| searches[0].get("limit"))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10);
        let page = searches[0]
            .get("page")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let offset = if page > 0 { (page - 1) * per_page } else { 0 };

        let mut all_hits: Vec<(u64, Value)> = Vec::new();
        let mut found = 0u64;
        let mut out_of = 0u64;
        for mut search_params in searches {
            let coll_name = search_params.remove("collection").ok_or_else(|| {
                EngineError::ClientError("Each union search must name a `collection`.".into())
            })?;
            let result = self.do_search(search_params, BTreeMap::new(), &coll_name, start_ts)?;
            found += result.get("found").and_then(Value::as_u64).unwrap_or(0);
            out_of += result.get("out_of").and_then(Value::as_u64).unwrap_or(0);
            for hit in result
                .get("hits")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let score = hit
                    .get("text_match")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                all_hits.push((score, hit.clone()));
            }
        }

        all_hits.sort_by(|a, b| b.0.cmp(&a.0));
        let hits: Vec<Value> = all_hits
            .into_iter()
            .skip(offset)
            .take(per_page)
            .map(|(_, hit)| hit)
            .collect();

        Ok(json!({
            "found": found,
            "out_of": out_of,
            "page": if page > 0 { page } else { 1 },
            "hits": hits,
            "search_time_ms": start_ts.elapsed().as_millis() as u64,
        }))
    }
}

impl search::ReferenceTarget for CollectionManager {
    fn filter_foreign_seq_ids(
        &self,
        collection: &str,
        filter_expr: &str,
    ) -> EngineResult<BTreeSet<u32>> {
        let handle = self.get_collection(collection).ok_or_else(|| {
            EngineError::NotFound(format!("No collection with name `{}` found.", collection))
        })?;
        let coll = handle.read();
        let node = crate::filter::parse_filter(filter_expr, &coll.schema)?;
        eval_filter(&node, &*coll)
    }

    fn foreign_sort_value(&self, collection: &str, field: &str, seq_id: u32) -> Option<f64> {
        let handle = self.get_collection(collection)?;
        let coll = handle.read();
        coll.indexes.numeric.get(field)?.sort_value(seq_id)
    }

    fn foreign_document(&self, collection: &str, seq_id: u32) -> Option<Value> {
        let handle = self.get_collection(collection)?;
        let coll = handle.read();
        let doc = coll.load_doc(seq_id).ok().flatten()?;
        Some(Value::Object(super::strip_sidecars(doc)))
    }
}
