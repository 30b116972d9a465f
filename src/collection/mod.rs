use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

pub mod curation;
pub mod manager;

pub use curation::{Override, RuleMatch, Synonym};
pub use manager::{CollectionManager, LockedCollection};

use crate::error::{EngineError, EngineResult};
use crate::filter::{FilterContext, FilterLeaf, Predicate};
use crate::index::{geo, Analyzer, CollectionIndexes, TokenizerConfig};
use crate::schema::{
    flatten_document, infer_type, CollectionSchema, Field, FieldType, FLAT_SIDECAR_KEY,
    REFERENCE_HELPER_SUFFIX,
};
use crate::store::{Store, StoreOp, COLLECTION_META_PREFIX, COLLECTION_NEXT_SEQ_PREFIX};

/// Document write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Create,
    Upsert,
    Update,
    Emplace,
}

impl WriteOperation {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "create" => Ok(WriteOperation::Create),
            "upsert" => Ok(WriteOperation::Upsert),
            "update" => Ok(WriteOperation::Update),
            "emplace" => Ok(WriteOperation::Emplace),
            _ => Err(EngineError::ClientError(format!(
                "Invalid document write action `{}`.",
                s
            ))),
        }
    }
}

/// Resolves a foreign document's string id to its sequence id:
/// `(collection_name, string_id) -> seq_id`.
pub type ReferenceResolver<'a> = dyn Fn(&str, &str) -> EngineResult<Option<u32>> + 'a;

/// A collection: schema, analyzer, in-memory indexes, and curation state.
/// Callers hold it behind the manager's read-locked handle; all mutation goes
/// through `&mut self`.
pub struct Collection {
    pub schema: CollectionSchema,
    pub analyzer: Analyzer,
    pub indexes: CollectionIndexes,
    pub synonyms: Vec<Synonym>,
    pub overrides: Vec<Override>,
    /// Collections that declare a reference to this one; derived at load,
    /// maintained at create/drop.
    pub referenced_in: HashSet<String>,
    store: Arc<Store>,
    next_seq_id: AtomicU32,
}

impl Collection {
    pub fn new(store: Arc<Store>, schema: CollectionSchema, next_seq_id: u32) -> Self {
        let analyzer = Analyzer::new(TokenizerConfig {
            symbols_to_index: schema.symbols_to_index.clone(),
            token_separators: schema.token_separators.clone(),
            locale: String::new(),
        });
        Self {
            schema,
            analyzer,
            indexes: CollectionIndexes::new(),
            synonyms: Vec::new(),
            overrides: Vec::new(),
            referenced_in: HashSet::new(),
            store,
            next_seq_id: AtomicU32::new(next_seq_id),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn next_seq_id(&self) -> u32 {
        self.next_seq_id.load(Ordering::SeqCst)
    }

    // ==================== Key Layout ====================

    pub fn meta_key(name: &str) -> String {
        format!("{}{}", COLLECTION_META_PREFIX, name)
    }

    pub fn next_seq_key(name: &str) -> String {
        format!("{}{}", COLLECTION_NEXT_SEQ_PREFIX, name)
    }

    fn doc_key(&self, seq_id: u32) -> String {
        format!("{}_{}", self.schema.id, seq_id)
    }

    fn id_key(&self, id: &str) -> String {
        format!("{}_id_{}", self.schema.id, id)
    }

    pub fn doc_prefix(&self) -> String {
        format!("{}_", self.schema.id)
    }

    // ==================== Lookup ====================

    pub fn seq_id_for(&self, id: &str) -> EngineResult<Option<u32>> {
        match self.store.get(&self.id_key(id))? {
            Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
                EngineError::Fatal(format!("Corrupt sequence id mapping for `{}`.", id))
            }),
            None => Ok(None),
        }
    }

    pub fn load_doc(&self, seq_id: u32) -> EngineResult<Option<Map<String, Value>>> {
        match self.store.get(&self.doc_key(seq_id))? {
            Some(raw) => {
                let value: Value = serde_json::from_str(&raw)
                    .map_err(|e| EngineError::Fatal(format!("Corrupt document record: {}", e)))?;
                Ok(value.as_object().cloned())
            }
            None => Ok(None),
        }
    }

    /// Fetch a document by its string id with the flattening sidecars and
    /// reference helper fields stripped.
    pub fn get_document(&self, id: &str) -> EngineResult<Value> {
        let seq_id = self.seq_id_for(id)?.ok_or_else(|| {
            EngineError::NotFound(format!("Could not find a document with id: {}", id))
        })?;
        let doc = self.load_doc(seq_id)?.ok_or_else(|| {
            EngineError::Fatal(format!("Document {} is missing from the store.", id))
        })?;
        Ok(Value::Object(strip_sidecars(doc)))
    }

    /// All stored documents in key order, sidecars stripped (export path).
    pub fn export_documents(&self) -> EngineResult<Vec<Value>> {
        let prefix = self.doc_prefix();
        let mut out = Vec::new();
        for (key, raw) in self.store.scan(&prefix)? {
            if key[prefix.len()..].parse::<u32>().is_err() {
                continue; // `<id>_id_...` secondary index keys
            }
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Fatal(format!("Corrupt document record: {}", e)))?;
            if let Some(obj) = value.as_object() {
                out.push(Value::Object(strip_sidecars(obj.clone())));
            }
        }
        Ok(out)
    }

    /// Raw `(seq_id, document)` pairs, used by the boot-time replay.
    pub fn stored_docs(&self) -> EngineResult<Vec<(u32, Map<String, Value>, usize)>> {
        let prefix = self.doc_prefix();
        let mut out = Vec::new();
        for (key, raw) in self.store.scan(&prefix)? {
            let Ok(seq_id) = key[prefix.len()..].parse::<u32>() else {
                continue;
            };
            let value: Value = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Fatal(format!("Corrupt document record: {}", e)))?;
            if let Some(obj) = value.as_object() {
                out.push((seq_id, obj.clone(), raw.len()));
            }
        }
        Ok(out)
    }

    // ==================== Write Pipeline ====================

    /// Add a document. The five-step pipeline: validate & pin types, flatten,
    /// resolve references, persist in one batch, update in-memory indexes.
    pub fn add(
        &mut self,
        body: Value,
        op: WriteOperation,
        resolver: &ReferenceResolver,
    ) -> EngineResult<Value> {
        let mut obj = body
            .as_object()
            .cloned()
            .ok_or_else(|| EngineError::ClientError("Document must be a JSON object.".into()))?;
        let operations = obj.remove("$operations");

        let id = match obj.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(EngineError::ClientError(
                    "Document's `id` field should be a string.".into(),
                ))
            }
            None => {
                let assigned = self.next_seq_id.load(Ordering::SeqCst).to_string();
                obj.insert("id".into(), Value::String(assigned.clone()));
                assigned
            }
        };

        let existing_seq = self.seq_id_for(&id)?;
        match op {
            WriteOperation::Create => {
                if existing_seq.is_some() {
                    return Err(EngineError::Conflict(format!(
                        "A document with id {} already exists.",
                        id
                    )));
                }
            }
            WriteOperation::Update => {
                if existing_seq.is_none() {
                    return Err(EngineError::NotFound(format!(
                        "Could not find a document with id: {}",
                        id
                    )));
                }
            }
            WriteOperation::Upsert | WriteOperation::Emplace => {}
        }

        // The pre-image is needed both for partial merges and for the index
        // delta, so load it before anything is overwritten.
        let old_doc = match existing_seq {
            Some(seq_id) => Some(self.load_doc(seq_id)?.ok_or_else(|| {
                EngineError::Fatal(format!("Document {} is missing from the store.", id))
            })?),
            None => None,
        };

        let merge_into_stored = matches!(op, WriteOperation::Update)
            || (op == WriteOperation::Emplace && existing_seq.is_some());

        let mut doc = if merge_into_stored {
            let mut merged = old_doc.clone().expect("update targets an existing doc");
            for (key, value) in obj {
                merged.insert(key, value);
            }
            merged
        } else {
            obj
        };

        if let Some(operations) = operations {
            apply_operations(&mut doc, &operations)?;
        }

        // Full-document validation only for create/upsert and fresh emplaces.
        let require_all = !merge_into_stored;
        let promoted = self.validate_and_pin(&mut doc, require_all)?;
        let mut schema_changed = false;
        for field in promoted {
            self.schema.upsert_field(field);
            schema_changed = true;
        }

        if self.schema.enable_nested_fields {
            let flattened = flatten_document(&mut doc, &self.schema.fields)?;
            for field in flattened {
                self.schema.upsert_field(field);
                schema_changed = true;
            }
        }

        self.resolve_references(&mut doc, resolver)?;

        let (seq_id, is_new) = match existing_seq {
            Some(seq_id) => (seq_id, false),
            None => (self.next_seq_id.fetch_add(1, Ordering::SeqCst), true),
        };

        let mut batch = vec![
            StoreOp::Put(self.doc_key(seq_id), Value::Object(doc.clone()).to_string()),
            StoreOp::Put(self.id_key(&id), seq_id.to_string()),
        ];
        if is_new {
            batch.push(StoreOp::Put(
                Self::next_seq_key(&self.schema.name),
                self.next_seq_id.load(Ordering::SeqCst).to_string(),
            ));
        }
        if schema_changed {
            batch.push(StoreOp::Put(
                Self::meta_key(&self.schema.name),
                self.schema.to_meta_json().to_string(),
            ));
        }
        self.store.batch_write(batch)?;

        // Index delta: drop the old posting set for replaced documents.
        if let Some(old) = old_doc {
            self.indexes
                .remove_document(&self.schema, &self.analyzer, seq_id, &old);
        }
        self.index_in_memory(seq_id, &doc)?;

        Ok(Value::Object(strip_sidecars(doc)))
    }

    /// Replay a stored document into the in-memory index (boot path).
    pub fn index_in_memory(&mut self, seq_id: u32, doc: &Map<String, Value>) -> EngineResult<()> {
        self.indexes
            .index_document(&self.schema, &self.analyzer, seq_id, doc)
    }

    pub fn remove_document(&mut self, id: &str) -> EngineResult<Value> {
        let seq_id = self.seq_id_for(id)?.ok_or_else(|| {
            EngineError::NotFound(format!("Could not find a document with id: {}", id))
        })?;
        let doc = self.load_doc(seq_id)?.ok_or_else(|| {
            EngineError::Fatal(format!("Document {} is missing from the store.", id))
        })?;

        self.store.batch_write(vec![
            StoreOp::Delete(self.doc_key(seq_id)),
            StoreOp::Delete(self.id_key(id)),
        ])?;
        self.indexes
            .remove_document(&self.schema, &self.analyzer, seq_id, &doc);

        Ok(Value::Object(strip_sidecars(doc)))
    }

    // ==================== Validation ====================

    /// Type-check the document against the schema, pinning auto/fallback and
    /// dynamic-pattern fields on first sighting. Returns the fields to
    /// promote into the schema.
    fn validate_and_pin(
        &self,
        doc: &mut Map<String, Value>,
        require_all: bool,
    ) -> EngineResult<Vec<Field>> {
        let mut promoted = Vec::new();

        for (key, value) in doc.iter() {
            if key == "id" || key == FLAT_SIDECAR_KEY || key.ends_with(REFERENCE_HELPER_SUFFIX) {
                continue;
            }
            if value.is_null() {
                continue;
            }

            match self.schema.field(key) {
                Some(field) if field.field_type == FieldType::Auto => {
                    if let Some((kind, is_array)) = infer_type(value) {
                        let mut pinned = field.clone();
                        pinned.field_type = kind;
                        pinned.is_array = is_array;
                        promoted.push(pinned);
                    }
                }
                Some(field) => check_value(field, value)?,
                None => {
                    // Dynamic pattern match, then the fallback type.
                    let pattern = self
                        .schema
                        .fields
                        .iter()
                        .find(|f| f.is_dynamic() && f.matches(key));
                    let declared = match pattern {
                        Some(p) => Some((p.field_type, p.is_array, p.clone())),
                        None => match &self.schema.fallback_field_type {
                            Some(fallback) => {
                                let (kind, is_array) = FieldType::parse(fallback)?;
                                Some((kind, is_array, Field::new(key, kind, is_array)))
                            }
                            None => None,
                        },
                    };
                    let Some((kind, is_array, template)) = declared else {
                        continue; // stored but unindexed
                    };
                    let (kind, is_array) = if kind == FieldType::Auto {
                        match infer_type(value) {
                            Some(t) => t,
                            None => continue,
                        }
                    } else {
                        (kind, is_array)
                    };
                    if kind == FieldType::Object {
                        continue; // objects surface through flattening
                    }
                    let mut field = Field::new(key, kind, is_array);
                    field.facet = template.facet;
                    field.optional = true;
                    field.index = template.index;
                    field.locale = template.locale.clone();
                    check_value(&field, value)?;
                    promoted.push(field);
                }
            }
        }

        if require_all {
            for field in &self.schema.fields {
                if field.optional
                    || field.is_dynamic()
                    || field.nested
                    || field.embed.is_some()
                    || field.field_type == FieldType::Object
                {
                    continue;
                }
                if !doc.contains_key(&field.name) {
                    return Err(EngineError::ClientError(format!(
                        "Field `{}` has been declared in the schema, but is not found in the document.",
                        field.name
                    )));
                }
            }
        }

        Ok(promoted)
    }

    fn resolve_references(
        &self,
        doc: &mut Map<String, Value>,
        resolver: &ReferenceResolver,
    ) -> EngineResult<()> {
        let reference_fields: Vec<Field> = self.schema.reference_fields().cloned().collect();
        for field in reference_fields {
            let Some(value) = doc.get(&field.name) else {
                continue;
            };
            let reference = field.reference.as_deref().expect("reference field");
            let (foreign_coll, _foreign_field) =
                reference.split_once('.').expect("validated at schema time");

            let Some(ref_id) = value.as_str() else {
                return Err(EngineError::ClientError(format!(
                    "Reference field `{}` must be a string id.",
                    field.name
                )));
            };

            match resolver(foreign_coll, ref_id)? {
                Some(foreign_seq) => {
                    doc.insert(
                        format!("{}{}", field.name, REFERENCE_HELPER_SUFFIX),
                        Value::from(foreign_seq),
                    );
                }
                None if field.async_reference => {
                    // Left unresolved until the referenced document arrives.
                }
                None => {
                    return Err(EngineError::ClientError(format!(
                        "Reference document having `{}: {}` not found in the collection `{}`.",
                        reference, ref_id, foreign_coll
                    )));
                }
            }
        }
        Ok(())
    }

    // ==================== Filter Evaluation ====================

    /// Leaf evaluation with a cap on verified string candidates.
    pub fn eval_leaf_bounded(
        &self,
        leaf: &FilterLeaf,
        candidate_cap: usize,
    ) -> EngineResult<BTreeSet<u32>> {
        if leaf.reference.is_some() {
            return Err(EngineError::Fatal(
                "Reference filters must be resolved before evaluation.".into(),
            ));
        }

        if leaf.field == "id" {
            let mut out = BTreeSet::new();
            for predicate in &leaf.predicates {
                if let Predicate::Id(id) = predicate {
                    if let Some(seq_id) = self.seq_id_for(id)? {
                        out.insert(seq_id);
                    }
                }
            }
            return Ok(out);
        }

        let field = self
            .schema
            .resolve(&leaf.field)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "Could not find a filter field named `{}` in the schema.",
                    leaf.field
                ))
            })?
            .clone();

        let mut positives: BTreeSet<u32> = BTreeSet::new();
        let mut has_positive = false;
        let mut negatives: BTreeSet<u32> = BTreeSet::new();
        let mut has_negative = false;

        for predicate in &leaf.predicates {
            match predicate {
                Predicate::NumEquals(v) => {
                    has_positive = true;
                    if let Some(tree) = self.indexes.numeric.get(&field.name) {
                        positives.extend(tree.equals(*v));
                    }
                }
                Predicate::NumNotEquals(v) => {
                    has_negative = true;
                    if let Some(tree) = self.indexes.numeric.get(&field.name) {
                        negatives.extend(tree.equals(*v));
                    }
                }
                Predicate::NumGreater { value, inclusive } => {
                    has_positive = true;
                    if let Some(tree) = self.indexes.numeric.get(&field.name) {
                        positives.extend(tree.greater_than(*value, *inclusive));
                    }
                }
                Predicate::NumLess { value, inclusive } => {
                    has_positive = true;
                    if let Some(tree) = self.indexes.numeric.get(&field.name) {
                        positives.extend(tree.less_than(*value, *inclusive));
                    }
                }
                Predicate::NumRange { lo, hi } => {
                    has_positive = true;
                    if let Some(tree) = self.indexes.numeric.get(&field.name) {
                        positives.extend(tree.range(*lo, *hi));
                    }
                }
                Predicate::StrEquals(v) | Predicate::StrContains(v) => {
                    has_positive = true;
                    let exact = matches!(predicate, Predicate::StrEquals(_));
                    positives.extend(self.string_filter_ids(&field, v, exact, candidate_cap)?);
                }
                Predicate::StrNotEquals(v) => {
                    has_negative = true;
                    negatives.extend(self.string_filter_ids(&field, v, true, candidate_cap)?);
                }
                Predicate::GeoRadius { lat, lng, radius_m } => {
                    has_positive = true;
                    if let Some(geo_index) = self.indexes.geo.get(&field.name) {
                        positives.extend(
                            geo_index
                                .within_radius(*lat, *lng, *radius_m)
                                .into_iter()
                                .map(|h| h.0),
                        );
                    }
                }
                Predicate::GeoPolygon(vertices) => {
                    has_positive = true;
                    if let Some(geo_index) = self.indexes.geo.get(&field.name) {
                        positives.extend(geo_index.within_polygon(vertices));
                    }
                }
                Predicate::Id(_) => unreachable!("id leaves handled above"),
            }
        }

        let result = if has_positive {
            if has_negative {
                positives.difference(&negatives).copied().collect()
            } else {
                positives
            }
        } else if has_negative {
            self.indexes
                .seq_ids
                .difference(&negatives)
                .copied()
                .collect()
        } else {
            BTreeSet::new()
        };
        Ok(result)
    }

    /// Token-postings candidates for a string filter value, verified against
    /// the stored documents.
    fn string_filter_ids(
        &self,
        field: &Field,
        value: &str,
        exact: bool,
        candidate_cap: usize,
    ) -> EngineResult<BTreeSet<u32>> {
        let Some(inverted) = self.indexes.inverted.get(&field.name) else {
            return Ok(BTreeSet::new());
        };
        let tokens = self.analyzer.tokens(field, value);
        if tokens.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut candidates: Option<BTreeSet<u32>> = None;
        for token in &tokens {
            let ids: BTreeSet<u32> = inverted
                .postings(token)
                .map(|docs| docs.keys().copied().collect())
                .unwrap_or_default();
            candidates = Some(match candidates {
                Some(existing) => existing.intersection(&ids).copied().collect(),
                None => ids,
            });
        }
        let candidates = candidates.unwrap_or_default();

        let needle = value.to_lowercase();
        let mut verified = BTreeSet::new();
        for (checked, seq_id) in candidates.into_iter().enumerate() {
            if checked >= candidate_cap {
                break;
            }
            let Some(doc) = self.load_doc(seq_id)? else {
                continue;
            };
            let matched = doc.get(&field.name).is_some_and(|v| {
                field_strings(v).iter().any(|s| {
                    let lowered = s.to_lowercase();
                    if exact {
                        lowered == needle
                    } else {
                        lowered.contains(&needle)
                    }
                })
            });
            if matched {
                verified.insert(seq_id);
            }
        }
        Ok(verified)
    }

    /// Summary for `GET /collections/:name`.
    pub fn summary_json(&self) -> Value {
        self.schema
            .summary_json(self.indexes.num_documents() as u64)
    }
}

impl FilterContext for Collection {
    fn all_ids(&self) -> BTreeSet<u32> {
        self.indexes.seq_ids.clone()
    }

    fn eval_leaf(&self, leaf: &FilterLeaf) -> EngineResult<BTreeSet<u32>> {
        self.eval_leaf_bounded(leaf, usize::MAX)
    }

    fn leaf_matches(&self, leaf: &FilterLeaf, seq_id: u32) -> EngineResult<bool> {
        Ok(self.eval_leaf(leaf)?.contains(&seq_id))
    }
}

/// Collect the string values of a document field (scalar or array).
pub fn field_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Strip the `.flat` sidecar, the flattened synthetic keys it names, and the
/// reference helper fields from a stored document.
pub fn strip_sidecars(mut doc: Map<String, Value>) -> Map<String, Value> {
    let flat_names: Vec<String> = doc
        .get(FLAT_SIDECAR_KEY)
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    for name in flat_names {
        doc.remove(&name);
    }
    doc.remove(FLAT_SIDECAR_KEY);
    let helper_keys: Vec<String> = doc
        .keys()
        .filter(|k| k.ends_with(REFERENCE_HELPER_SUFFIX))
        .cloned()
        .collect();
    for key in helper_keys {
        doc.remove(&key);
    }
    doc
}

/// Apply a `$operations` sidecar: `{"increment": {"field": delta}}`. A
/// missing field is created at the delta value.
fn apply_operations(doc: &mut Map<String, Value>, operations: &Value) -> EngineResult<()> {
    let Some(increments) = operations.get("increment").and_then(Value::as_object) else {
        return Ok(());
    };
    for (field, delta) in increments {
        let delta = delta.as_i64().ok_or_else(|| {
            EngineError::ClientError(format!("Increment on `{}` must be an integer.", field))
        })?;
        let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
        doc.insert(field.clone(), Value::from(current + delta));
    }
    Ok(())
}

fn check_value(field: &Field, value: &Value) -> EngineResult<()> {
    let mismatch = || {
        EngineError::ClientError(format!(
            "Field `{}` must be {} {}.",
            field.name,
            if field.is_array { "an array of" } else { "a" },
            field.field_type.as_str()
        ))
    };

    if field.is_vector() {
        // Dimension checks happen at index time.
        return value.is_array().then_some(()).ok_or_else(mismatch);
    }

    let scalars: Vec<&Value> = if field.is_array {
        match value {
            Value::Array(items) => items.iter().collect(),
            _ => return Err(mismatch()),
        }
    } else {
        if value.is_array() && field.field_type != FieldType::Geopoint {
            return Err(mismatch());
        }
        vec![value]
    };

    for scalar in scalars {
        if scalar.is_null() {
            continue;
        }
        let ok = match field.field_type {
            FieldType::String | FieldType::Image => scalar.is_string(),
            FieldType::Int32 => scalar
                .as_i64()
                .is_some_and(|n| n >= i32::MIN as i64 && n <= i32::MAX as i64),
            FieldType::Int64 => scalar.as_i64().is_some() || scalar.as_u64().is_some(),
            FieldType::Float => scalar.is_number(),
            FieldType::Bool => scalar.is_boolean(),
            FieldType::Geopoint => geo::parse_geopoint(scalar).is_some(),
            FieldType::Object => scalar.is_object(),
            FieldType::Auto => true,
        };
        if !ok {
            return Err(mismatch());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn no_refs(_: &str, _: &str) -> EngineResult<Option<u32>> {
        Ok(None)
    }

    fn books() -> (TempDir, Collection) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("db")).unwrap());
        let schema = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "books",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": "points", "type": "int32"}
                ],
                "default_sorting_field": "points"
            }),
        )
        .unwrap();
        (dir, Collection::new(store, schema, 0))
    }

    #[test]
    fn test_create_and_fetch_round_trip() {
        let (_dir, mut coll) = books();
        let stored = coll
            .add(
                json!({"id": "0", "title": "Sherlock Holmes", "points": 100}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap();
        assert_eq!(stored["id"], "0");

        let fetched = coll.get_document("0").unwrap();
        assert_eq!(fetched["title"], "Sherlock Holmes");
        assert_eq!(fetched["points"], 100);
        assert_eq!(coll.next_seq_id(), 1);
    }

    #[test]
    fn test_create_conflict() {
        let (_dir, mut coll) = books();
        coll.add(
            json!({"id": "0", "title": "A", "points": 1}),
            WriteOperation::Create,
            &no_refs,
        )
        .unwrap();
        let err = coll
            .add(
                json!({"id": "0", "title": "B", "points": 2}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap_err();
        assert_eq!(err.code(), 409);
    }

    #[test]
    fn test_missing_id_gets_assigned() {
        let (_dir, mut coll) = books();
        let stored = coll
            .add(
                json!({"title": "A", "points": 1}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap();
        assert_eq!(stored["id"], "0");

        let stored = coll
            .add(
                json!({"title": "B", "points": 2}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap();
        assert_eq!(stored["id"], "1");
    }

    #[test]
    fn test_update_merges_partial() {
        let (_dir, mut coll) = books();
        coll.add(
            json!({"id": "0", "title": "Sherlock", "points": 100}),
            WriteOperation::Create,
            &no_refs,
        )
        .unwrap();

        // Partial update keeps the other fields and re-indexes the delta.
        coll.add(
            json!({"id": "0", "points": 200}),
            WriteOperation::Update,
            &no_refs,
        )
        .unwrap();

        let doc = coll.get_document("0").unwrap();
        assert_eq!(doc["title"], "Sherlock");
        assert_eq!(doc["points"], 200);
        assert!(coll.indexes.numeric["points"].equals(100.0).is_empty());
        assert_eq!(coll.indexes.numeric["points"].equals(200.0), vec![0]);
    }

    #[test]
    fn test_update_missing_doc_is_404() {
        let (_dir, mut coll) = books();
        let err = coll
            .add(json!({"id": "9", "points": 1}), WriteOperation::Update, &no_refs)
            .unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[test]
    fn test_upsert_requires_full_document() {
        let (_dir, mut coll) = books();
        let err = coll
            .add(json!({"id": "0", "points": 1}), WriteOperation::Upsert, &no_refs)
            .unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_emplace_is_upsert_then_update() {
        let (_dir, mut coll) = books();
        // Missing: behaves like upsert, so the full document is required.
        let err = coll
            .add(json!({"id": "0", "points": 1}), WriteOperation::Emplace, &no_refs)
            .unwrap_err();
        assert_eq!(err.code(), 400);

        coll.add(
            json!({"id": "0", "title": "A", "points": 1}),
            WriteOperation::Emplace,
            &no_refs,
        )
        .unwrap();

        // Present: behaves like update, partial is fine.
        coll.add(json!({"id": "0", "points": 7}), WriteOperation::Emplace, &no_refs)
            .unwrap();
        assert_eq!(coll.get_document("0").unwrap()["points"], 7);
    }

    #[test]
    fn test_increment_operation() {
        let (_dir, mut coll) = books();
        coll.add(
            json!({"id": "0", "title": "A", "points": 100}),
            WriteOperation::Create,
            &no_refs,
        )
        .unwrap();

        coll.add(
            json!({"id": "0", "$operations": {"increment": {"points": 1}}}),
            WriteOperation::Update,
            &no_refs,
        )
        .unwrap();
        assert_eq!(coll.get_document("0").unwrap()["points"], 101);
        assert_eq!(coll.indexes.numeric["points"].equals(101.0), vec![0]);
    }

    #[test]
    fn test_increment_on_missing_field_seeds_delta() {
        let (_dir, mut coll) = books();
        coll.add(
            json!({"id": "0", "title": "A", "points": 1}),
            WriteOperation::Create,
            &no_refs,
        )
        .unwrap();

        coll.add(
            json!({"id": "0", "$operations": {"increment": {"downloads": 5}}}),
            WriteOperation::Emplace,
            &no_refs,
        )
        .unwrap();
        assert_eq!(coll.get_document("0").unwrap()["downloads"], 5);
    }

    #[test]
    fn test_delete_removes_store_and_index() {
        let (_dir, mut coll) = books();
        coll.add(
            json!({"id": "0", "title": "Sherlock", "points": 1}),
            WriteOperation::Create,
            &no_refs,
        )
        .unwrap();
        coll.remove_document("0").unwrap();

        assert_eq!(coll.seq_id_for("0").unwrap(), None);
        assert!(coll.indexes.inverted["title"].postings("sherlock").is_none());
        assert_eq!(coll.get_document("0").unwrap_err().code(), 404);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let (_dir, mut coll) = books();
        let err = coll
            .add(
                json!({"id": "0", "title": 42, "points": 1}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_int32_bounds() {
        let (_dir, mut coll) = books();
        let err = coll
            .add(
                json!({"id": "0", "title": "A", "points": 3_000_000_000i64}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_nested_flattening_pipeline() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::new(dir.path().join("db")).unwrap());
        let schema = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "coll",
                "enable_nested_fields": true,
                "fields": [{"name": ".*", "type": "auto"}]
            }),
        )
        .unwrap();
        let mut coll = Collection::new(store, schema, 0);

        coll.add(
            json!({
                "id": "0",
                "company": {"name": "Nike"},
                "locations": [
                    {"address": {"street": "One Bowerman Drive"}},
                    {"address": {"street": "175 Commerce Valley"}}
                ]
            }),
            WriteOperation::Create,
            &no_refs,
        )
        .unwrap();

        // Flattened fields are pinned and indexed.
        assert!(coll.schema.field("company.name").is_some());
        assert!(coll
            .indexes
            .inverted
            .get("locations.address.street")
            .and_then(|idx| idx.postings("commerce"))
            .is_some());

        // But never visible in the fetched document.
        let doc = coll.get_document("0").unwrap();
        assert!(doc.get("locations.address.street").is_none());
        assert!(doc.get(".flat").is_none());
        assert_eq!(doc["company"]["name"], "Nike");
    }

    #[test]
    fn test_reference_resolution() {
        let (_dir, mut coll) = books();
        let mut ref_field = Field::new("author_id", FieldType::String, false);
        ref_field.reference = Some("authors.id".into());
        coll.schema.fields.push(ref_field);

        let resolver = |coll_name: &str, id: &str| -> EngineResult<Option<u32>> {
            assert_eq!(coll_name, "authors");
            Ok((id == "a1").then_some(42))
        };

        coll.add(
            json!({"id": "b1", "title": "Sign of Four", "points": 1, "author_id": "a1"}),
            WriteOperation::Create,
            &resolver,
        )
        .unwrap();

        let raw = coll.load_doc(0).unwrap().unwrap();
        assert_eq!(raw["author_id_sequence_id"], 42);

        // The helper never leaks into the visible document.
        let doc = coll.get_document("b1").unwrap();
        assert!(doc.get("author_id_sequence_id").is_none());

        // A dangling reference is a client error.
        let err = coll
            .add(
                json!({"id": "b2", "title": "X", "points": 1, "author_id": "nope"}),
                WriteOperation::Create,
                &resolver,
            )
            .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_filter_context_numeric_and_string() {
        let (_dir, mut coll) = books();
        for (i, (title, points)) in [("alpha beta", 10), ("beta gamma", 20), ("delta", 30)]
            .iter()
            .enumerate()
        {
            coll.add(
                json!({"id": i.to_string(), "title": title, "points": points}),
                WriteOperation::Create,
                &no_refs,
            )
            .unwrap();
        }

        let schema = coll.schema.clone();
        let node = crate::filter::parse_filter("points:>=20", &schema).unwrap();
        let ids = crate::filter::eval_filter(&node, &coll).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let node = crate::filter::parse_filter("title:beta", &schema).unwrap();
        let ids = crate::filter::eval_filter(&node, &coll).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![0, 1]);

        let node = crate::filter::parse_filter("title:=delta", &schema).unwrap();
        let ids = crate::filter::eval_filter(&node, &coll).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![2]);

        let node = crate::filter::parse_filter("id:[0, 2]", &schema).unwrap();
        let ids = crate::filter::eval_filter(&node, &coll).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
