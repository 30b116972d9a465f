use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

pub mod facet;
pub mod geo;
pub mod inverted;
pub mod numeric;
pub mod vector;

pub use facet::FacetIndex;
pub use geo::GeoIndex;
pub use inverted::{levenshtein_bounded, tokenize, InvertedIndex, TokenCandidate, TokenizerConfig};
pub use numeric::{NumericIndex, StringSortIndex};
pub use vector::HnswIndex;

use crate::error::{EngineError, EngineResult};
use crate::schema::{CollectionSchema, Field, FieldType};

/// Tokenization + stemming for one collection. Stemming is dictionary-first
/// (word → root), falling back to a light suffix stripper.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    pub config: TokenizerConfig,
    pub stem_dictionaries: HashMap<String, HashMap<String, String>>,
}

impl Analyzer {
    pub fn new(config: TokenizerConfig) -> Self {
        Self {
            config,
            stem_dictionaries: HashMap::new(),
        }
    }

    pub fn tokens(&self, field: &Field, text: &str) -> Vec<String> {
        let mut tokens = tokenize(text, &self.config);
        if field.stem {
            let dict = field
                .stem_dictionary
                .as_deref()
                .and_then(|name| self.stem_dictionaries.get(name));
            for token in tokens.iter_mut() {
                *token = stem_token(token, dict);
            }
        }
        tokens
    }

    /// Tokens of a raw query string, without any field-specific stemming.
    pub fn query_tokens(&self, text: &str) -> Vec<String> {
        tokenize(text, &self.config)
    }
}

fn stem_token(token: &str, dict: Option<&HashMap<String, String>>) -> String {
    if let Some(dict) = dict {
        if let Some(root) = dict.get(token) {
            return root.clone();
        }
    }
    let n = token.len();
    if let Some(base) = token.strip_suffix("ies") {
        if n > 4 {
            return format!("{}y", base);
        }
    }
    if token.ends_with("sses") {
        return token[..n - 2].to_string();
    }
    if let Some(base) = token.strip_suffix("ing") {
        if base.len() > 3 {
            return base.to_string();
        }
    }
    if let Some(base) = token.strip_suffix("ed") {
        if base.len() > 3 {
            return base.to_string();
        }
    }
    if token.ends_with('s') && !token.ends_with("ss") && n > 3 {
        return token[..n - 1].to_string();
    }
    token.to_string()
}

/// All in-memory indexes of one collection, keyed by field name.
#[derive(Default)]
pub struct CollectionIndexes {
    pub inverted: HashMap<String, InvertedIndex>,
    pub numeric: HashMap<String, NumericIndex>,
    pub string_sort: HashMap<String, StringSortIndex>,
    pub geo: HashMap<String, GeoIndex>,
    pub vector: HashMap<String, Arc<HnswIndex>>,
    pub facet: HashMap<String, FacetIndex>,
    pub seq_ids: BTreeSet<u32>,
}

impl CollectionIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_documents(&self) -> usize {
        self.seq_ids.len()
    }

    /// Index one (already validated and flattened) document.
    pub fn index_document(
        &mut self,
        schema: &CollectionSchema,
        analyzer: &Analyzer,
        seq_id: u32,
        doc: &serde_json::Map<String, Value>,
    ) -> EngineResult<()> {
        self.seq_ids.insert(seq_id);

        for (key, value) in doc {
            if value.is_null() {
                continue;
            }
            let Some(field) = schema.field(key) else {
                continue;
            };
            self.index_field(schema, analyzer, seq_id, field, value)?;
        }
        Ok(())
    }

    fn index_field(
        &mut self,
        _schema: &CollectionSchema,
        analyzer: &Analyzer,
        seq_id: u32,
        field: &Field,
        value: &Value,
    ) -> EngineResult<()> {
        if field.is_vector() {
            let vector = parse_vector(field, value)?;
            let hnsw = self.vector.entry(field.name.clone()).or_insert_with(|| {
                let params = field.hnsw_params.clone().unwrap_or_default();
                Arc::new(HnswIndex::new(
                    field.num_dim,
                    field.vec_dist,
                    params.m,
                    params.ef_construction,
                ))
            });
            hnsw.insert(seq_id, vector);
            return Ok(());
        }

        match field.field_type {
            FieldType::String | FieldType::Auto | FieldType::Image => {
                let texts = string_values(value);
                if field.index && !texts.is_empty() {
                    let inverted = self.inverted.entry(field.name.clone()).or_default();
                    let mut tokens = Vec::new();
                    for text in &texts {
                        tokens.extend(analyzer.tokens(field, text));
                    }
                    inverted.add_document(seq_id, &tokens);
                }
                if field.sort && !field.field_type.is_numeric() {
                    if let Some(first) = texts.first() {
                        self.string_sort
                            .entry(field.name.clone())
                            .or_default()
                            .insert(seq_id, first);
                    }
                }
                if field.facet {
                    let facet = self.facet.entry(field.name.clone()).or_default();
                    for text in &texts {
                        facet.insert(seq_id, text);
                    }
                }
            }
            FieldType::Int32 | FieldType::Int64 | FieldType::Float | FieldType::Bool => {
                let numbers = numeric_values(field, value)?;
                let numeric = self.numeric.entry(field.name.clone()).or_default();
                for n in &numbers {
                    numeric.insert(seq_id, *n);
                }
                if field.facet {
                    let facet = self.facet.entry(field.name.clone()).or_default();
                    for raw in facet_strings(value) {
                        facet.insert(seq_id, &raw);
                    }
                }
            }
            FieldType::Geopoint => {
                let geo = self.geo.entry(field.name.clone()).or_default();
                let points = if field.is_array {
                    value.as_array().cloned().unwrap_or_default()
                } else {
                    vec![value.clone()]
                };
                for point in &points {
                    let (lat, lng) = geo::parse_geopoint(point).ok_or_else(|| {
                        EngineError::ClientError(format!(
                            "Field `{}` must be a valid geopoint `[lat, lng]`.",
                            field.name
                        ))
                    })?;
                    geo.insert(seq_id, lat, lng);
                }
            }
            FieldType::Object => {
                // Objects are searched through their flattened children.
            }
        }
        Ok(())
    }

    /// Remove a document given its stored (flattened) form.
    pub fn remove_document(
        &mut self,
        schema: &CollectionSchema,
        analyzer: &Analyzer,
        seq_id: u32,
        doc: &serde_json::Map<String, Value>,
    ) {
        self.seq_ids.remove(&seq_id);

        for (key, value) in doc {
            let Some(field) = schema.field(key) else {
                continue;
            };
            if field.is_vector() {
                if let Some(hnsw) = self.vector.get(&field.name) {
                    hnsw.remove(seq_id);
                }
                continue;
            }
            match field.field_type {
                FieldType::String | FieldType::Auto | FieldType::Image => {
                    if let Some(inverted) = self.inverted.get_mut(&field.name) {
                        let mut tokens = Vec::new();
                        for text in string_values(value) {
                            tokens.extend(analyzer.tokens(field, &text));
                        }
                        inverted.remove_document(seq_id, &tokens);
                    }
                    if let Some(sort) = self.string_sort.get_mut(&field.name) {
                        sort.remove(seq_id);
                    }
                    if let Some(facet) = self.facet.get_mut(&field.name) {
                        facet.remove(seq_id);
                    }
                }
                FieldType::Int32 | FieldType::Int64 | FieldType::Float | FieldType::Bool => {
                    if let Some(numeric) = self.numeric.get_mut(&field.name) {
                        numeric.remove(seq_id);
                    }
                    if let Some(facet) = self.facet.get_mut(&field.name) {
                        facet.remove(seq_id);
                    }
                }
                FieldType::Geopoint => {
                    if let Some(geo) = self.geo.get_mut(&field.name) {
                        geo.remove(seq_id);
                    }
                }
                FieldType::Object => {}
            }
        }
    }
}

fn string_values(value: &Value) -> Vec<String> {
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

fn numeric_values(field: &Field, value: &Value) -> EngineResult<Vec<f64>> {
    let mut out = Vec::new();
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for item in items {
        let n = match item {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Null => continue,
            _ => {
                return Err(EngineError::ClientError(format!(
                    "Field `{}` must be {}.",
                    field.name,
                    field.type_str()
                )))
            }
        };
        out.push(n);
    }
    Ok(out)
}

fn facet_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().flat_map(facet_strings).collect(),
        Value::String(s) => vec![s.clone()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

fn parse_vector(field: &Field, value: &Value) -> EngineResult<Vec<f32>> {
    let arr = value.as_array().ok_or_else(|| {
        EngineError::ClientError(format!("Field `{}` must be an array of floats.", field.name))
    })?;
    if arr.len() != field.num_dim {
        return Err(EngineError::ClientError(format!(
            "Field `{}` must have {} dimensions.",
            field.name, field.num_dim
        )));
    }
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let f = item.as_f64().ok_or_else(|| {
            EngineError::ClientError(format!("Field `{}` must be an array of floats.", field.name))
        })?;
        out.push(f as f32);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "books",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": "genre", "type": "string", "facet": true},
                    {"name": "points", "type": "int32"},
                    {"name": "loc", "type": "geopoint"},
                    {"name": "emb", "type": "float[]", "num_dim": 2}
                ],
                "default_sorting_field": "points"
            }),
        )
        .unwrap()
    }

    fn doc() -> serde_json::Map<String, Value> {
        json!({
            "id": "0",
            "title": "Sherlock Holmes",
            "genre": "mystery",
            "points": 100,
            "loc": [48.85, 2.35],
            "emb": [0.6, 0.8]
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_index_document_populates_all_indexes() {
        let schema = schema();
        let analyzer = Analyzer::default();
        let mut indexes = CollectionIndexes::new();
        indexes.index_document(&schema, &analyzer, 1, &doc()).unwrap();

        assert!(indexes.inverted["title"].postings("sherlock").is_some());
        assert_eq!(indexes.numeric["points"].equals(100.0), vec![1]);
        assert_eq!(
            indexes.facet["genre"].count_by_iteration([1].iter())["mystery"],
            1
        );
        assert_eq!(indexes.geo["loc"].within_radius(48.85, 2.35, 10.0).len(), 1);
        assert_eq!(indexes.vector["emb"].len(), 1);
        assert_eq!(indexes.num_documents(), 1);
    }

    #[test]
    fn test_remove_document_clears_all_indexes() {
        let schema = schema();
        let analyzer = Analyzer::default();
        let mut indexes = CollectionIndexes::new();
        let d = doc();
        indexes.index_document(&schema, &analyzer, 1, &d).unwrap();
        indexes.remove_document(&schema, &analyzer, 1, &d);

        assert!(indexes.inverted["title"].postings("sherlock").is_none());
        assert!(indexes.numeric["points"].equals(100.0).is_empty());
        assert_eq!(indexes.num_documents(), 0);
    }

    #[test]
    fn test_vector_dimension_mismatch() {
        let schema = schema();
        let analyzer = Analyzer::default();
        let mut indexes = CollectionIndexes::new();
        let mut d = doc();
        d.insert("emb".into(), json!([1.0, 2.0, 3.0]));

        let err = indexes.index_document(&schema, &analyzer, 1, &d).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_stemming_with_dictionary() {
        let mut analyzer = Analyzer::default();
        analyzer.stem_dictionaries.insert(
            "irregular".into(),
            [("ran".to_string(), "run".to_string())].into_iter().collect(),
        );
        let mut field = Field::new("title", FieldType::String, false);
        field.stem = true;
        field.stem_dictionary = Some("irregular".into());

        assert_eq!(analyzer.tokens(&field, "ran races"), vec!["run", "race"]);
    }

    #[test]
    fn test_suffix_stemmer() {
        assert_eq!(stem_token("running", None), "runn");
        assert_eq!(stem_token("stories", None), "story");
        assert_eq!(stem_token("books", None), "book");
        assert_eq!(stem_token("class", None), "class");
    }
}
