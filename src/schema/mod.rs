use serde_json::{json, Map, Value};

pub mod field;
pub mod flatten;

pub use field::{
    infer_type, EmbedConfig, Field, FieldType, HnswParams, InfixMode, VectorDistance,
    FLAT_SIDECAR_KEY, REFERENCE_HELPER_SUFFIX,
};
pub use flatten::flatten_document;

use crate::error::{EngineError, EngineResult};

/// The persisted shape of a collection: its identity, fields, and the
/// tokenizer/nesting knobs that apply to every document it holds.
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub id: u32,
    pub name: String,
    pub created_at: i64,
    pub num_memory_shards: usize,
    pub fields: Vec<Field>,
    pub default_sorting_field: String,
    pub fallback_field_type: Option<String>,
    pub symbols_to_index: Vec<char>,
    pub token_separators: Vec<char>,
    pub enable_nested_fields: bool,
    pub metadata: Option<Value>,
}

impl CollectionSchema {
    /// Validate a creation request and build the schema. `id` is the reserved
    /// collection id; `created_at` is stamped here.
    pub fn from_create_request(id: u32, body: &Value) -> EngineResult<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| EngineError::ClientError("Collection schema must be an object.".into()))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::ClientError("Collection `name` is required.".into()))?;
        if name.starts_with('$') || name.contains('/') {
            return Err(EngineError::ClientError(format!(
                "Invalid collection name `{}`.",
                name
            )));
        }

        let field_values = obj
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::ClientError("`fields` must be an array.".into()))?;

        let mut fields = Vec::with_capacity(field_values.len());
        for value in field_values {
            fields.push(Field::from_json(value)?);
        }

        let mut schema = CollectionSchema {
            id,
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            num_memory_shards: obj
                .get("num_memory_shards")
                .and_then(Value::as_u64)
                .unwrap_or(4) as usize,
            fields,
            default_sorting_field: obj
                .get("default_sorting_field")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            fallback_field_type: obj
                .get("fallback_field_type")
                .and_then(Value::as_str)
                .map(String::from),
            symbols_to_index: chars_param(obj, "symbols_to_index"),
            token_separators: chars_param(obj, "token_separators"),
            enable_nested_fields: obj
                .get("enable_nested_fields")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            metadata: obj.get("metadata").filter(|m| !m.is_null()).cloned(),
        };

        schema.validate()?;

        // `.*` without nested fields enabled still works on flat documents,
        // but object types demand nesting support.
        if !schema.enable_nested_fields
            && schema
                .fields
                .iter()
                .any(|f| f.field_type == FieldType::Object)
        {
            return Err(EngineError::ClientError(
                "Type `object` requires `enable_nested_fields` to be true.".into(),
            ));
        }

        Ok(schema)
    }

    fn validate(&self) -> EngineResult<()> {
        if let Some(fallback) = &self.fallback_field_type {
            FieldType::parse(fallback)?;
        }

        if !self.default_sorting_field.is_empty() {
            let field = self
                .fields
                .iter()
                .find(|f| f.name == self.default_sorting_field)
                .ok_or_else(|| {
                    EngineError::ClientError(format!(
                        "Default sorting field `{}` not found in the schema.",
                        self.default_sorting_field
                    ))
                })?;
            if !field.field_type.is_numeric() && field.field_type != FieldType::Geopoint {
                return Err(EngineError::ClientError(format!(
                    "Default sorting field `{}` must be a numeric or geopoint field.",
                    self.default_sorting_field
                )));
            }
        }

        // A singular-typed field whose path traverses a declared object[]
        // ancestor can be rejected right here.
        for field in &self.fields {
            if field.is_array || field.is_dynamic() || !field.name.contains('.') {
                continue;
            }
            let mut prefix = field.name.as_str();
            while let Some(pos) = prefix.rfind('.') {
                prefix = &prefix[..pos];
                if let Some(ancestor) = self.fields.iter().find(|f| f.name == prefix) {
                    if ancestor.field_type == FieldType::Object && ancestor.is_array {
                        return Err(EngineError::ClientError(format!(
                            "Field `{}` sits inside the object array `{}` and must be array-typed.",
                            field.name, prefix
                        )));
                    }
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(&field.name) {
                return Err(EngineError::ClientError(format!(
                    "Field `{}` is declared more than once.",
                    field.name
                )));
            }
        }

        Ok(())
    }

    /// Concrete field lookup by exact name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve a document key against the schema: concrete match first, then
    /// dynamic patterns in declaration order.
    pub fn resolve(&self, name: &str) -> Option<&Field> {
        self.field(name)
            .or_else(|| self.fields.iter().find(|f| f.is_dynamic() && f.matches(name)))
    }

    /// Promote a flattened or auto-pinned field into the schema, merging the
    /// observed nested-array state into an existing tri-state and pinning
    /// concrete types over a declared `auto`.
    pub fn upsert_field(&mut self, field: Field) {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == field.name) {
            if existing.nested_array.is_none() {
                existing.nested_array = field.nested_array;
            }
            if existing.field_type == FieldType::Auto && field.field_type != FieldType::Auto {
                existing.field_type = field.field_type;
                existing.is_array = field.is_array;
                existing.sort = existing.sort || field.field_type.is_numeric();
            }
            return;
        }
        self.fields.push(field);
    }

    pub fn remove_field(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|f| f.name != name);
        self.fields.len() != before
    }

    /// Fields that feed the inverted index.
    pub fn indexed_string_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| {
            f.index && !f.is_dynamic() && f.field_type == FieldType::String && !f.is_vector()
        })
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_reference())
    }

    /// Meta JSON persisted under `$CM_<name>`.
    pub fn to_meta_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "created_at": self.created_at,
            "num_memory_shards": self.num_memory_shards,
            "fields": self.fields.iter().map(Field::to_json).collect::<Vec<_>>(),
            "default_sorting_field": self.default_sorting_field,
            "fallback_field_type": self.fallback_field_type,
            "symbols_to_index": self.symbols_to_index.iter().collect::<String>(),
            "token_separators": self.token_separators.iter().collect::<String>(),
            "enable_nested_fields": self.enable_nested_fields,
            "metadata": self.metadata,
        })
    }

    pub fn from_meta_json(value: &Value) -> EngineResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::Fatal("Corrupt collection meta record.".into()))?;

        let mut fields = Vec::new();
        for field_value in obj.get("fields").and_then(Value::as_array).into_iter().flatten() {
            fields.push(Field::from_json(field_value)?);
        }

        Ok(CollectionSchema {
            id: obj.get("id").and_then(Value::as_u64).unwrap_or(0) as u32,
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            created_at: obj.get("created_at").and_then(Value::as_i64).unwrap_or(0),
            num_memory_shards: obj
                .get("num_memory_shards")
                .and_then(Value::as_u64)
                .unwrap_or(4) as usize,
            fields,
            default_sorting_field: obj
                .get("default_sorting_field")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            fallback_field_type: obj
                .get("fallback_field_type")
                .and_then(Value::as_str)
                .map(String::from),
            symbols_to_index: obj
                .get("symbols_to_index")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .chars()
                .collect(),
            token_separators: obj
                .get("token_separators")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .chars()
                .collect(),
            enable_nested_fields: obj
                .get("enable_nested_fields")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            metadata: obj.get("metadata").filter(|m| !m.is_null()).cloned(),
        })
    }

    /// Client-visible summary (document count is supplied by the caller).
    pub fn summary_json(&self, num_documents: u64) -> Value {
        let mut summary = self.to_meta_json();
        if let Some(obj) = summary.as_object_mut() {
            obj.insert("num_documents".into(), json!(num_documents));
            obj.remove("id");
        }
        summary
    }
}

fn chars_param(obj: &Map<String, Value>, key: &str) -> Vec<char> {
    match obj.get(key) {
        Some(Value::String(s)) => s.chars().collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(str::chars)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn books_schema() -> CollectionSchema {
        CollectionSchema::from_create_request(
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
        .unwrap()
    }

    #[test]
    fn test_create_and_round_trip() {
        let schema = books_schema();
        assert_eq!(schema.name, "books");
        assert_eq!(schema.fields.len(), 2);

        let loaded = CollectionSchema::from_meta_json(&schema.to_meta_json()).unwrap();
        assert_eq!(loaded.name, schema.name);
        assert_eq!(loaded.default_sorting_field, "points");
        assert_eq!(loaded.fields.len(), 2);
    }

    #[test]
    fn test_default_sorting_field_must_be_numeric() {
        let err = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "books",
                "fields": [{"name": "title", "type": "string"}],
                "default_sorting_field": "title"
            }),
        )
        .unwrap_err();
        assert_eq!(err.code(), 400);

        let err = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "books",
                "fields": [{"name": "title", "type": "string"}],
                "default_sorting_field": "missing"
            }),
        )
        .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_object_type_requires_nested_fields() {
        let err = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "c",
                "fields": [{"name": "company", "type": "object"}]
            }),
        )
        .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_singular_field_under_object_array_rejected_at_creation() {
        let err = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "c",
                "enable_nested_fields": true,
                "fields": [
                    {"name": "locations", "type": "object[]"},
                    {"name": "locations.address.street", "type": "string"}
                ]
            }),
        )
        .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_resolve_prefers_concrete_over_dynamic() {
        let schema = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "c",
                "fields": [
                    {"name": "title", "type": "string"},
                    {"name": ".*", "type": "auto"}
                ]
            }),
        )
        .unwrap();

        assert_eq!(schema.resolve("title").unwrap().field_type, FieldType::String);
        assert_eq!(schema.resolve("anything").unwrap().field_type, FieldType::Auto);
    }

    #[test]
    fn test_upsert_field_resolves_tri_state() {
        let mut schema = books_schema();
        let mut flat = Field::new("company.name", FieldType::String, false);
        flat.nested = true;
        flat.nested_array = None;
        schema.upsert_field(flat);
        assert!(schema.field("company.name").unwrap().nested_array.is_none());

        let mut observed = Field::new("company.name", FieldType::String, false);
        observed.nested = true;
        observed.nested_array = Some(false);
        schema.upsert_field(observed);
        assert_eq!(
            schema.field("company.name").unwrap().nested_array,
            Some(false)
        );
    }

    #[test]
    fn test_upsert_field_pins_auto_type() {
        let mut schema = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "c",
                "fields": [{"name": "tags", "type": "auto"}]
            }),
        )
        .unwrap();

        let pinned = Field::new("tags", FieldType::String, true);
        schema.upsert_field(pinned);

        let field = schema.field("tags").unwrap();
        assert_eq!(field.field_type, FieldType::String);
        assert!(field.is_array);
    }

    #[test]
    fn test_duplicate_fields_rejected() {
        let err = CollectionSchema::from_create_request(
            0,
            &json!({
                "name": "c",
                "fields": [
                    {"name": "a", "type": "string"},
                    {"name": "a", "type": "int32"}
                ]
            }),
        )
        .unwrap_err();
        assert_eq!(err.code(), 400);
    }
}
