use regex::Regex;
use serde_json::{json, Map, Value};

use crate::error::{EngineError, EngineResult};

/// Scalar kind of a field; whether the field holds one value or an array of
/// them is tracked separately by `Field::is_array`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Int32,
    Int64,
    Float,
    Bool,
    Geopoint,
    Object,
    Auto,
    Image,
}

impl FieldType {
    /// Parse a wire type string like `"int32[]"` into kind + array flag.
    pub fn parse(type_str: &str) -> EngineResult<(FieldType, bool)> {
        let (base, is_array) = match type_str.strip_suffix("[]") {
            Some(base) => (base, true),
            None => (type_str, false),
        };
        let kind = match base {
            "string" => FieldType::String,
            "int32" => FieldType::Int32,
            "int64" => FieldType::Int64,
            "float" => FieldType::Float,
            "bool" => FieldType::Bool,
            "geopoint" => FieldType::Geopoint,
            "object" => FieldType::Object,
            "auto" => FieldType::Auto,
            "image" => FieldType::Image,
            _ => {
                return Err(EngineError::ClientError(format!(
                    "Field type `{}` is invalid.",
                    type_str
                )))
            }
        };
        if is_array && matches!(kind, FieldType::Auto | FieldType::Image) {
            return Err(EngineError::ClientError(format!(
                "Field type `{}` is invalid.",
                type_str
            )));
        }
        Ok((kind, is_array))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Geopoint => "geopoint",
            FieldType::Object => "object",
            FieldType::Auto => "auto",
            FieldType::Image => "image",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int32 | FieldType::Int64 | FieldType::Float)
    }
}

/// Distance function for vector fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorDistance {
    #[default]
    Cosine,
    Ip,
}

impl VectorDistance {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "cosine" => Ok(VectorDistance::Cosine),
            "ip" => Ok(VectorDistance::Ip),
            _ => Err(EngineError::ClientError(format!(
                "Invalid vector distance `{}`: must be `cosine` or `ip`.",
                s
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VectorDistance::Cosine => "cosine",
            VectorDistance::Ip => "ip",
        }
    }
}

/// HNSW build parameters for a vector field.
#[derive(Debug, Clone, PartialEq)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
        }
    }
}

/// Auto-embedding configuration: which fields feed the model, and the model.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedConfig {
    pub from: Vec<String>,
    pub model_name: String,
    pub model_config: Map<String, Value>,
}

/// Infix search mode for a query field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfixMode {
    #[default]
    Off,
    Always,
    Fallback,
}

impl InfixMode {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "off" | "false" => Ok(InfixMode::Off),
            "always" | "true" => Ok(InfixMode::Always),
            "fallback" => Ok(InfixMode::Fallback),
            _ => Err(EngineError::ClientError(format!(
                "Invalid infix value `{}`.",
                s
            ))),
        }
    }
}

/// Suffix appended to a reference field's name to hold the resolved foreign
/// sequence id.
pub const REFERENCE_HELPER_SUFFIX: &str = "_sequence_id";

/// Sidecar key listing the fields synthesized by nested-path flattening.
pub const FLAT_SIDECAR_KEY: &str = ".flat";

/// A typed field descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub is_array: bool,
    pub facet: bool,
    pub optional: bool,
    pub index: bool,
    pub sort: bool,
    pub infix: bool,
    pub locale: String,
    pub nested: bool,
    /// Tri-state: `None` means not yet observed for this nested path.
    pub nested_array: Option<bool>,
    pub num_dim: usize,
    pub vec_dist: VectorDistance,
    pub reference: Option<String>,
    pub async_reference: bool,
    pub embed: Option<EmbedConfig>,
    pub range_index: bool,
    pub stem: bool,
    pub stem_dictionary: Option<String>,
    pub hnsw_params: Option<HnswParams>,
    pub store: bool,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType, is_array: bool) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_array,
            facet: false,
            optional: false,
            index: true,
            // Numeric fields are always sortable.
            sort: field_type.is_numeric(),
            infix: false,
            locale: String::new(),
            nested: false,
            nested_array: None,
            num_dim: 0,
            vec_dist: VectorDistance::default(),
            reference: None,
            async_reference: false,
            embed: None,
            range_index: false,
            stem: false,
            stem_dictionary: None,
            hnsw_params: None,
            store: true,
        }
    }

    /// Whether this descriptor is a wildcard pattern (`.*`, `prices_.*`, ...)
    /// rather than a concrete field.
    pub fn is_dynamic(&self) -> bool {
        self.name == ".*" || self.name.contains(".*")
    }

    /// Whether a concrete field name matches this (possibly dynamic) descriptor.
    pub fn matches(&self, name: &str) -> bool {
        if !self.is_dynamic() {
            return self.name == name;
        }
        if self.name == ".*" {
            return true;
        }
        // A dynamic pattern is an anchored regex over the flattened name.
        match Regex::new(&format!("^{}$", self.name)) {
            Ok(re) => re.is_match(name),
            Err(_) => false,
        }
    }

    pub fn is_vector(&self) -> bool {
        self.num_dim > 0
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Sorting capability: numeric always, others only when declared.
    pub fn sortable(&self) -> bool {
        self.field_type.is_numeric() || self.sort
    }

    pub fn type_str(&self) -> String {
        if self.is_array {
            format!("{}[]", self.field_type.as_str())
        } else {
            self.field_type.as_str().to_string()
        }
    }

    /// Parse a field descriptor from its schema JSON.
    pub fn from_json(value: &Value) -> EngineResult<Field> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::ClientError("Field definition must be an object.".into()))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ClientError("Field `name` is required.".into()))?;
        if name == "id" {
            return Err(EngineError::ClientError(
                "Field `id` is reserved and cannot be declared.".into(),
            ));
        }

        let type_str = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::ClientError(format!("Field `{}` must declare a `type`.", name))
            })?;
        let (field_type, is_array) = FieldType::parse(type_str)?;

        let mut field = Field::new(name, field_type, is_array);

        if let Some(v) = obj.get("facet").and_then(Value::as_bool) {
            field.facet = v;
        }
        if let Some(v) = obj.get("optional").and_then(Value::as_bool) {
            field.optional = v;
        }
        if let Some(v) = obj.get("index").and_then(Value::as_bool) {
            field.index = v;
        }
        if let Some(v) = obj.get("sort").and_then(Value::as_bool) {
            field.sort = v || field.field_type.is_numeric();
        }
        if let Some(v) = obj.get("infix").and_then(Value::as_bool) {
            field.infix = v;
        }
        if let Some(v) = obj.get("locale").and_then(Value::as_str) {
            field.locale = v.to_string();
        }
        if let Some(v) = obj.get("nested").and_then(Value::as_bool) {
            field.nested = v;
        }
        if let Some(v) = obj.get("nested_array").and_then(Value::as_bool) {
            field.nested_array = Some(v);
        }
        if let Some(v) = obj.get("range_index").and_then(Value::as_bool) {
            field.range_index = v;
        }
        if let Some(v) = obj.get("stem").and_then(Value::as_bool) {
            field.stem = v;
        }
        if let Some(v) = obj.get("stem_dictionary").and_then(Value::as_str) {
            field.stem_dictionary = Some(v.to_string());
            field.stem = true;
        }
        if let Some(v) = obj.get("store").and_then(Value::as_bool) {
            field.store = v;
        }
        if let Some(v) = obj.get("reference").and_then(Value::as_str) {
            if !v.contains('.') {
                return Err(EngineError::ClientError(format!(
                    "Invalid reference `{}`: expected `collection.field`.",
                    v
                )));
            }
            field.reference = Some(v.to_string());
        }
        if let Some(v) = obj.get("async_reference").and_then(Value::as_bool) {
            field.async_reference = v;
        }

        if let Some(num_dim) = obj.get("num_dim").and_then(Value::as_u64) {
            field.num_dim = num_dim as usize;
            if field.num_dim > 0 {
                if field.field_type != FieldType::Float || !field.is_array {
                    return Err(EngineError::ClientError(format!(
                        "Field `{}` must be of type float[] to hold vectors.",
                        name
                    )));
                }
                if field.facet || obj.get("sort").and_then(Value::as_bool) == Some(true) {
                    return Err(EngineError::ClientError(format!(
                        "Vector field `{}` cannot be faceted or sorted.",
                        name
                    )));
                }
                field.sort = false;
                field.hnsw_params = Some(HnswParams::default());
            }
        }
        if let Some(v) = obj.get("vec_dist").and_then(Value::as_str) {
            field.vec_dist = VectorDistance::parse(v)?;
        }
        if let Some(params) = obj.get("hnsw_params").and_then(Value::as_object) {
            let defaults = HnswParams::default();
            field.hnsw_params = Some(HnswParams {
                m: params.get("M").and_then(Value::as_u64).unwrap_or(defaults.m as u64) as usize,
                ef_construction: params
                    .get("ef_construction")
                    .and_then(Value::as_u64)
                    .unwrap_or(defaults.ef_construction as u64) as usize,
            });
        }

        if let Some(embed) = obj.get("embed").and_then(Value::as_object) {
            let from = embed
                .get("from")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    EngineError::ClientError(format!(
                        "Field `{}`: embed.from must list source fields.",
                        name
                    ))
                })?
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect::<Vec<_>>();
            let model_config = embed
                .get("model_config")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let model_name = model_config
                .get("model_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            field.embed = Some(EmbedConfig {
                from,
                model_name,
                model_config,
            });
        }

        Ok(field)
    }

    /// Schema JSON for persistence under `$CM_<name>`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("name".into(), json!(self.name));
        obj.insert("type".into(), json!(self.type_str()));
        obj.insert("facet".into(), json!(self.facet));
        obj.insert("optional".into(), json!(self.optional));
        obj.insert("index".into(), json!(self.index));
        obj.insert("sort".into(), json!(self.sort));
        obj.insert("infix".into(), json!(self.infix));
        if !self.locale.is_empty() {
            obj.insert("locale".into(), json!(self.locale));
        }
        if self.nested {
            obj.insert("nested".into(), json!(self.nested));
        }
        if let Some(nested_array) = self.nested_array {
            obj.insert("nested_array".into(), json!(nested_array));
        }
        if self.num_dim > 0 {
            obj.insert("num_dim".into(), json!(self.num_dim));
            obj.insert("vec_dist".into(), json!(self.vec_dist.as_str()));
        }
        if let Some(params) = &self.hnsw_params {
            obj.insert(
                "hnsw_params".into(),
                json!({ "M": params.m, "ef_construction": params.ef_construction }),
            );
        }
        if let Some(reference) = &self.reference {
            obj.insert("reference".into(), json!(reference));
            obj.insert("async_reference".into(), json!(self.async_reference));
        }
        if let Some(embed) = &self.embed {
            obj.insert(
                "embed".into(),
                json!({ "from": embed.from, "model_config": embed.model_config }),
            );
        }
        if self.range_index {
            obj.insert("range_index".into(), json!(self.range_index));
        }
        if self.stem {
            obj.insert("stem".into(), json!(self.stem));
        }
        if let Some(dict) = &self.stem_dictionary {
            obj.insert("stem_dictionary".into(), json!(dict));
        }
        if !self.store {
            obj.insert("store".into(), json!(self.store));
        }
        Value::Object(obj)
    }
}

/// Infer a field type from a JSON value, used for `auto` fields and
/// flattened nested paths.
pub fn infer_type(value: &Value) -> Option<(FieldType, bool)> {
    match value {
        Value::String(_) => Some((FieldType::String, false)),
        Value::Bool(_) => Some((FieldType::Bool, false)),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some((FieldType::Int64, false))
            } else {
                Some((FieldType::Float, false))
            }
        }
        Value::Array(items) => {
            let first = items.iter().find(|v| !v.is_null())?;
            let (kind, inner_array) = infer_type(first)?;
            if inner_array {
                // Array of arrays only occurs for geopoint[] shaped input.
                if kind == FieldType::Float || kind == FieldType::Geopoint {
                    return Some((FieldType::Geopoint, true));
                }
                return None;
            }
            Some((kind, true))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parse_round_trip() {
        for s in [
            "string", "int32", "int64", "float", "bool", "geopoint", "string[]", "int32[]",
            "int64[]", "float[]", "bool[]", "geopoint[]", "object", "object[]", "auto", "image",
        ] {
            let (kind, is_array) = FieldType::parse(s).unwrap();
            let field = Field::new("f", kind, is_array);
            assert_eq!(field.type_str(), s);
        }
    }

    #[test]
    fn test_invalid_type_rejected() {
        assert!(FieldType::parse("decimal").is_err());
        assert!(FieldType::parse("auto[]").is_err());
    }

    #[test]
    fn test_id_field_is_reserved() {
        let err = Field::from_json(&serde_json::json!({"name": "id", "type": "string"}));
        assert!(err.is_err());
    }

    #[test]
    fn test_numeric_fields_always_sortable() {
        let field = Field::from_json(&serde_json::json!({"name": "points", "type": "int32"})).unwrap();
        assert!(field.sortable());

        let field = Field::from_json(&serde_json::json!({"name": "title", "type": "string"})).unwrap();
        assert!(!field.sortable());

        let field = Field::from_json(
            &serde_json::json!({"name": "title", "type": "string", "sort": true}),
        )
        .unwrap();
        assert!(field.sortable());
    }

    #[test]
    fn test_vector_field_rules() {
        let field = Field::from_json(
            &serde_json::json!({"name": "emb", "type": "float[]", "num_dim": 4}),
        )
        .unwrap();
        assert!(field.is_vector());
        assert_eq!(field.hnsw_params.as_ref().unwrap().m, 16);

        // Vectors must be float[].
        assert!(Field::from_json(
            &serde_json::json!({"name": "emb", "type": "string", "num_dim": 4})
        )
        .is_err());

        // Vectors are not facetable.
        assert!(Field::from_json(
            &serde_json::json!({"name": "emb", "type": "float[]", "num_dim": 4, "facet": true})
        )
        .is_err());
    }

    #[test]
    fn test_dynamic_pattern_matching() {
        let field = Field::from_json(&serde_json::json!({"name": ".*", "type": "auto"})).unwrap();
        assert!(field.is_dynamic());
        assert!(field.matches("anything"));

        let field =
            Field::from_json(&serde_json::json!({"name": "price_.*", "type": "float"})).unwrap();
        assert!(field.matches("price_usd"));
        assert!(!field.matches("title"));
    }

    #[test]
    fn test_reference_requires_dotted_path() {
        assert!(Field::from_json(
            &serde_json::json!({"name": "author_id", "type": "string", "reference": "authors"})
        )
        .is_err());

        let field = Field::from_json(
            &serde_json::json!({"name": "author_id", "type": "string", "reference": "authors.id"}),
        )
        .unwrap();
        assert_eq!(field.reference.as_deref(), Some("authors.id"));
    }

    #[test]
    fn test_infer_type() {
        assert_eq!(
            infer_type(&serde_json::json!("x")),
            Some((FieldType::String, false))
        );
        assert_eq!(
            infer_type(&serde_json::json!(3)),
            Some((FieldType::Int64, false))
        );
        assert_eq!(
            infer_type(&serde_json::json!(3.5)),
            Some((FieldType::Float, false))
        );
        assert_eq!(
            infer_type(&serde_json::json!(["a", "b"])),
            Some((FieldType::String, true))
        );
        assert_eq!(infer_type(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_json_round_trip() {
        let value = serde_json::json!({
            "name": "title", "type": "string", "facet": true, "locale": "en", "stem": true
        });
        let field = Field::from_json(&value).unwrap();
        let back = Field::from_json(&field.to_json()).unwrap();
        assert_eq!(field, back);
    }
}
