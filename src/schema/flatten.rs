use serde_json::{Map, Value};

use super::field::{infer_type, Field, FieldType, FLAT_SIDECAR_KEY};
use crate::error::{EngineError, EngineResult};

/// A dotted nested path together with its collected value(s).
struct Leaf {
    name: String,
    values: Vec<Value>,
    via_array: bool,
}

/// Expand every nested path of `doc` reachable via a matching field pattern
/// into flat dotted top-level keys, recording the synthesized names under
/// `.flat`. Returns the flattened-field descriptors to promote into the
/// schema (`nested = true`, `nested_array` as observed).
pub fn flatten_document(
    doc: &mut Map<String, Value>,
    fields: &[Field],
) -> EngineResult<Vec<Field>> {
    let mut leaves: Vec<Leaf> = Vec::new();
    for (key, value) in doc.iter() {
        if key == FLAT_SIDECAR_KEY {
            continue;
        }
        match value {
            Value::Object(_) => collect_leaves(key, value, false, &mut leaves),
            Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => {
                collect_leaves(key, value, false, &mut leaves)
            }
            _ => {}
        }
    }

    let mut flat_names: Vec<String> = Vec::new();
    let mut promoted: Vec<Field> = Vec::new();

    for leaf in leaves {
        let matched = fields.iter().find(|f| f.matches(&leaf.name));
        let Some(pattern) = matched else {
            continue;
        };

        // A singular-typed declaration cannot sit behind an array of objects.
        if leaf.via_array && !pattern.is_dynamic() && !pattern.is_array {
            return Err(EngineError::ClientError(format!(
                "Field `{}` has an array of objects in its path; declare it as `{}[]`.",
                leaf.name,
                pattern.field_type.as_str()
            )));
        }

        let flat_value = if leaf.via_array {
            let mut merged = Vec::new();
            for v in leaf.values {
                match v {
                    Value::Array(items) => merged.extend(items),
                    other => merged.push(other),
                }
            }
            Value::Array(merged)
        } else {
            leaf.values.into_iter().next().unwrap_or(Value::Null)
        };

        let (kind, is_array) = if pattern.is_dynamic() || pattern.field_type == FieldType::Auto {
            match infer_type(&flat_value) {
                Some(t) => t,
                None => continue,
            }
        } else {
            (pattern.field_type, pattern.is_array)
        };

        let mut flat_field = Field::new(&leaf.name, kind, is_array || leaf.via_array);
        flat_field.nested = true;
        flat_field.nested_array = Some(leaf.via_array);
        flat_field.facet = pattern.facet;
        flat_field.optional = true;
        flat_field.index = pattern.index;
        flat_field.locale = pattern.locale.clone();
        promoted.push(flat_field);

        doc.insert(leaf.name.clone(), flat_value);
        flat_names.push(leaf.name);
    }

    if !flat_names.is_empty() {
        doc.insert(
            FLAT_SIDECAR_KEY.to_string(),
            Value::Array(flat_names.into_iter().map(Value::String).collect()),
        );
    }

    Ok(promoted)
}

fn collect_leaves(prefix: &str, value: &Value, via_array: bool, out: &mut Vec<Leaf>) {
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                let path = format!("{}.{}", prefix, key);
                collect_leaves(&path, child, via_array, out);
            }
        }
        Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => {
            for item in items {
                collect_leaves(prefix, item, true, out);
            }
        }
        other => {
            // Scalar or array-of-scalars: a leaf. Prefixed paths only; plain
            // top-level scalars are already flat.
            if !prefix.contains('.') {
                return;
            }
            if let Some(existing) = out.iter_mut().find(|l| l.name == prefix) {
                existing.values.push(other.clone());
                existing.via_array |= via_array;
            } else {
                out.push(Leaf {
                    name: prefix.to_string(),
                    values: vec![other.clone()],
                    via_array,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auto_fields() -> Vec<Field> {
        vec![Field::from_json(&json!({"name": ".*", "type": "auto"})).unwrap()]
    }

    #[test]
    fn test_flatten_simple_object() {
        let mut doc = json!({"id": "0", "company": {"name": "Nike"}})
            .as_object()
            .unwrap()
            .clone();
        let promoted = flatten_document(&mut doc, &auto_fields()).unwrap();

        assert_eq!(doc.get("company.name"), Some(&json!("Nike")));
        assert_eq!(doc.get(".flat"), Some(&json!(["company.name"])));
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].name, "company.name");
        assert!(promoted[0].nested);
        assert_eq!(promoted[0].nested_array, Some(false));
        assert_eq!(promoted[0].field_type, FieldType::String);
        assert!(!promoted[0].is_array);
    }

    #[test]
    fn test_flatten_array_of_objects_aggregates() {
        let mut doc = json!({
            "id": "0",
            "locations": [
                {"address": {"street": "One Bowerman Drive"}},
                {"address": {"street": "175 Commerce Valley"}}
            ]
        })
        .as_object()
        .unwrap()
        .clone();
        let promoted = flatten_document(&mut doc, &auto_fields()).unwrap();

        assert_eq!(
            doc.get("locations.address.street"),
            Some(&json!(["One Bowerman Drive", "175 Commerce Valley"]))
        );
        assert_eq!(promoted[0].nested_array, Some(true));
        assert!(promoted[0].is_array);
    }

    #[test]
    fn test_singular_declaration_behind_object_array_rejected() {
        let fields = vec![Field::from_json(
            &json!({"name": "locations.address.street", "type": "string"}),
        )
        .unwrap()];
        let mut doc = json!({
            "locations": [{"address": {"street": "a"}}, {"address": {"street": "b"}}]
        })
        .as_object()
        .unwrap()
        .clone();

        let err = flatten_document(&mut doc, &fields).unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_unmatched_paths_are_skipped() {
        let fields = vec![Field::from_json(
            &json!({"name": "company.name", "type": "string"}),
        )
        .unwrap()];
        let mut doc = json!({"company": {"name": "Nike", "size": 3}})
            .as_object()
            .unwrap()
            .clone();
        let promoted = flatten_document(&mut doc, &fields).unwrap();

        assert_eq!(promoted.len(), 1);
        assert!(doc.contains_key("company.name"));
        assert!(!doc.contains_key("company.size"));
    }

    #[test]
    fn test_scalar_arrays_inside_objects() {
        let mut doc = json!({"spec": {"colors": ["red", "blue"]}})
            .as_object()
            .unwrap()
            .clone();
        let promoted = flatten_document(&mut doc, &auto_fields()).unwrap();

        assert_eq!(doc.get("spec.colors"), Some(&json!(["red", "blue"])));
        assert!(promoted[0].is_array);
        assert_eq!(promoted[0].nested_array, Some(false));
    }
}
