use serde_json::{json, Map, Value};

use crate::error::{EngineError, EngineResult};

/// Match mode of an override rule against the raw query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleMatch {
    #[default]
    Exact,
    Contains,
}

/// A curation rule: pin/hide documents or rewrite filter & sort for queries
/// matching the rule.
#[derive(Debug, Clone, Default)]
pub struct Override {
    pub id: String,
    pub rule_query: Option<String>,
    pub rule_match: RuleMatch,
    pub rule_filter_by: Option<String>,
    pub rule_tags: Vec<String>,
    pub includes: Vec<(String, usize)>,
    pub excludes: Vec<String>,
    pub filter_by: Option<String>,
    pub sort_by: Option<String>,
    pub replace_query: Option<String>,
    pub filter_curated_hits: bool,
    pub stop_processing: bool,
}

impl Override {
    pub fn from_json(id: &str, value: &Value) -> EngineResult<Override> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::ClientError("Override must be an object.".into()))?;

        let mut ov = Override {
            id: id.to_string(),
            stop_processing: obj
                .get("stop_processing")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            ..Override::default()
        };

        if let Some(rule) = obj.get("rule").and_then(Value::as_object) {
            ov.rule_query = rule.get("query").and_then(Value::as_str).map(String::from);
            ov.rule_match = match rule.get("match").and_then(Value::as_str) {
                Some("contains") => RuleMatch::Contains,
                _ => RuleMatch::Exact,
            };
            ov.rule_filter_by = rule
                .get("filter_by")
                .and_then(Value::as_str)
                .map(String::from);
            ov.rule_tags = rule
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
        }
        if ov.rule_query.is_none() && ov.rule_filter_by.is_none() && ov.rule_tags.is_empty() {
            return Err(EngineError::ClientError(
                "An override must have a `rule` with a query, filter_by or tags.".into(),
            ));
        }

        for include in obj.get("includes").and_then(Value::as_array).into_iter().flatten() {
            let id = include.get("id").and_then(Value::as_str).ok_or_else(|| {
                EngineError::ClientError("Override include must carry an `id`.".into())
            })?;
            let position = include
                .get("position")
                .and_then(Value::as_u64)
                .unwrap_or(1)
                .max(1) as usize;
            ov.includes.push((id.to_string(), position));
        }
        for exclude in obj.get("excludes").and_then(Value::as_array).into_iter().flatten() {
            if let Some(id) = exclude.get("id").and_then(Value::as_str) {
                ov.excludes.push(id.to_string());
            }
        }

        ov.filter_by = obj.get("filter_by").and_then(Value::as_str).map(String::from);
        ov.sort_by = obj.get("sort_by").and_then(Value::as_str).map(String::from);
        ov.replace_query = obj
            .get("replace_query")
            .and_then(Value::as_str)
            .map(String::from);
        ov.filter_curated_hits = obj
            .get("filter_curated_hits")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(ov)
    }

    pub fn to_json(&self) -> Value {
        let mut rule = Map::new();
        if let Some(q) = &self.rule_query {
            rule.insert("query".into(), json!(q));
            rule.insert(
                "match".into(),
                json!(match self.rule_match {
                    RuleMatch::Exact => "exact",
                    RuleMatch::Contains => "contains",
                }),
            );
        }
        if let Some(f) = &self.rule_filter_by {
            rule.insert("filter_by".into(), json!(f));
        }
        if !self.rule_tags.is_empty() {
            rule.insert("tags".into(), json!(self.rule_tags));
        }

        json!({
            "id": self.id,
            "rule": rule,
            "includes": self.includes.iter()
                .map(|(id, position)| json!({"id": id, "position": position}))
                .collect::<Vec<_>>(),
            "excludes": self.excludes.iter()
                .map(|id| json!({"id": id}))
                .collect::<Vec<_>>(),
            "filter_by": self.filter_by,
            "sort_by": self.sort_by,
            "replace_query": self.replace_query,
            "filter_curated_hits": self.filter_curated_hits,
            "stop_processing": self.stop_processing,
        })
    }

    /// Whether the rule fires for this query / tag set.
    pub fn matches(&self, raw_query: &str, tags: &[String]) -> bool {
        if !self.rule_tags.is_empty() {
            return self.rule_tags.iter().any(|t| tags.contains(t));
        }
        match (&self.rule_query, self.rule_match) {
            (Some(rule), RuleMatch::Exact) => rule.eq_ignore_ascii_case(raw_query),
            (Some(rule), RuleMatch::Contains) => raw_query
                .to_lowercase()
                .contains(&rule.to_lowercase()),
            (None, _) => false,
        }
    }
}

/// A synonym set: multi-way (`synonyms` all equivalent) or one-way
/// (`root` expands to `synonyms`).
#[derive(Debug, Clone, Default)]
pub struct Synonym {
    pub id: String,
    pub root: Option<String>,
    pub synonyms: Vec<String>,
}

impl Synonym {
    pub fn from_json(id: &str, value: &Value) -> EngineResult<Synonym> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::ClientError("Synonym must be an object.".into()))?;
        let synonyms: Vec<String> = obj
            .get("synonyms")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        if synonyms.is_empty() {
            return Err(EngineError::ClientError(
                "A synonym must list at least one value.".into(),
            ));
        }
        Ok(Synonym {
            id: id.to_string(),
            root: obj
                .get("root")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase),
            synonyms,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "root": self.root,
            "synonyms": self.synonyms,
        })
    }

    /// Expansions of `phrase` under this set, excluding the phrase itself.
    pub fn expansions_for(&self, phrase: &str) -> Vec<String> {
        match &self.root {
            Some(root) => {
                if root == phrase {
                    self.synonyms.clone()
                } else {
                    Vec::new()
                }
            }
            None => {
                if self.synonyms.iter().any(|s| s == phrase) {
                    self.synonyms.iter().filter(|s| *s != phrase).cloned().collect()
                } else {
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_override_round_trip() {
        let value = json!({
            "rule": {"query": "apple", "match": "exact"},
            "includes": [{"id": "doc1", "position": 1}],
            "excludes": [{"id": "doc9"}],
            "filter_by": "points:>10"
        });
        let ov = Override::from_json("ov1", &value).unwrap();
        assert!(ov.matches("apple", &[]));
        assert!(ov.matches("Apple", &[]));
        assert!(!ov.matches("apples", &[]));

        let back = Override::from_json("ov1", &ov.to_json()).unwrap();
        assert_eq!(back.includes, vec![("doc1".to_string(), 1)]);
        assert_eq!(back.excludes, vec!["doc9".to_string()]);
        assert_eq!(back.filter_by.as_deref(), Some("points:>10"));
    }

    #[test]
    fn test_override_contains_match() {
        let ov = Override::from_json(
            "ov1",
            &json!({"rule": {"query": "shoe", "match": "contains"}}),
        )
        .unwrap();
        assert!(ov.matches("red shoes", &[]));
        assert!(!ov.matches("sandals", &[]));
    }

    #[test]
    fn test_override_tags() {
        let ov = Override::from_json("ov1", &json!({"rule": {"tags": ["summer"]}})).unwrap();
        assert!(ov.matches("anything", &["summer".to_string()]));
        assert!(!ov.matches("anything", &[]));
    }

    #[test]
    fn test_override_without_rule_rejected() {
        assert!(Override::from_json("x", &json!({"includes": []})).is_err());
    }

    #[test]
    fn test_synonym_multi_way() {
        let syn =
            Synonym::from_json("s1", &json!({"synonyms": ["sneakers", "trainers"]})).unwrap();
        assert_eq!(syn.expansions_for("sneakers"), vec!["trainers"]);
        assert_eq!(syn.expansions_for("trainers"), vec!["sneakers"]);
        assert!(syn.expansions_for("boots").is_empty());
    }

    #[test]
    fn test_synonym_one_way() {
        let syn = Synonym::from_json(
            "s1",
            &json!({"root": "shoes", "synonyms": ["sneakers", "boots"]}),
        )
        .unwrap();
        assert_eq!(syn.expansions_for("shoes"), vec!["sneakers", "boots"]);
        assert!(syn.expansions_for("sneakers").is_empty());
    }
}
