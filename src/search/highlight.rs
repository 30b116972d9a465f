use std::collections::HashSet;

use serde_json::{json, Map, Value};

/// Knobs for one field's highlight rendering.
#[derive(Debug, Clone)]
pub struct HighlightOptions {
    pub start_tag: String,
    pub end_tag: String,
    pub snippet_threshold: usize,
    pub affix_tokens: usize,
    pub full_value: bool,
}

/// Highlight of one string value: the marked snippet, the tokens that
/// matched, and optionally the fully marked value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueHighlight {
    pub snippet: String,
    pub matched_tokens: Vec<String>,
    pub value: Option<String>,
}

fn normalize_word(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Mark matched token spans inside `text`. Short values (fewer tokens than
/// `snippet_threshold`) are returned wholly; longer ones are windowed to
/// `affix_tokens` words around the matched span.
pub fn highlight_value(
    text: &str,
    matched: &HashSet<String>,
    opts: &HighlightOptions,
) -> ValueHighlight {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut marked: Vec<String> = Vec::with_capacity(words.len());
    let mut matched_tokens: Vec<String> = Vec::new();
    let mut match_positions: Vec<usize> = Vec::new();

    for (i, word) in words.iter().enumerate() {
        let core = normalize_word(word);
        if !core.is_empty() && matched.contains(&core) {
            match_positions.push(i);
            // Wrap only the alphanumeric core, keeping punctuation outside.
            let start = word.find(|c: char| c.is_alphanumeric()).unwrap_or(0);
            let end = word
                .rfind(|c: char| c.is_alphanumeric())
                .map(|p| p + word[p..].chars().next().map_or(1, char::len_utf8))
                .unwrap_or(word.len());
            let token_text = &word[start..end];
            matched_tokens.push(token_text.to_string());
            marked.push(format!(
                "{}{}{}{}{}",
                &word[..start],
                opts.start_tag,
                token_text,
                opts.end_tag,
                &word[end..]
            ));
        } else {
            marked.push(word.to_string());
        }
    }

    let full = marked.join(" ");
    let snippet = if opts.full_value
        || words.len() < opts.snippet_threshold
        || match_positions.is_empty()
    {
        full.clone()
    } else {
        let first = *match_positions.first().expect("non-empty");
        let last = *match_positions.last().expect("non-empty");
        let window_start = first.saturating_sub(opts.affix_tokens);
        let window_end = (last + opts.affix_tokens + 1).min(marked.len());
        marked[window_start..window_end].join(" ")
    };

    ValueHighlight {
        snippet,
        matched_tokens,
        value: opts.full_value.then_some(full),
    }
}

fn leaf_json(h: &ValueHighlight) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "matched_tokens".into(),
        Value::Array(h.matched_tokens.iter().cloned().map(Value::String).collect()),
    );
    obj.insert("snippet".into(), Value::String(h.snippet.clone()));
    if let Some(value) = &h.value {
        obj.insert("value".into(), Value::String(value.clone()));
    }
    Value::Object(obj)
}

/// Build the highlight subtree for one (possibly nested) field path,
/// mirroring the original document's structure. Returns `None` when nothing
/// under the path is a string.
pub fn nested_highlight(
    node: &Value,
    path: &[&str],
    matched: &HashSet<String>,
    opts: &HighlightOptions,
) -> Option<Value> {
    if path.is_empty() {
        return match node {
            Value::String(text) => Some(leaf_json(&highlight_value(text, matched, opts))),
            Value::Array(items) => {
                let leaves: Vec<Value> = items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => leaf_json(&highlight_value(text, matched, opts)),
                        other => other.clone(),
                    })
                    .collect();
                Some(Value::Array(leaves))
            }
            _ => None,
        };
    }

    match node {
        Value::Object(obj) => {
            let child = obj.get(path[0])?;
            let sub = nested_highlight(child, &path[1..], matched, opts)?;
            let mut out = Map::new();
            out.insert(path[0].to_string(), sub);
            Some(Value::Object(out))
        }
        Value::Array(items) => {
            // An array of objects along the path mirrors per element.
            let subs: Vec<Value> = items
                .iter()
                .map(|item| {
                    nested_highlight(item, path, matched, opts).unwrap_or(Value::Object(Map::new()))
                })
                .collect();
            if subs.iter().all(|s| s.as_object().is_some_and(Map::is_empty)) {
                return None;
            }
            Some(Value::Array(subs))
        }
        _ => None,
    }
}

/// Deep-merge one field's highlight subtree into the hit's `highlight` object.
pub fn merge_highlight(target: &mut Map<String, Value>, addition: Value) {
    let Value::Object(addition) = addition else {
        return;
    };
    for (key, value) in addition {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_highlight(existing, Value::Object(incoming));
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                for (slot, item) in existing.iter_mut().zip(incoming) {
                    if let (Value::Object(slot_obj), Value::Object(item_obj)) =
                        (slot.clone(), item.clone())
                    {
                        let mut merged = slot_obj;
                        merge_highlight(&mut merged, Value::Object(item_obj));
                        *slot = Value::Object(merged);
                    }
                }
            }
            (entry, value) => {
                if entry.is_none() {
                    target.insert(key, value);
                }
            }
        }
    }
}

/// The backward-compatible flat `highlights` array entry for one field.
pub fn v1_entry(field: &str, highlight: &ValueHighlight, is_array: bool, index: usize) -> Value {
    let mut obj = Map::new();
    obj.insert("field".into(), Value::String(field.to_string()));
    if is_array {
        obj.insert("indices".into(), json!([index]));
        obj.insert("snippets".into(), json!([highlight.snippet]));
    } else {
        obj.insert("snippet".into(), Value::String(highlight.snippet.clone()));
    }
    obj.insert(
        "matched_tokens".into(),
        Value::Array(
            highlight
                .matched_tokens
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        ),
    );
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> HighlightOptions {
        HighlightOptions {
            start_tag: "<mark>".into(),
            end_tag: "</mark>".into(),
            snippet_threshold: 30,
            affix_tokens: 4,
            full_value: false,
        }
    }

    fn matched(tokens: &[&str]) -> HashSet<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_short_value_wholly_highlighted() {
        let h = highlight_value("175 Commerce Valley", &matched(&["commerce"]), &opts());
        assert_eq!(h.snippet, "175 <mark>Commerce</mark> Valley");
        assert_eq!(h.matched_tokens, vec!["Commerce"]);
    }

    #[test]
    fn test_punctuation_stays_outside_tags() {
        let h = highlight_value("Hello, Sherlock!", &matched(&["sherlock"]), &opts());
        assert_eq!(h.snippet, "Hello, <mark>Sherlock</mark>!");
    }

    #[test]
    fn test_long_value_snippeted() {
        let words: Vec<String> = (0..50).map(|i| format!("w{}", i)).collect();
        let text = format!("{} target {}", words[..20].join(" "), words[20..].join(" "));
        let mut options = opts();
        options.affix_tokens = 2;

        let h = highlight_value(&text, &matched(&["target"]), &options);
        assert_eq!(h.snippet, "w18 w19 <mark>target</mark> w20 w21");
    }

    #[test]
    fn test_full_value_mode() {
        let mut options = opts();
        options.full_value = true;
        let h = highlight_value("a b target c", &matched(&["target"]), &options);
        assert_eq!(h.value.as_deref(), Some("a b <mark>target</mark> c"));
        assert_eq!(h.snippet, "a b <mark>target</mark> c");
    }

    #[test]
    fn test_nested_highlight_mirrors_arrays() {
        let doc = json!({
            "locations": [
                {"address": {"street": "One Bowerman Drive"}},
                {"address": {"street": "175 Commerce Valley"}}
            ]
        });
        let h = nested_highlight(
            &doc,
            &["locations", "address", "street"],
            &matched(&["commerce"]),
            &opts(),
        )
        .unwrap();

        let arr = h.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        let second = &arr[1]["address"]["street"];
        assert_eq!(second["snippet"], "175 <mark>Commerce</mark> Valley");
        assert_eq!(second["matched_tokens"], json!(["Commerce"]));
        let first = &arr[0]["address"]["street"];
        assert_eq!(first["matched_tokens"], json!([]));
    }

    #[test]
    fn test_nested_highlight_missing_path() {
        let doc = json!({"a": {"b": 42}});
        assert!(nested_highlight(&doc, &["a", "b"], &matched(&["x"]), &opts()).is_none());
        assert!(nested_highlight(&doc, &["a", "missing"], &matched(&["x"]), &opts()).is_none());
    }

    #[test]
    fn test_merge_highlight() {
        let mut target = Map::new();
        merge_highlight(
            &mut target,
            json!({"company": {"name": {"snippet": "x", "matched_tokens": []}}}),
        );
        merge_highlight(
            &mut target,
            json!({"company": {"country": {"snippet": "y", "matched_tokens": []}}}),
        );
        assert!(target["company"].get("name").is_some());
        assert!(target["company"].get("country").is_some());
    }
}
