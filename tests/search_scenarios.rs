use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use finchdb::{CollectionManager, Store, WriteOperation};
use serde_json::{json, Value};
use tempfile::TempDir;

fn manager() -> (TempDir, CollectionManager) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("db")).unwrap());
    (dir, CollectionManager::new(store, 1000))
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn search(mgr: &CollectionManager, coll: &str, pairs: &[(&str, &str)]) -> Value {
    mgr.do_search(params(pairs), BTreeMap::new(), coll, Instant::now())
        .unwrap()
}

#[test]
fn create_index_and_search() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "books",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "points", "type": "int32"}
        ],
        "default_sorting_field": "points"
    }))
    .unwrap();
    mgr.add_document(
        "books",
        json!({"id": "0", "title": "Sherlock Holmes", "points": 100}),
        WriteOperation::Create,
    )
    .unwrap();

    let result = search(&mgr, "books", &[("q", "sherlock"), ("query_by", "title")]);
    assert_eq!(result["found"], 1);
    assert_eq!(result["hits"][0]["document"]["id"], "0");
    assert_eq!(result["hits"][0]["document"]["title"], "Sherlock Holmes");
}

#[test]
fn atomic_increment_via_update() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "books",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "points", "type": "int32"}
        ],
        "default_sorting_field": "points"
    }))
    .unwrap();
    mgr.add_document(
        "books",
        json!({"id": "0", "title": "Sherlock Holmes", "points": 100}),
        WriteOperation::Create,
    )
    .unwrap();
    mgr.add_document(
        "books",
        json!({"id": "0", "$operations": {"increment": {"points": 1}}}),
        WriteOperation::Update,
    )
    .unwrap();

    let result = search(&mgr, "books", &[("q", "*"), ("filter_by", "points:101")]);
    assert_eq!(result["found"], 1);
    assert_eq!(result["hits"][0]["document"]["points"], 101);
}

#[test]
fn nested_flattening_and_highlight() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "coll",
        "enable_nested_fields": true,
        "fields": [{"name": ".*", "type": "auto"}]
    }))
    .unwrap();
    mgr.add_document(
        "coll",
        json!({
            "id": "0",
            "company": {"name": "Nike"},
            "locations": [
                {"address": {"street": "One Bowerman Drive"}},
                {"address": {"street": "175 Commerce Valley"}}
            ]
        }),
        WriteOperation::Create,
    )
    .unwrap();

    let result = search(
        &mgr,
        "coll",
        &[("q", "commerce"), ("query_by", "locations.address.street")],
    );
    assert_eq!(result["found"], 1);

    // Highlight mirrors the nested structure of the original field.
    let street = &result["hits"][0]["highlight"]["locations"][1]["address"]["street"];
    assert_eq!(street["snippet"], "175 <mark>Commerce</mark> Valley");
    assert_eq!(street["matched_tokens"], json!(["Commerce"]));

    // The flattened sidecar never shows in the document.
    let document = &result["hits"][0]["document"];
    assert!(document.get("locations.address.street").is_none());
    assert!(document.get(".flat").is_none());
}

#[test]
fn reference_filter_between_collections() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "authors",
        "fields": [{"name": "name", "type": "string"}]
    }))
    .unwrap();
    mgr.create_collection(&json!({
        "name": "books",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "author_id", "type": "string", "reference": "authors.id"}
        ]
    }))
    .unwrap();
    mgr.add_document(
        "authors",
        json!({"id": "a1", "name": "Doyle"}),
        WriteOperation::Create,
    )
    .unwrap();
    mgr.add_document(
        "books",
        json!({"id": "b1", "title": "Sign of Four", "author_id": "a1"}),
        WriteOperation::Create,
    )
    .unwrap();

    let result = search(
        &mgr,
        "books",
        &[("q", "*"), ("filter_by", "$authors(name:Doyle)")],
    );
    assert_eq!(result["found"], 1);
    assert_eq!(result["hits"][0]["document"]["id"], "b1");
}

#[test]
fn six_char_token_gets_at_most_one_typo() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [{"name": "title", "type": "string"}]
    }))
    .unwrap();
    mgr.add_document(
        "c",
        json!({"id": "0", "title": "flower"}),
        WriteOperation::Create,
    )
    .unwrap();

    // Distance 2 from a 6-char token: below min_len_2typo, so no match.
    let result = search(
        &mgr,
        "c",
        &[("q", "flewar"), ("query_by", "title"), ("num_typos", "2"), ("prefix", "false")],
    );
    assert_eq!(result["found"], 0);

    // Distance 1 matches.
    let result = search(
        &mgr,
        "c",
        &[("q", "flowes"), ("query_by", "title"), ("num_typos", "2"), ("prefix", "false")],
    );
    assert_eq!(result["found"], 1);
}

#[test]
fn four_sort_clauses_rejected() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [
            {"name": "a", "type": "int32"},
            {"name": "b", "type": "int32"},
            {"name": "c", "type": "int32"},
            {"name": "d", "type": "int32"}
        ]
    }))
    .unwrap();

    let err = mgr
        .do_search(
            params(&[("q", "*"), ("sort_by", "a:asc,b:asc,c:asc,d:asc")]),
            BTreeMap::new(),
            "c",
            Instant::now(),
        )
        .unwrap_err();
    assert_eq!(err.code(), 400);
}

#[test]
fn oversized_filter_rejected() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [{"name": "n", "type": "int32"}]
    }))
    .unwrap();

    let expr = (0..60)
        .map(|i| format!("n:{}", i))
        .collect::<Vec<_>>()
        .join(" || ");
    let err = mgr
        .do_search(
            params(&[("q", "*"), ("filter_by", expr.as_str())]),
            BTreeMap::new(),
            "c",
            Instant::now(),
        )
        .unwrap_err();
    assert_eq!(err.code(), 400);
}

#[test]
fn pagination_respects_limit_hits() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [{"name": "title", "type": "string"}]
    }))
    .unwrap();
    for i in 0..30 {
        mgr.add_document(
            "c",
            json!({"id": i.to_string(), "title": "common term"}),
            WriteOperation::Create,
        )
        .unwrap();
    }

    // per_page + offset beyond limit_hits is rejected.
    let err = mgr
        .do_search(
            params(&[
                ("q", "*"),
                ("per_page", "4"),
                ("offset", "2"),
                ("limit_hits", "5"),
            ]),
            BTreeMap::new(),
            "c",
            Instant::now(),
        )
        .unwrap_err();
    assert_eq!(err.code(), 400);

    // Within bounds, the page never exceeds per_page.
    let result = search(
        &mgr,
        "c",
        &[("q", "common"), ("query_by", "title"), ("per_page", "7"), ("page", "2")],
    );
    assert_eq!(result["found"], 30);
    assert_eq!(result["hits"].as_array().unwrap().len(), 7);
    assert_eq!(result["page"], 2);
}

#[test]
fn facets_group_and_sort() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "shoes",
        "fields": [
            {"name": "name", "type": "string"},
            {"name": "brand", "type": "string", "facet": true},
            {"name": "price", "type": "float"}
        ],
        "default_sorting_field": "price"
    }))
    .unwrap();
    for (i, (brand, price)) in [("nike", 50.0), ("nike", 120.0), ("adidas", 80.0), ("puma", 30.0)]
        .iter()
        .enumerate()
    {
        mgr.add_document(
            "shoes",
            json!({"id": i.to_string(), "name": "running shoe", "brand": brand, "price": price}),
            WriteOperation::Create,
        )
        .unwrap();
    }

    let result = search(
        &mgr,
        "shoes",
        &[
            ("q", "*"),
            ("facet_by", "brand"),
            ("sort_by", "price:asc"),
        ],
    );
    assert_eq!(result["found"], 4);
    // Cheapest first under price:asc.
    assert_eq!(result["hits"][0]["document"]["brand"], "puma");

    let facet = &result["facet_counts"][0];
    assert_eq!(facet["field_name"], "brand");
    let counts = facet["counts"].as_array().unwrap();
    assert_eq!(counts[0]["value"], "nike");
    assert_eq!(counts[0]["count"], 2);

    // Range-bucket facets.
    let result = search(
        &mgr,
        "shoes",
        &[("q", "*"), ("facet_by", "price(cheap:[0..60], premium:[60..200])")],
    );
    let counts = result["facet_counts"][0]["counts"].as_array().unwrap();
    assert_eq!(counts[0]["value"], "cheap");
    assert_eq!(counts[0]["count"], 2);
    assert_eq!(counts[1]["count"], 2);

    // Grouping caps hits per group.
    let result = search(
        &mgr,
        "shoes",
        &[("q", "*"), ("group_by", "brand"), ("group_limit", "1")],
    );
    let groups = result["grouped_hits"].as_array().unwrap();
    assert_eq!(groups.len(), 3);
    for group in groups {
        assert_eq!(group["hits"].as_array().unwrap().len(), 1);
    }
}

#[test]
fn overrides_pin_and_hide() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [{"name": "title", "type": "string"}]
    }))
    .unwrap();
    for (id, title) in [("a", "apple pie"), ("b", "apple tart"), ("c", "apple cake")] {
        mgr.add_document(
            "c",
            json!({"id": id, "title": title}),
            WriteOperation::Create,
        )
        .unwrap();
    }

    let ov = finchdb::collection::Override::from_json(
        "promo",
        &json!({
            "rule": {"query": "apple", "match": "exact"},
            "includes": [{"id": "c", "position": 1}],
            "excludes": [{"id": "a"}]
        }),
    )
    .unwrap();
    mgr.upsert_override("c", ov).unwrap();

    let result = search(&mgr, "c", &[("q", "apple"), ("query_by", "title")]);
    assert_eq!(result["hits"][0]["document"]["id"], "c");
    let ids: Vec<&str> = result["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["document"]["id"].as_str().unwrap())
        .collect();
    assert!(!ids.contains(&"a"));
}

#[test]
fn synonyms_expand_queries() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [{"name": "title", "type": "string"}]
    }))
    .unwrap();
    mgr.add_document(
        "c",
        json!({"id": "0", "title": "smart sneakers"}),
        WriteOperation::Create,
    )
    .unwrap();

    let synonym = finchdb::collection::Synonym::from_json(
        "shoe-syn",
        &json!({"synonyms": ["sneakers", "trainers"]}),
    )
    .unwrap();
    mgr.upsert_synonym("c", synonym).unwrap();

    let result = search(&mgr, "c", &[("q", "trainers"), ("query_by", "title")]);
    assert_eq!(result["found"], 1);

    // Synonyms off: no match.
    let result = search(
        &mgr,
        "c",
        &[("q", "trainers"), ("query_by", "title"), ("enable_synonyms", "false")],
    );
    assert_eq!(result["found"], 0);
}

#[test]
fn vector_and_hybrid_search() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "emb", "type": "float[]", "num_dim": 2}
        ]
    }))
    .unwrap();
    mgr.add_document(
        "c",
        json!({"id": "0", "title": "red shirt", "emb": [1.0, 0.0]}),
        WriteOperation::Create,
    )
    .unwrap();
    mgr.add_document(
        "c",
        json!({"id": "1", "title": "blue shirt", "emb": [0.0, 1.0]}),
        WriteOperation::Create,
    )
    .unwrap();

    let result = search(
        &mgr,
        "c",
        &[("q", "*"), ("vector_query", "emb:([0.9, 0.1], k:2)")],
    );
    assert_eq!(result["found"], 2);
    assert_eq!(result["hits"][0]["document"]["id"], "0");
    assert!(result["hits"][0]["vector_distance"].is_number());

    let d0 = result["hits"][0]["vector_distance"].as_f64().unwrap();
    let d1 = result["hits"][1]["vector_distance"].as_f64().unwrap();
    assert!(d0 < d1);
}

#[test]
fn geo_filter_and_sort() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "places",
        "fields": [
            {"name": "name", "type": "string"},
            {"name": "loc", "type": "geopoint"}
        ]
    }))
    .unwrap();
    mgr.add_document(
        "places",
        json!({"id": "paris", "name": "office", "loc": [48.8566, 2.3522]}),
        WriteOperation::Create,
    )
    .unwrap();
    mgr.add_document(
        "places",
        json!({"id": "london", "name": "office", "loc": [51.5074, -0.1278]}),
        WriteOperation::Create,
    )
    .unwrap();

    let result = search(
        &mgr,
        "places",
        &[("q", "*"), ("filter_by", "loc:(48.85, 2.35, 20 km)")],
    );
    assert_eq!(result["found"], 1);
    assert_eq!(result["hits"][0]["document"]["id"], "paris");

    let result = search(
        &mgr,
        "places",
        &[("q", "*"), ("sort_by", "loc(51.50, -0.12):asc")],
    );
    assert_eq!(result["hits"][0]["document"]["id"], "london");
}

#[test]
fn stopwords_are_removed_from_queries() {
    let (_dir, mgr) = manager();
    mgr.create_collection(&json!({
        "name": "c",
        "fields": [{"name": "title", "type": "string"}]
    }))
    .unwrap();
    mgr.add_document(
        "c",
        json!({"id": "0", "title": "quick brown fox"}),
        WriteOperation::Create,
    )
    .unwrap();
    mgr.upsert_stopwords("common", &["the".to_string(), "a".to_string()])
        .unwrap();

    let result = search(
        &mgr,
        "c",
        &[("q", "the quick fox"), ("query_by", "title"), ("stopwords", "common")],
    );
    assert_eq!(result["found"], 1);
}
