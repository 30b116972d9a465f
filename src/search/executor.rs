use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use serde_json::{json, Map, Value};

use super::highlight::{
    merge_highlight, nested_highlight, v1_entry, HighlightOptions, ValueHighlight,
};
use super::params::{DropTokensMode, FacetStrategy, SearchParams, TextMatchType};
use super::scoring::{pack_score, proximity_score, TextMatchScore};
use crate::collection::{field_strings, strip_sidecars, Collection};
use crate::error::{EngineError, EngineResult};
use crate::filter::{
    eval_filter, filter_matches, parse_filter, FilterLeaf, FilterNode, Predicate,
};
use crate::index::levenshtein_bounded;
use crate::schema::{FieldType, InfixMode, REFERENCE_HELPER_SUFFIX};

/// Cross-collection access the executor needs for `$ref(...)` filters and
/// reference sorts. Implemented by the collection manager.
pub trait ReferenceTarget {
    /// Run a filter on the referenced collection, returning its seq ids.
    fn filter_foreign_seq_ids(&self, collection: &str, filter_expr: &str)
        -> EngineResult<BTreeSet<u32>>;
    /// Numeric sort value of a foreign document.
    fn foreign_sort_value(&self, collection: &str, field: &str, seq_id: u32) -> Option<f64>;
    /// The foreign document, sidecars stripped, for reference includes.
    fn foreign_document(&self, collection: &str, seq_id: u32) -> Option<Value>;
}

const MAX_SORT_CLAUSES: usize = 3;
const MAX_PER_PAGE: usize = 250;

#[derive(Debug, Clone)]
enum SortClause {
    TextMatch { desc: bool },
    SeqId { desc: bool },
    GroupFound { desc: bool },
    VectorDistance { desc: bool },
    NumericField { field: String, desc: bool },
    StringField { field: String, desc: bool },
    Eval { branches: Vec<(FilterNode, i64)>, desc: bool },
    GeoDistance {
        field: String,
        lat: f64,
        lng: f64,
        exclude_radius_m: f64,
        precision_m: f64,
        desc: bool,
    },
    Reference { collection: String, field: String, desc: bool },
    VectorQueryDistance { field: String, values: Vec<f32>, desc: bool },
}

#[derive(Debug, Clone, PartialEq)]
enum ClauseKey {
    UInt(u64),
    Num(f64),
    Str(String),
    Missing,
}

/// Match bookkeeping for one document across the query fields.
#[derive(Debug, Clone, Default)]
struct DocMatch {
    score: TextMatchScore,
    typo_edits: u32,
    fields_matched: u8,
    matched_tokens: HashMap<String, HashSet<String>>,
    vector_distance: Option<f32>,
}

/// Per-field retrieval result for one document.
#[derive(Debug, Clone, Default)]
struct FieldMatch {
    tokens_matched: u32,
    typo_edits: u32,
    exact: bool,
    span: u32,
    dict_tokens: HashSet<String>,
}

enum FilterHolder {
    None,
    Eager(BTreeSet<u32>),
    Lazy(FilterNode),
}

impl FilterHolder {
    fn allows(&self, coll: &Collection, seq_id: u32) -> EngineResult<bool> {
        match self {
            FilterHolder::None => Ok(true),
            FilterHolder::Eager(ids) => Ok(ids.contains(&seq_id)),
            FilterHolder::Lazy(node) => filter_matches(node, coll, seq_id),
        }
    }

    fn materialize(&self, coll: &Collection) -> EngineResult<BTreeSet<u32>> {
        match self {
            FilterHolder::None => Ok(coll.indexes.seq_ids.clone()),
            FilterHolder::Eager(ids) => Ok(ids.clone()),
            FilterHolder::Lazy(node) => eval_filter(node, coll),
        }
    }
}

/// Execute a search against one collection. `refs` supplies cross-collection
/// access for reference filters/sorts; `stopword_set` is the resolved set
/// named by the `stopwords` parameter.
pub fn execute(
    coll: &Collection,
    refs: Option<&dyn ReferenceTarget>,
    params: &SearchParams,
    stopword_set: Option<&HashSet<String>>,
    start_ts: Instant,
) -> EngineResult<Value> {
    if params.per_page > MAX_PER_PAGE {
        return Err(EngineError::ClientError(format!(
            "Only up to {} hits can be fetched per page.",
            MAX_PER_PAGE
        )));
    }

    // ---- Step 1: overrides may rewrite query, filter, sort and curation.
    let mut effective_q = params.q.clone();
    let mut filter_parts: Vec<String> = Vec::new();
    if !params.filter_by.is_empty() {
        filter_parts.push(params.filter_by.clone());
    }
    let mut sort_spec = params.sort_by.clone();
    let mut pinned: Vec<(String, usize)> = params.pinned_hits.clone();
    let mut hidden: Vec<String> = params.hidden_hits.clone();
    let mut curate_filter = match params.filter_curated_hits {
        0 => false,
        1 => true,
        _ => false,
    };

    if params.enable_overrides {
        for ov in &coll.overrides {
            if !ov.matches(&params.q, &params.override_tags) {
                continue;
            }
            if let Some(replace) = &ov.replace_query {
                effective_q = replace.clone();
            }
            if let Some(extra) = &ov.filter_by {
                filter_parts.push(extra.clone());
            }
            if let Some(sort) = &ov.sort_by {
                sort_spec = sort.clone();
            }
            pinned.extend(ov.includes.iter().cloned());
            hidden.extend(ov.excludes.iter().cloned());
            if params.filter_curated_hits == 2 {
                curate_filter = ov.filter_curated_hits;
            }
            if ov.stop_processing {
                break;
            }
        }
    }

    // ---- Step 2: compile the filter, resolving reference leaves.
    let combined_filter = filter_parts.join(" && ");
    let has_reference_filter;
    let filter = if combined_filter.is_empty() {
        has_reference_filter = false;
        FilterHolder::None
    } else {
        let mut node = parse_filter(&combined_filter, &coll.schema)?;
        has_reference_filter = !node.referenced_collections().is_empty();
        if has_reference_filter {
            node = resolve_reference_leaves(node, coll, refs)?;
        }
        if params.enable_lazy_filter {
            FilterHolder::Lazy(node)
        } else {
            let ids = eval_filter_bounded(&node, coll, params.max_filter_by_candidates)?;
            FilterHolder::Eager(ids)
        }
    };

    let cutoff = |flag: &mut bool| {
        if start_ts.elapsed().as_millis() as u64 > params.search_cutoff_ms {
            *flag = true;
        }
    };
    let mut out_of_bounds = false;
    cutoff(&mut out_of_bounds);

    // ---- Step 3: sort clauses. A pure vector query with no explicit sort
    // orders by distance.
    let mut sort_clauses = parse_sort_by(&sort_spec, coll)?;
    if effective_q == "*" && params.vector_query.is_some() && sort_spec.trim().is_empty() {
        sort_clauses = vec![SortClause::VectorDistance { desc: false }];
    }

    // ---- Step 4: pagination bounds.
    let offset = params.start_offset();
    let per_page = params.per_page;
    if offset.saturating_add(per_page) > params.limit_hits {
        return Err(EngineError::ClientError(format!(
            "Only upto {} hits can be fetched. Ensure that `page` and `per_page` parameters are within this range.",
            params.limit_hits
        )));
    }

    // ---- Step 5/6/7: retrieval and scoring.
    let is_wildcard = effective_q == "*";
    let query_fields = resolve_query_fields(coll, params, is_wildcard)?;

    let mut matches: HashMap<u32, DocMatch> = HashMap::new();
    if is_wildcard {
        for seq_id in filter.materialize(coll)? {
            matches.insert(seq_id, DocMatch::default());
        }
    } else if !out_of_bounds {
        let mut tokens = coll.analyzer.query_tokens(&effective_q);
        if let Some(stop) = stopword_set {
            tokens.retain(|t| !stop.contains(t));
        }
        if tokens.is_empty() {
            // Everything was a stopword: degrade to a wildcard match.
            for seq_id in filter.materialize(coll)? {
                matches.insert(seq_id, DocMatch::default());
            }
        } else {
            let mut token_lists: Vec<Vec<String>> = vec![tokens.clone()];
            if params.enable_synonyms {
                token_lists.extend(synonym_token_lists(coll, &tokens, &effective_q));
            }
            for token_list in &token_lists {
                retrieve_and_merge(coll, params, &query_fields, token_list, &filter, &mut matches)?;
            }

            // Token-drop relaxation.
            let mut current = tokens.clone();
            while matches.len() < params.drop_tokens_threshold && current.len() > 1 {
                match params.drop_tokens_mode {
                    DropTokensMode::RightToLeft => {
                        current.pop();
                    }
                    DropTokensMode::LeftToRight => {
                        current.remove(0);
                    }
                    DropTokensMode::BothSides => {
                        if current.len() % 2 == 0 {
                            current.pop();
                        } else {
                            current.remove(0);
                        }
                    }
                }
                retrieve_and_merge(coll, params, &query_fields, &current, &filter, &mut matches)?;
            }
        }
    }
    cutoff(&mut out_of_bounds);

    // ---- Vector and hybrid.
    let mut vector_field_used: Option<String> = None;
    if let Some(vq) = &params.vector_query {
        let field_name = if vq.field.is_empty() {
            coll.indexes.vector.keys().next().cloned().ok_or_else(|| {
                EngineError::ClientError("No vector field exists in this collection.".into())
            })?
        } else {
            vq.field.clone()
        };
        let hnsw = coll.indexes.vector.get(&field_name).ok_or_else(|| {
            EngineError::NotFound(format!(
                "Could not find a vector field named `{}` in the schema.",
                field_name
            ))
        })?;
        if vq.values.len() != hnsw.num_dim {
            return Err(EngineError::ClientError(format!(
                "Query vector must have {} dimensions.",
                hnsw.num_dim
            )));
        }
        vector_field_used = Some(field_name.clone());

        let k = vq.k.max(offset + per_page);
        let knn = hnsw.search(&vq.values, k, k.max(16) * 4);

        if is_wildcard {
            matches.clear();
            for (seq_id, dist) in knn {
                if filter.allows(coll, seq_id)? {
                    let mut dm = DocMatch::default();
                    dm.vector_distance = Some(dist);
                    matches.insert(seq_id, dm);
                }
            }
        } else {
            // Hybrid: fuse the text ranking with the vector ranking through
            // reciprocal ranks.
            let mut text_ranked: Vec<(u32, u64)> =
                matches.iter().map(|(id, m)| (*id, m.score.0)).collect();
            text_ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let text_rank: HashMap<u32, usize> = text_ranked
                .iter()
                .enumerate()
                .map(|(rank, (id, _))| (*id, rank))
                .collect();

            for (rank, (seq_id, dist)) in knn.iter().enumerate() {
                if !filter.allows(coll, *seq_id)? {
                    continue;
                }
                let entry = matches.entry(*seq_id).or_default();
                entry.vector_distance = Some(*dist);
                // Vector-only hits fold in with rank-fusion below through the
                // absent text rank.
                let _ = rank;
            }

            if params.rerank_hybrid_matches {
                // Give every fused hit a vector distance for reranking.
                for (seq_id, dm) in matches.iter_mut() {
                    if dm.vector_distance.is_none() {
                        dm.vector_distance = hnsw.distance_to(*seq_id, &vq.values);
                    }
                }
            }

            let vec_rank: HashMap<u32, usize> = knn
                .iter()
                .enumerate()
                .map(|(rank, (id, _))| (*id, rank))
                .collect();
            // Store the fused ordering inside the packed score so the default
            // `_text_match` sort reflects the fusion.
            const RRF_K: f64 = 60.0;
            let mut fused: Vec<(u32, f64)> = matches
                .keys()
                .map(|id| {
                    let tr = text_rank.get(id).map(|r| 1.0 / (RRF_K + *r as f64)).unwrap_or(0.0);
                    let vr = vec_rank.get(id).map(|r| 1.0 / (RRF_K + *r as f64)).unwrap_or(0.0);
                    (*id, tr + vr)
                })
                .collect();
            fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (rank, (id, _)) in fused.iter().enumerate() {
                if let Some(dm) = matches.get_mut(id) {
                    dm.score = TextMatchScore(u64::MAX - rank as u64);
                }
            }
        }
    }

    // ---- Curation: hidden hits drop out, pinned hits force their way in.
    let hidden_seqs: HashSet<u32> = hidden
        .iter()
        .filter_map(|id| coll.seq_id_for(id).ok().flatten())
        .collect();
    for seq_id in &hidden_seqs {
        matches.remove(seq_id);
    }

    let mut pinned_rows: Vec<(usize, u32)> = Vec::new();
    for (id, position) in &pinned {
        let Some(seq_id) = coll.seq_id_for(id)? else {
            continue;
        };
        if hidden_seqs.contains(&seq_id) {
            continue;
        }
        if curate_filter && !filter.allows(coll, seq_id)? {
            continue;
        }
        matches.remove(&seq_id);
        pinned_rows.push((*position, seq_id));
    }
    pinned_rows.sort();

    // ---- Step 11: composite sort.
    let mut doc_ids: Vec<u32> = matches.keys().copied().collect();
    let sort_keys: HashMap<u32, Vec<ClauseKey>> = doc_ids
        .iter()
        .map(|id| {
            (
                *id,
                sort_clauses
                    .iter()
                    .map(|clause| clause_key(clause, coll, refs, &matches, *id))
                    .collect(),
            )
        })
        .collect();
    doc_ids.sort_by(|a, b| {
        for (i, clause) in sort_clauses.iter().enumerate() {
            let ka = &sort_keys[a][i];
            let kb = &sort_keys[b][i];
            let ord = compare_keys(ka, kb, clause_desc(clause));
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        b.cmp(a)
    });

    // ---- Step 8: grouping.
    let grouping = !params.group_by.is_empty();
    let mut grouped: Vec<(Vec<Value>, Vec<u32>, usize)> = Vec::new();
    if grouping {
        for field_name in &params.group_by {
            if coll.schema.resolve(field_name).is_none() && params.validate_field_names {
                return Err(EngineError::NotFound(format!(
                    "Could not find a field named `{}` in the schema.",
                    field_name
                )));
            }
        }
        let mut buckets: HashMap<String, usize> = HashMap::new();
        for seq_id in &doc_ids {
            let (key, missing) = group_key_for(coll, &params.group_by, *seq_id);
            if missing && !params.group_missing_values {
                // Each document missing a group key forms its own group.
                grouped.push((key, vec![*seq_id], 1));
                continue;
            }
            let key_str = serde_json::to_string(&key).unwrap_or_default();
            let idx = *buckets.entry(key_str).or_insert_with(|| {
                grouped.push((key, Vec::new(), 0));
                grouped.len() - 1
            });
            grouped[idx].2 += 1;
            if grouped[idx].1.len() < params.group_limit {
                grouped[idx].1.push(*seq_id);
            }
        }
    }

    // ---- Step 10: facets (on the pre-pagination result set).
    let mut facet_counts = Vec::new();
    if !params.facet_by.is_empty() && !out_of_bounds {
        let result_set: BTreeSet<u32> = matches.keys().copied().collect();
        facet_counts = build_facets(coll, params, &result_set)?;
    }
    cutoff(&mut out_of_bounds);

    // ---- Pagination & hit assembly.
    let found = if grouping {
        grouped.len()
    } else {
        doc_ids.len() + pinned_rows.len()
    };

    let highlight_opts = HighlightOptions {
        start_tag: params.highlight_start_tag.clone(),
        end_tag: params.highlight_end_tag.clone(),
        snippet_threshold: params.snippet_threshold,
        affix_tokens: params.highlight_affix_num_tokens,
        full_value: false,
    };

    let build_hit = |seq_id: u32| -> EngineResult<Value> {
        make_hit(
            coll,
            refs,
            params,
            &matches,
            &query_fields,
            &highlight_opts,
            has_reference_filter,
            seq_id,
        )
    };

    let result_value = if grouping {
        let mut grouped_hits = Vec::new();
        let page_groups = grouped
            .iter()
            .skip(offset)
            .take(per_page.min(params.limit_hits.saturating_sub(offset)));
        for (key, seq_ids, group_found) in page_groups {
            let mut hits = Vec::new();
            for seq_id in seq_ids {
                hits.push(build_hit(*seq_id)?);
            }
            grouped_hits.push(json!({
                "group_key": key,
                "found": group_found,
                "hits": hits,
            }));
        }
        json!({ "grouped_hits": grouped_hits })
    } else {
        // Weave pinned hits into their 1-based positions.
        let mut final_ids: Vec<u32> = doc_ids;
        for (position, seq_id) in &pinned_rows {
            let at = (position - 1).min(final_ids.len());
            final_ids.insert(at, *seq_id);
        }
        let window = final_ids
            .iter()
            .skip(offset)
            .take(per_page.min(params.limit_hits.saturating_sub(offset)));
        let mut hits = Vec::new();
        for seq_id in window {
            hits.push(build_hit(*seq_id)?);
        }
        json!({ "hits": hits })
    };

    let mut result = json!({
        "found": found,
        "out_of": coll.indexes.num_documents(),
        "search_time_ms": start_ts.elapsed().as_millis() as u64,
        "facet_counts": facet_counts,
        "request_params": {
            "collection_name": coll.name(),
            "q": params.q,
            "per_page": per_page,
        },
    });
    let obj = result.as_object_mut().expect("literal object");
    if params.page > 0 {
        obj.insert("page".into(), json!(params.page));
    } else {
        obj.insert("offset".into(), json!(offset));
    }
    if out_of_bounds {
        obj.insert("out_of_bounds".into(), json!(true));
    }
    if let Some(field) = vector_field_used {
        obj.insert("vector_field".into(), json!(field));
    }
    for (key, value) in result_value.as_object().expect("literal object") {
        obj.insert(key.clone(), value.clone());
    }
    Ok(result)
}

// ==================== Retrieval ====================

/// The `query_by` fields validated against the schema. For wildcard queries
/// an empty list is fine.
fn resolve_query_fields(
    coll: &Collection,
    params: &SearchParams,
    is_wildcard: bool,
) -> EngineResult<Vec<String>> {
    if params.query_by.is_empty() {
        if !is_wildcard {
            return Err(EngineError::ClientError(
                "Parameter `query_by` is required for text queries.".into(),
            ));
        }
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for name in &params.query_by {
        match coll.schema.resolve(name) {
            Some(field) => {
                if field.field_type != FieldType::String
                    && field.field_type != FieldType::Auto
                    && !field.is_vector()
                {
                    return Err(EngineError::ClientError(format!(
                        "Field `{}` should be a string or a string array.",
                        name
                    )));
                }
                if !field.is_vector() {
                    out.push(name.clone());
                }
            }
            None if params.validate_field_names => {
                return Err(EngineError::NotFound(format!(
                    "Could not find a field named `{}` in the schema.",
                    name
                )))
            }
            None => {}
        }
    }
    Ok(out)
}

/// One retrieval pass over every query field: exact first, typo-relaxed when
/// the exact pass produces fewer than `typo_tokens_threshold` hits.
fn retrieve_and_merge(
    coll: &Collection,
    params: &SearchParams,
    query_fields: &[String],
    tokens: &[String],
    filter: &FilterHolder,
    matches: &mut HashMap<u32, DocMatch>,
) -> EngineResult<()> {
    let mut pass_matches: HashMap<u32, DocMatch> = HashMap::new();
    run_pass(coll, params, query_fields, tokens, false, &mut pass_matches)?;
    if pass_matches.len() < params.typo_tokens_threshold {
        run_pass(coll, params, query_fields, tokens, true, &mut pass_matches)?;
    }

    for (seq_id, dm) in pass_matches {
        if !filter.allows(coll, seq_id)? {
            continue;
        }
        match matches.entry(seq_id) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(dm);
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if dm.score.0 > existing.score.0 {
                    existing.score = dm.score;
                    existing.typo_edits = dm.typo_edits;
                }
                for (field, tokens) in dm.matched_tokens {
                    existing.matched_tokens.entry(field).or_default().extend(tokens);
                }
            }
        }
    }
    Ok(())
}

fn run_pass(
    coll: &Collection,
    params: &SearchParams,
    query_fields: &[String],
    tokens: &[String],
    allow_typos: bool,
    out: &mut HashMap<u32, DocMatch>,
) -> EngineResult<()> {
    let mut per_field: Vec<(usize, HashMap<u32, FieldMatch>)> = Vec::new();
    for (field_idx, field_name) in query_fields.iter().enumerate() {
        let field_matches =
            field_retrieval(coll, params, field_idx, field_name, tokens, allow_typos)?;
        per_field.push((field_idx, field_matches));
    }

    // Merge across fields per text_match_type.
    let mut merged: HashMap<u32, DocMatch> = HashMap::new();
    for (field_idx, field_matches) in &per_field {
        let field_name = &query_fields[*field_idx];
        let weight = params.weight_for(*field_idx).min(255) as u8;
        for (seq_id, fm) in field_matches {
            let proximity = proximity_score(fm.span, fm.tokens_matched);
            let entry = merged.entry(*seq_id).or_default();
            entry.fields_matched = entry.fields_matched.saturating_add(1);
            let score = pack_score(
                weight,
                fm.tokens_matched.min(255) as u8,
                fm.exact,
                proximity,
                entry.fields_matched,
                params.prioritize_exact_match,
                params.prioritize_token_position,
                params.prioritize_num_matching_fields,
            );
            match params.text_match_type {
                TextMatchType::MaxScore | TextMatchType::MaxWeightedScore => {
                    if score.0 > entry.score.0 {
                        entry.score = score;
                        entry.typo_edits = fm.typo_edits;
                    } else {
                        // The field count still grew; refresh its bits.
                        entry.score = TextMatchScore(entry.score.0.max(score.0));
                    }
                }
                TextMatchType::SumScore => {
                    entry.score = TextMatchScore(entry.score.0.saturating_add(score.0));
                    entry.typo_edits += fm.typo_edits;
                }
            }
            entry
                .matched_tokens
                .entry(field_name.clone())
                .or_default()
                .extend(fm.dict_tokens.iter().cloned());
        }
    }

    for (seq_id, dm) in merged {
        out.entry(seq_id).or_insert(dm);
    }
    Ok(())
}

/// Intersect the candidate postings of every query token within one field.
fn field_retrieval(
    coll: &Collection,
    params: &SearchParams,
    field_idx: usize,
    field_name: &str,
    tokens: &[String],
    allow_typos: bool,
) -> EngineResult<HashMap<u32, FieldMatch>> {
    let Some(inverted) = coll.indexes.inverted.get(field_name) else {
        return Ok(HashMap::new());
    };

    let num_typos = if allow_typos {
        params.num_typos_for(field_idx)
    } else {
        0
    };
    let prefix_enabled = params.prefix_for(field_idx);
    let infix_mode = params.infix_for(field_idx);

    // token index -> seq id -> (min edit distance, first position, dict tokens)
    let mut token_docs: Vec<HashMap<u32, (usize, u32, HashSet<String>)>> = Vec::new();
    for (token_idx, token) in tokens.iter().enumerate() {
        let is_last = token_idx == tokens.len() - 1;
        let mut candidates = inverted.candidates(
            token,
            num_typos,
            prefix_enabled && is_last,
            params.max_candidates,
            params.min_len_1typo,
            params.min_len_2typo,
            params.enable_typos_for_numerical_tokens,
            params.enable_typos_for_alpha_numerical_tokens,
        );

        let add_infix = match infix_mode {
            InfixMode::Always => true,
            InfixMode::Fallback => candidates.is_empty(),
            InfixMode::Off => false,
        };
        if add_infix {
            for infix_token in inverted.infix_candidates(
                token,
                params.max_extra_prefix,
                params.max_extra_suffix,
                params.max_candidates,
            ) {
                candidates.push(crate::index::TokenCandidate {
                    token: infix_token,
                    distance: 0,
                    prefix: true,
                });
            }
        }

        let mut docs: HashMap<u32, (usize, u32, HashSet<String>)> = HashMap::new();
        for candidate in candidates {
            let Some(postings) = inverted.postings(&candidate.token) else {
                continue;
            };
            let edit_cost = candidate.distance + usize::from(candidate.prefix);
            for (seq_id, positions) in postings {
                let first = positions.first().copied().unwrap_or(0);
                let entry = docs
                    .entry(*seq_id)
                    .or_insert_with(|| (usize::MAX, first, HashSet::new()));
                if edit_cost < entry.0 {
                    entry.0 = edit_cost;
                    entry.1 = first;
                }
                entry.2.insert(candidate.token.clone());
            }
        }
        token_docs.push(docs);
    }

    // A document must match every token.
    let mut out: HashMap<u32, FieldMatch> = HashMap::new();
    let Some(first) = token_docs.first() else {
        return Ok(out);
    };
    'docs: for seq_id in first.keys() {
        let mut fm = FieldMatch {
            tokens_matched: tokens.len() as u32,
            ..FieldMatch::default()
        };
        let mut min_pos = u32::MAX;
        let mut max_pos = 0;
        let mut all_exact = true;
        for docs in &token_docs {
            let Some((distance, position, dict_tokens)) = docs.get(seq_id) else {
                continue 'docs;
            };
            fm.typo_edits += *distance as u32;
            if *distance > 0 {
                all_exact = false;
            }
            min_pos = min_pos.min(*position);
            max_pos = max_pos.max(*position);
            fm.dict_tokens.extend(dict_tokens.iter().cloned());
        }
        fm.exact = all_exact;
        fm.span = max_pos.saturating_sub(min_pos);
        out.insert(*seq_id, fm);
    }
    Ok(out)
}

/// Phrase-level synonym expansions as alternate token lists.
fn synonym_token_lists(coll: &Collection, tokens: &[String], raw_query: &str) -> Vec<Vec<String>> {
    let mut lists = Vec::new();
    let phrase = raw_query.to_lowercase();
    for synonym in &coll.synonyms {
        for expansion in synonym.expansions_for(phrase.trim()) {
            let alt: Vec<String> = expansion.split_whitespace().map(String::from).collect();
            if !alt.is_empty() {
                lists.push(alt);
            }
        }
        // Single-token expansions splice into the original token list.
        for (i, token) in tokens.iter().enumerate() {
            for expansion in synonym.expansions_for(token) {
                if expansion.split_whitespace().count() == 1 {
                    let mut alt = tokens.to_vec();
                    alt[i] = expansion;
                    lists.push(alt);
                }
            }
        }
    }
    lists
}

// ==================== Reference Filters ====================

/// Replace `$coll(...)` leaves with helper-field predicates resolved through
/// the referenced collection.
fn resolve_reference_leaves(
    node: FilterNode,
    coll: &Collection,
    refs: Option<&dyn ReferenceTarget>,
) -> EngineResult<FilterNode> {
    match node {
        FilterNode::Operator { op, left, right } => Ok(FilterNode::Operator {
            op,
            left: Box::new(resolve_reference_leaves(*left, coll, refs)?),
            right: Box::new(resolve_reference_leaves(*right, coll, refs)?),
        }),
        FilterNode::Leaf(leaf) => {
            let Some((collection, inner)) = &leaf.reference else {
                return Ok(FilterNode::Leaf(leaf));
            };
            let refs = refs.ok_or_else(|| {
                EngineError::ClientError(
                    "Reference filters are not available in this context.".into(),
                )
            })?;
            let local_field = coll
                .schema
                .reference_fields()
                .find(|f| {
                    f.reference
                        .as_deref()
                        .is_some_and(|r| r.split_once('.').map(|(c, _)| c) == Some(collection))
                })
                .ok_or_else(|| {
                    EngineError::ClientError(format!(
                        "Collection `{}` does not reference `{}`.",
                        coll.name(),
                        collection
                    ))
                })?;
            let foreign_ids = refs.filter_foreign_seq_ids(collection, inner)?;
            Ok(FilterNode::Leaf(FilterLeaf {
                field: format!("{}{}", local_field.name, REFERENCE_HELPER_SUFFIX),
                predicates: foreign_ids
                    .into_iter()
                    .map(|seq| Predicate::NumEquals(seq as f64))
                    .collect(),
                reference: None,
            }))
        }
    }
}

fn eval_filter_bounded(
    node: &FilterNode,
    coll: &Collection,
    candidate_cap: usize,
) -> EngineResult<BTreeSet<u32>> {
    struct Bounded<'a> {
        coll: &'a Collection,
        cap: usize,
    }
    impl crate::filter::FilterContext for Bounded<'_> {
        fn all_ids(&self) -> BTreeSet<u32> {
            self.coll.indexes.seq_ids.clone()
        }
        fn eval_leaf(&self, leaf: &FilterLeaf) -> EngineResult<BTreeSet<u32>> {
            self.coll.eval_leaf_bounded(leaf, self.cap)
        }
        fn leaf_matches(&self, leaf: &FilterLeaf, seq_id: u32) -> EngineResult<bool> {
            Ok(self.eval_leaf(leaf)?.contains(&seq_id))
        }
    }
    eval_filter(node, &Bounded { coll, cap: candidate_cap })
}

// ==================== Sorting ====================

fn parse_sort_by(raw: &str, coll: &Collection) -> EngineResult<Vec<SortClause>> {
    let mut clauses = Vec::new();
    if raw.trim().is_empty() {
        clauses.push(SortClause::TextMatch { desc: true });
        let default_field = &coll.schema.default_sorting_field;
        if !default_field.is_empty() {
            clauses.push(SortClause::NumericField {
                field: default_field.clone(),
                desc: true,
            });
        }
        return Ok(clauses);
    }

    for spec in split_top_level(raw) {
        let spec = spec.trim();
        let (body, dir) = match spec.rsplit_once(':') {
            Some((body, "asc")) => (body.trim(), false),
            Some((body, "desc")) => (body.trim(), true),
            _ => {
                return Err(EngineError::ClientError(format!(
                    "Could not parse the sort field `{}`: expected `:asc` or `:desc`.",
                    spec
                )))
            }
        };

        let clause = if body == "_text_match" || body.starts_with("_text_match(") {
            SortClause::TextMatch { desc: dir }
        } else if body == "_seq_id" {
            SortClause::SeqId { desc: dir }
        } else if body == "_group_found" {
            SortClause::GroupFound { desc: dir }
        } else if body == "_vector_distance" {
            SortClause::VectorDistance { desc: dir }
        } else if let Some(inner) = body.strip_prefix("_eval(").and_then(|s| s.strip_suffix(')')) {
            SortClause::Eval {
                branches: parse_eval_branches(inner, coll)?,
                desc: dir,
            }
        } else if let Some(inner) = body.strip_prefix("_vector_query(").and_then(|s| s.strip_suffix(')')) {
            let vq = super::params::SearchParams::from_map(
                &[("q".to_string(), "*".to_string()), ("vector_query".to_string(), inner.to_string())]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            )?
            .vector_query
            .ok_or_else(|| EngineError::ClientError("Invalid `_vector_query` sort.".into()))?;
            SortClause::VectorQueryDistance {
                field: vq.field,
                values: vq.values,
                desc: dir,
            }
        } else if let Some(rest) = body.strip_prefix('$') {
            let (collection, inner) = rest
                .split_once('(')
                .and_then(|(c, i)| i.strip_suffix(')').map(|i| (c, i)))
                .ok_or_else(|| {
                    EngineError::ClientError(format!("Could not parse the sort field `{}`.", spec))
                })?;
            let (field, inner_dir) = inner.rsplit_once(':').ok_or_else(|| {
                EngineError::ClientError(format!("Could not parse the sort field `{}`.", spec))
            })?;
            SortClause::Reference {
                collection: collection.to_string(),
                field: field.trim().to_string(),
                desc: inner_dir.trim() == "desc",
            }
        } else if let Some((field_name, args)) = body
            .split_once('(')
            .and_then(|(f, a)| a.strip_suffix(')').map(|a| (f.trim(), a)))
        {
            // Geopoint proximity: `loc(48.85, 2.35)` with optional
            // `exclude_radius` / `precision` arguments.
            let field = coll.schema.resolve(field_name).ok_or_else(|| {
                EngineError::NotFound(format!(
                    "Could not find a field named `{}` in the schema for sorting.",
                    field_name
                ))
            })?;
            if field.field_type != FieldType::Geopoint {
                return Err(EngineError::ClientError(format!(
                    "Sort argument form is only valid on geopoint fields, `{}` is not one.",
                    field_name
                )));
            }
            let mut lat = None;
            let mut lng = None;
            let mut exclude_radius_m = 0.0;
            let mut precision_m = 0.0;
            for part in args.split(',').map(str::trim) {
                if let Some(v) = part.strip_prefix("exclude_radius:") {
                    exclude_radius_m = parse_distance(v.trim())?;
                } else if let Some(v) = part.strip_prefix("precision:") {
                    precision_m = parse_distance(v.trim())?;
                } else if lat.is_none() {
                    lat = part.parse::<f64>().ok();
                } else if lng.is_none() {
                    lng = part.parse::<f64>().ok();
                }
            }
            let (Some(lat), Some(lng)) = (lat, lng) else {
                return Err(EngineError::ClientError(format!(
                    "Could not parse the geo anchor in sort field `{}`.",
                    spec
                )));
            };
            SortClause::GeoDistance {
                field: field_name.to_string(),
                lat,
                lng,
                exclude_radius_m,
                precision_m,
                desc: dir,
            }
        } else {
            let field = coll.schema.resolve(body).ok_or_else(|| {
                EngineError::NotFound(format!(
                    "Could not find a field named `{}` in the schema for sorting.",
                    body
                ))
            })?;
            if !field.sortable() {
                return Err(EngineError::ClientError(format!(
                    "Field `{}` is not a sortable field; declare it with `sort: true`.",
                    body
                )));
            }
            if field.field_type.is_numeric() || field.field_type == FieldType::Bool {
                SortClause::NumericField {
                    field: body.to_string(),
                    desc: dir,
                }
            } else {
                SortClause::StringField {
                    field: body.to_string(),
                    desc: dir,
                }
            }
        };
        clauses.push(clause);
    }

    if clauses.len() > MAX_SORT_CLAUSES {
        return Err(EngineError::ClientError(format!(
            "Only upto {} sort fields are allowed.",
            MAX_SORT_CLAUSES
        )));
    }
    Ok(clauses)
}

/// `_eval` branch list: either one filter expression (score 1) or
/// `[(expr):score, (expr):score, ...]`.
fn parse_eval_branches(inner: &str, coll: &Collection) -> EngineResult<Vec<(FilterNode, i64)>> {
    let inner = inner.trim();
    let mut branches = Vec::new();
    if inner.starts_with('[') && inner.ends_with(']') {
        for part in split_top_level(&inner[1..inner.len() - 1]) {
            let part = part.trim();
            let (expr, score) = part
                .rsplit_once("):")
                .map(|(e, s)| (format!("{})", e), s.trim().to_string()))
                .ok_or_else(|| {
                    EngineError::ClientError("Could not parse the `_eval` expression.".into())
                })?;
            let expr = expr
                .strip_prefix('(')
                .and_then(|e| e.strip_suffix(')'))
                .unwrap_or(&expr);
            let score = score.parse::<i64>().map_err(|_| {
                EngineError::ClientError("Could not parse the `_eval` score.".into())
            })?;
            branches.push((parse_filter(expr, &coll.schema)?, score));
        }
    } else {
        branches.push((parse_filter(inner, &coll.schema)?, 1));
    }
    Ok(branches)
}

fn parse_distance(raw: &str) -> EngineResult<f64> {
    let raw = raw.trim();
    if let Some(v) = raw.strip_suffix("km") {
        return v
            .trim()
            .parse::<f64>()
            .map(|v| v * 1000.0)
            .map_err(|_| EngineError::ClientError(format!("Invalid distance `{}`.", raw)));
    }
    if let Some(v) = raw.strip_suffix("mi") {
        return v
            .trim()
            .parse::<f64>()
            .map(|v| v * 1609.34)
            .map_err(|_| EngineError::ClientError(format!("Invalid distance `{}`.", raw)));
    }
    if let Some(v) = raw.strip_suffix('m') {
        return v
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::ClientError(format!("Invalid distance `{}`.", raw)));
    }
    raw.parse::<f64>()
        .map_err(|_| EngineError::ClientError(format!("Invalid distance `{}`.", raw)))
}

fn clause_desc(clause: &SortClause) -> bool {
    match clause {
        SortClause::TextMatch { desc }
        | SortClause::SeqId { desc }
        | SortClause::GroupFound { desc }
        | SortClause::VectorDistance { desc }
        | SortClause::NumericField { desc, .. }
        | SortClause::StringField { desc, .. }
        | SortClause::Eval { desc, .. }
        | SortClause::GeoDistance { desc, .. }
        | SortClause::Reference { desc, .. }
        | SortClause::VectorQueryDistance { desc, .. } => *desc,
    }
}

fn clause_key(
    clause: &SortClause,
    coll: &Collection,
    refs: Option<&dyn ReferenceTarget>,
    matches: &HashMap<u32, DocMatch>,
    seq_id: u32,
) -> ClauseKey {
    match clause {
        SortClause::TextMatch { .. } => ClauseKey::UInt(
            matches.get(&seq_id).map(|m| m.score.0).unwrap_or(0),
        ),
        SortClause::SeqId { .. } => ClauseKey::UInt(seq_id as u64),
        SortClause::GroupFound { .. } => ClauseKey::UInt(0),
        SortClause::VectorDistance { .. } => matches
            .get(&seq_id)
            .and_then(|m| m.vector_distance)
            .map(|d| ClauseKey::Num(d as f64))
            .unwrap_or(ClauseKey::Missing),
        SortClause::NumericField { field, .. } => coll
            .indexes
            .numeric
            .get(field)
            .and_then(|tree| tree.sort_value(seq_id))
            .map(ClauseKey::Num)
            .unwrap_or(ClauseKey::Missing),
        SortClause::StringField { field, .. } => coll
            .indexes
            .string_sort
            .get(field)
            .and_then(|col| col.sort_value(seq_id))
            .map(|s| ClauseKey::Str(s.to_string()))
            .unwrap_or(ClauseKey::Missing),
        SortClause::Eval { branches, .. } => {
            let mut total = 0i64;
            for (node, score) in branches {
                if filter_matches(node, coll, seq_id).unwrap_or(false) {
                    total += score;
                }
            }
            ClauseKey::Num(total as f64)
        }
        SortClause::GeoDistance {
            field,
            lat,
            lng,
            exclude_radius_m,
            precision_m,
            ..
        } => {
            let Some(distance) = coll
                .indexes
                .geo
                .get(field)
                .and_then(|geo| geo.distance_to(seq_id, *lat, *lng))
            else {
                return ClauseKey::Missing;
            };
            let mut d = distance;
            if *exclude_radius_m > 0.0 && d <= *exclude_radius_m {
                d = 0.0;
            }
            if *precision_m > 0.0 {
                d = (d / precision_m).floor() * precision_m;
            }
            ClauseKey::Num(d)
        }
        SortClause::Reference { collection, field, .. } => {
            let Some(refs) = refs else {
                return ClauseKey::Missing;
            };
            let helper_seq = coll
                .load_doc(seq_id)
                .ok()
                .flatten()
                .and_then(|doc| {
                    doc.iter().find_map(|(key, value)| {
                        key.ends_with(REFERENCE_HELPER_SUFFIX)
                            .then(|| value.as_u64())
                            .flatten()
                    })
                });
            match helper_seq {
                Some(foreign) => refs
                    .foreign_sort_value(collection, field, foreign as u32)
                    .map(ClauseKey::Num)
                    .unwrap_or(ClauseKey::Missing),
                None => ClauseKey::Missing,
            }
        }
        SortClause::VectorQueryDistance { field, values, .. } => coll
            .indexes
            .vector
            .get(field)
            .and_then(|hnsw| hnsw.distance_to(seq_id, values))
            .map(|d| ClauseKey::Num(d as f64))
            .unwrap_or(ClauseKey::Missing),
    }
}

fn compare_keys(a: &ClauseKey, b: &ClauseKey, desc: bool) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let ord = match (a, b) {
        (ClauseKey::Missing, ClauseKey::Missing) => Ordering::Equal,
        // Missing values always sort last, regardless of direction.
        (ClauseKey::Missing, _) => return Ordering::Greater,
        (_, ClauseKey::Missing) => return Ordering::Less,
        (ClauseKey::UInt(x), ClauseKey::UInt(y)) => x.cmp(y),
        (ClauseKey::Num(x), ClauseKey::Num(y)) => x.total_cmp(y),
        (ClauseKey::Str(x), ClauseKey::Str(y)) => x.cmp(y),
        _ => Ordering::Equal,
    };
    if desc {
        ord.reverse()
    } else {
        ord
    }
}

// ==================== Grouping ====================

fn group_key_for(coll: &Collection, group_by: &[String], seq_id: u32) -> (Vec<Value>, bool) {
    let mut key = Vec::with_capacity(group_by.len());
    let mut missing = false;
    for field_name in group_by {
        let value = coll
            .indexes
            .facet
            .get(field_name)
            .and_then(|facet| facet.values_of(seq_id))
            .map(|values| {
                if values.len() == 1 {
                    Value::String(values[0].clone())
                } else {
                    Value::Array(values.iter().cloned().map(Value::String).collect())
                }
            })
            .or_else(|| {
                coll.indexes
                    .numeric
                    .get(field_name)
                    .and_then(|tree| tree.sort_value(seq_id))
                    .map(|v| json!(v))
            });
        match value {
            Some(v) => key.push(v),
            None => {
                missing = true;
                key.push(Value::Null);
            }
        }
    }
    (key, missing)
}

// ==================== Facets ====================

fn build_facets(
    coll: &Collection,
    params: &SearchParams,
    result_set: &BTreeSet<u32>,
) -> EngineResult<Vec<Value>> {
    // Sampling: when the result set is large enough, count a percentage.
    let sampled: BTreeSet<u32>;
    let counted_set = if params.facet_sample_percent < 100
        && params.facet_sample_threshold > 0
        && result_set.len() >= params.facet_sample_threshold
    {
        let keep_every = (100.0 / params.facet_sample_percent as f64).ceil() as usize;
        sampled = result_set
            .iter()
            .enumerate()
            .filter(|(i, _)| i % keep_every == 0)
            .map(|(_, id)| *id)
            .collect();
        &sampled
    } else {
        result_set
    };

    let facet_query = if params.facet_query.is_empty() {
        None
    } else {
        let (field, prefix) = params.facet_query.split_once(':').ok_or_else(|| {
            EngineError::ClientError(
                "Parameter `facet_query` must be of the form `field:value`.".into(),
            )
        })?;
        Some((field.trim().to_string(), prefix.trim().to_lowercase()))
    };

    let mut out = Vec::new();
    for spec in split_top_level(&params.facet_by) {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }

        // Range-bucket form: `field(label:[lo..hi], ...)`.
        if let Some((field_name, args)) = spec
            .split_once('(')
            .and_then(|(f, a)| a.strip_suffix(')').map(|a| (f.trim(), a)))
        {
            out.push(build_range_facet(coll, field_name, args, counted_set)?);
            continue;
        }

        let field = coll.schema.resolve(spec);
        if field.is_none() {
            if params.validate_field_names {
                return Err(EngineError::NotFound(format!(
                    "Could not find a facet field named `{}` in the schema.",
                    spec
                )));
            }
            continue;
        }
        let Some(facet_index) = coll.indexes.facet.get(spec) else {
            out.push(json!({"field_name": spec, "counts": [], "stats": {}}));
            continue;
        };

        // Strategy: the value index pays off when values are few and results
        // are many; iteration otherwise.
        let counts_map = match params.facet_strategy {
            FacetStrategy::Exhaustive => facet_index.count_by_value_index(counted_set),
            FacetStrategy::TopValues => facet_index.count_by_iteration(counted_set.iter()),
            FacetStrategy::Automatic => {
                if facet_index.num_values() < 250 && counted_set.len() > 1000 {
                    facet_index.count_by_value_index(counted_set)
                } else {
                    facet_index.count_by_iteration(counted_set.iter())
                }
            }
        };

        let mut counts: Vec<(String, u32)> = counts_map.into_iter().collect();
        if let Some((fq_field, fq_prefix)) = &facet_query {
            if fq_field == spec {
                counts.retain(|(value, _)| {
                    let lowered = value.to_lowercase();
                    lowered.starts_with(fq_prefix.as_str())
                        || lowered
                            .split_whitespace()
                            .any(|word| {
                                word.starts_with(fq_prefix.as_str())
                                    || levenshtein_bounded(
                                        word,
                                        fq_prefix,
                                        params.facet_query_num_typos,
                                    )
                                    .is_some()
                            })
                });
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts.truncate(params.max_facet_values);

        let stats = numeric_facet_stats(coll, spec, counted_set);
        out.push(json!({
            "field_name": spec,
            "counts": counts.iter().map(|(value, count)| json!({
                "value": value,
                "count": count,
                "highlighted": value,
            })).collect::<Vec<_>>(),
            "stats": stats,
            "sampled": counted_set.len() != result_set.len(),
        }));
    }
    Ok(out)
}

fn build_range_facet(
    coll: &Collection,
    field_name: &str,
    args: &str,
    counted_set: &BTreeSet<u32>,
) -> EngineResult<Value> {
    let tree = coll.indexes.numeric.get(field_name).ok_or_else(|| {
        EngineError::ClientError(format!(
            "Range facets need a numeric field; `{}` is not one.",
            field_name
        ))
    })?;

    let mut counts = Vec::new();
    for bucket in split_top_level(args) {
        let bucket = bucket.trim();
        let (label, range) = bucket.split_once(':').ok_or_else(|| {
            EngineError::ClientError(format!(
                "Could not parse the facet range `{}`.",
                bucket
            ))
        })?;
        let range = range.trim();
        let inner = range
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(|| {
                EngineError::ClientError(format!("Could not parse the facet range `{}`.", bucket))
            })?;
        let (lo, hi) = inner.split_once("..").ok_or_else(|| {
            EngineError::ClientError(format!("Could not parse the facet range `{}`.", bucket))
        })?;
        let lo = lo.trim().parse::<f64>().map_err(|_| {
            EngineError::ClientError(format!("Could not parse the facet range `{}`.", bucket))
        })?;
        let hi = hi.trim().parse::<f64>().map_err(|_| {
            EngineError::ClientError(format!("Could not parse the facet range `{}`.", bucket))
        })?;

        let in_range: Vec<u32> = tree
            .range(lo, hi)
            .into_iter()
            .filter(|id| counted_set.contains(id))
            .collect();
        counts.push(json!({
            "value": label.trim(),
            "count": in_range.len(),
            "highlighted": label.trim(),
        }));
    }

    Ok(json!({
        "field_name": field_name,
        "counts": counts,
        "stats": numeric_facet_stats(coll, field_name, counted_set),
    }))
}

fn numeric_facet_stats(coll: &Collection, field_name: &str, ids: &BTreeSet<u32>) -> Value {
    let Some(tree) = coll.indexes.numeric.get(field_name) else {
        return json!({});
    };
    let values: Vec<f64> = ids.iter().filter_map(|id| tree.sort_value(*id)).collect();
    if values.is_empty() {
        return json!({});
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    json!({
        "min": min,
        "max": max,
        "sum": sum,
        "avg": sum / values.len() as f64,
        "total_values": values.len(),
    })
}

// ==================== Hit Assembly ====================

#[allow(clippy::too_many_arguments)]
fn make_hit(
    coll: &Collection,
    refs: Option<&dyn ReferenceTarget>,
    params: &SearchParams,
    matches: &HashMap<u32, DocMatch>,
    query_fields: &[String],
    highlight_opts: &HighlightOptions,
    include_references: bool,
    seq_id: u32,
) -> EngineResult<Value> {
    let stored = coll.load_doc(seq_id)?.ok_or_else(|| {
        EngineError::Fatal(format!("Document {} is missing from the store.", seq_id))
    })?;

    // Reference includes: when the filter traversed a reference, embed the
    // referenced documents under their collection name.
    let mut reference_docs: Vec<(String, Value)> = Vec::new();
    if include_references {
        if let Some(refs) = refs {
            for field in coll.schema.reference_fields() {
                let Some((foreign_coll, _)) =
                    field.reference.as_deref().and_then(|r| r.split_once('.'))
                else {
                    continue;
                };
                let helper_key = format!("{}{}", field.name, REFERENCE_HELPER_SUFFIX);
                if let Some(foreign_seq) = stored.get(&helper_key).and_then(Value::as_u64) {
                    if let Some(doc) = refs.foreign_document(foreign_coll, foreign_seq as u32) {
                        reference_docs.push((foreign_coll.to_string(), doc));
                    }
                }
            }
        }
    }

    let mut document = strip_sidecars(stored.clone());
    for (collection, doc) in reference_docs {
        document.insert(collection, doc);
    }

    // Include / exclude projection; `id` always survives.
    if !params.include_fields.is_empty() {
        let keep: HashSet<&String> = params.include_fields.iter().collect();
        document.retain(|key, _| key == "id" || keep.contains(&key.to_string()));
    }
    for excluded in &params.exclude_fields {
        document.remove(excluded);
    }

    let doc_match = matches.get(&seq_id);

    // Highlighting over the query fields (or the explicit highlight list).
    let mut highlight = Map::new();
    let mut highlights_v1 = Vec::new();
    let highlight_fields: Vec<String> = if !params.highlight_fields.is_empty() {
        params.highlight_fields.clone()
    } else {
        query_fields.to_vec()
    };
    if let Some(dm) = doc_match {
        for field_name in &highlight_fields {
            let Some(matched) = dm.matched_tokens.get(field_name) else {
                continue;
            };
            if matched.is_empty() {
                continue;
            }
            let full = params.highlight_full_fields.contains(field_name)
                || params.highlight_full_fields.iter().any(|f| f == "*");
            let mut opts = highlight_opts.clone();
            opts.full_value = full;

            let path: Vec<&str> = field_name.split('.').collect();
            let stripped = Value::Object(strip_sidecars(stored.clone()));
            if let Some(sub) = nested_highlight(&stripped, &path, matched, &opts) {
                let mut wrapper = Map::new();
                nest_path(&mut wrapper, &path, sub);
                merge_highlight(&mut highlight, Value::Object(wrapper));
            }

            if params.enable_highlight_v1 {
                if let Some(value) = stored.get(field_name) {
                    for (i, text) in field_strings(value).iter().enumerate() {
                        let vh: ValueHighlight =
                            super::highlight::highlight_value(text, matched, &opts);
                        if !vh.matched_tokens.is_empty() {
                            highlights_v1.push(v1_entry(
                                field_name,
                                &vh,
                                value.is_array(),
                                i,
                            ));
                        }
                    }
                }
            }
        }
    }

    let mut hit = Map::new();
    hit.insert("document".into(), Value::Object(document));
    hit.insert("highlight".into(), Value::Object(highlight));
    if params.enable_highlight_v1 {
        hit.insert("highlights".into(), Value::Array(highlights_v1));
    }
    if let Some(dm) = doc_match {
        hit.insert(
            "text_match".into(),
            Value::String(dm.score.0.to_string()),
        );
        hit.insert("text_match_info".into(), dm.score.info_json(dm.typo_edits));
        if let Some(distance) = dm.vector_distance {
            hit.insert("vector_distance".into(), json!(distance));
        }
    }
    Ok(Value::Object(hit))
}

/// Wrap `value` under the nested path: `["a", "b"]` -> `{"a": {"b": value}}`.
/// The innermost level is where `nested_highlight` already produced its
/// structure, so only the leading segments wrap.
fn nest_path(target: &mut Map<String, Value>, path: &[&str], value: Value) {
    // nested_highlight returns the structure keyed from the first path
    // segment already, so merge it directly.
    let _ = path;
    if let Value::Object(obj) = value {
        for (k, v) in obj {
            target.insert(k, v);
        }
    } else {
        // Array at the top level (field itself nested in arrays).
        if let Some(first) = path.first() {
            target.insert(first.to_string(), value);
        }
    }
}

/// Split on top-level commas, ignoring commas inside parens/brackets.
pub fn split_top_level(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    for ch in raw.chars() {
        match ch {
            '(' | '[' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_top_level() {
        assert_eq!(
            split_top_level("a, b(c, d), e[f, g]"),
            vec!["a", "b(c, d)", "e[f, g]"]
        );
    }

    #[test]
    fn test_parse_distance() {
        assert!((parse_distance("2km").unwrap() - 2000.0).abs() < 1e-9);
        assert!((parse_distance("400m").unwrap() - 400.0).abs() < 1e-9);
        assert!((parse_distance("1mi").unwrap() - 1609.34).abs() < 1e-6);
    }

    #[test]
    fn test_compare_keys_missing_always_last() {
        use std::cmp::Ordering;
        assert_eq!(
            compare_keys(&ClauseKey::Missing, &ClauseKey::Num(1.0), true),
            Ordering::Greater
        );
        assert_eq!(
            compare_keys(&ClauseKey::Num(1.0), &ClauseKey::Missing, false),
            Ordering::Less
        );
        assert_eq!(
            compare_keys(&ClauseKey::Num(2.0), &ClauseKey::Num(1.0), true),
            Ordering::Less
        );
    }
}
