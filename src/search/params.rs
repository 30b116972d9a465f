use std::collections::{BTreeMap, HashSet};

use crate::error::{EngineError, EngineResult};
use crate::schema::InfixMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextMatchType {
    #[default]
    MaxScore,
    MaxWeightedScore,
    SumScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropTokensMode {
    #[default]
    RightToLeft,
    LeftToRight,
    BothSides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitJoinMode {
    Off,
    #[default]
    Fallback,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacetStrategy {
    #[default]
    Automatic,
    Exhaustive,
    TopValues,
}

/// A parsed `vector_query` parameter: `field:([0.1, 0.2, ...], k:10)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub field: String,
    pub values: Vec<f32>,
    pub k: usize,
}

/// The enumerated search-parameter set with its documented defaults. Raw
/// request parameters, embedded parameters, and preset parameters are merged
/// into one map before this is parsed.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub q: String,
    pub query_by: Vec<String>,
    pub query_by_weights: Vec<u32>,
    pub prefix: Vec<bool>,
    pub infix: Vec<InfixMode>,
    pub filter_by: String,
    pub sort_by: String,
    pub facet_by: String,
    pub facet_query: String,
    pub facet_query_num_typos: usize,
    pub max_facet_values: usize,
    pub facet_return_parent: Vec<String>,
    pub facet_strategy: FacetStrategy,
    pub facet_sample_percent: usize,
    pub facet_sample_threshold: usize,
    pub group_by: Vec<String>,
    pub group_limit: usize,
    pub group_missing_values: bool,
    pub include_fields: HashSet<String>,
    pub exclude_fields: HashSet<String>,
    pub limit_hits: usize,
    pub per_page: usize,
    pub page: usize,
    pub offset: usize,
    pub rank_tokens_by: String,
    pub pinned_hits: Vec<(String, usize)>,
    pub hidden_hits: Vec<String>,
    pub enable_overrides: bool,
    pub filter_curated_hits: u8,
    pub enable_synonyms: bool,
    pub synonym_prefix: bool,
    pub synonym_num_typos: usize,
    pub max_candidates: usize,
    pub num_typos: Vec<usize>,
    pub min_len_1typo: usize,
    pub min_len_2typo: usize,
    pub drop_tokens_threshold: usize,
    pub typo_tokens_threshold: usize,
    pub drop_tokens_mode: DropTokensMode,
    pub split_join_tokens: SplitJoinMode,
    pub prioritize_exact_match: bool,
    pub prioritize_token_position: bool,
    pub prioritize_num_matching_fields: bool,
    pub pre_segmented_query: bool,
    pub exhaustive_search: bool,
    pub search_cutoff_ms: u64,
    pub snippet_threshold: usize,
    pub highlight_affix_num_tokens: usize,
    pub highlight_full_fields: Vec<String>,
    pub highlight_fields: Vec<String>,
    pub highlight_start_tag: String,
    pub highlight_end_tag: String,
    pub enable_highlight_v1: bool,
    pub text_match_type: TextMatchType,
    pub max_extra_prefix: usize,
    pub max_extra_suffix: usize,
    pub vector_query: Option<VectorQuery>,
    pub remote_embedding_timeout_ms: u64,
    pub remote_embedding_num_tries: usize,
    pub stopwords: String,
    pub override_tags: Vec<String>,
    pub enable_typos_for_numerical_tokens: bool,
    pub enable_typos_for_alpha_numerical_tokens: bool,
    pub enable_lazy_filter: bool,
    pub max_filter_by_candidates: usize,
    pub rerank_hybrid_matches: bool,
    pub enable_analytics: bool,
    pub validate_field_names: bool,
}

impl SearchParams {
    /// Parse a merged parameter map. `q` is mandatory; everything else has a
    /// documented default.
    pub fn from_map(map: &BTreeMap<String, String>) -> EngineResult<SearchParams> {
        let q = map
            .get("q")
            .cloned()
            .ok_or_else(|| EngineError::ClientError("Parameter `q` is required.".into()))?;

        let query_by = csv_list(map.get("query_by"));

        let per_page = match map.get("limit").or_else(|| map.get("per_page")) {
            Some(raw) => parse_usize("per_page", raw)?,
            None => 10,
        };

        let num_typos = match map.get("num_typos") {
            Some(raw) => {
                let values: Vec<usize> = raw
                    .split(',')
                    .map(|v| parse_usize("num_typos", v.trim()))
                    .collect::<EngineResult<_>>()?;
                if values.iter().any(|v| *v > 2) {
                    return Err(EngineError::ClientError(
                        "Parameter `num_typos` must be 0, 1 or 2.".into(),
                    ));
                }
                values
            }
            None => vec![2],
        };

        let prefix = match map.get("prefix") {
            Some(raw) => raw
                .split(',')
                .map(|v| parse_bool("prefix", v.trim()))
                .collect::<EngineResult<_>>()?,
            None => vec![true],
        };

        let infix = match map.get("infix") {
            Some(raw) => raw
                .split(',')
                .map(|v| InfixMode::parse(v.trim()))
                .collect::<EngineResult<_>>()?,
            None => vec![InfixMode::Off],
        };

        let exhaustive_search = opt_bool(map, "exhaustive_search", false)?;

        let params = SearchParams {
            q,
            query_by,
            query_by_weights: match map.get("query_by_weights") {
                Some(raw) => raw
                    .split(',')
                    .map(|v| {
                        v.trim().parse::<u32>().map_err(|_| {
                            EngineError::ClientError(
                                "Parameter `query_by_weights` must be a list of integers.".into(),
                            )
                        })
                    })
                    .collect::<EngineResult<_>>()?,
                None => Vec::new(),
            },
            prefix,
            infix,
            filter_by: map.get("filter_by").cloned().unwrap_or_default(),
            sort_by: map.get("sort_by").cloned().unwrap_or_default(),
            facet_by: map.get("facet_by").cloned().unwrap_or_default(),
            facet_query: map.get("facet_query").cloned().unwrap_or_default(),
            facet_query_num_typos: opt_usize(map, "facet_query_num_typos", 2)?,
            max_facet_values: opt_usize(map, "max_facet_values", 10)?,
            facet_return_parent: csv_list(map.get("facet_return_parent")),
            facet_strategy: match map.get("facet_strategy").map(String::as_str) {
                None | Some("automatic") => FacetStrategy::Automatic,
                Some("exhaustive") => FacetStrategy::Exhaustive,
                Some("top_values") => FacetStrategy::TopValues,
                Some(other) => {
                    return Err(EngineError::ClientError(format!(
                        "Invalid facet_strategy `{}`.",
                        other
                    )))
                }
            },
            facet_sample_percent: {
                let v = opt_usize(map, "facet_sample_percent", 100)?;
                if v > 100 {
                    return Err(EngineError::ClientError(
                        "Parameter `facet_sample_percent` must be less than 100.".into(),
                    ));
                }
                v
            },
            facet_sample_threshold: opt_usize(map, "facet_sample_threshold", 0)?,
            group_by: csv_list(map.get("group_by")),
            group_limit: opt_usize(map, "group_limit", 3)?,
            group_missing_values: opt_bool(map, "group_missing_values", true)?,
            include_fields: csv_list(map.get("include_fields")).into_iter().collect(),
            exclude_fields: csv_list(map.get("exclude_fields")).into_iter().collect(),
            limit_hits: opt_usize(map, "limit_hits", usize::MAX)?,
            per_page,
            page: opt_usize(map, "page", 0)?,
            offset: opt_usize(map, "offset", 0)?,
            rank_tokens_by: map.get("rank_tokens_by").cloned().unwrap_or_default(),
            pinned_hits: parse_pinned(map.get("pinned_hits"))?,
            hidden_hits: csv_list(map.get("hidden_hits")),
            enable_overrides: opt_bool(map, "enable_overrides", true)?,
            filter_curated_hits: match map.get("filter_curated_hits").map(String::as_str) {
                None => 2,
                Some("true") | Some("1") => 1,
                Some("false") | Some("0") => 0,
                Some("2") => 2,
                Some(other) => {
                    return Err(EngineError::ClientError(format!(
                        "Invalid filter_curated_hits `{}`.",
                        other
                    )))
                }
            },
            enable_synonyms: opt_bool(map, "enable_synonyms", true)?,
            synonym_prefix: opt_bool(map, "synonym_prefix", false)?,
            synonym_num_typos: opt_usize(map, "synonym_num_typos", 0)?,
            max_candidates: opt_usize(
                map,
                "max_candidates",
                if exhaustive_search { 10_000 } else { 4 },
            )?,
            num_typos,
            min_len_1typo: opt_usize(map, "min_len_1typo", 4)?,
            min_len_2typo: opt_usize(map, "min_len_2typo", 7)?,
            drop_tokens_threshold: opt_usize(map, "drop_tokens_threshold", 10)?,
            typo_tokens_threshold: opt_usize(map, "typo_tokens_threshold", 1)?,
            drop_tokens_mode: match map.get("drop_tokens_mode").map(String::as_str) {
                None | Some("right_to_left") => DropTokensMode::RightToLeft,
                Some("left_to_right") => DropTokensMode::LeftToRight,
                Some("both_sides:3") | Some("both_sides") => DropTokensMode::BothSides,
                Some(other) => {
                    return Err(EngineError::ClientError(format!(
                        "Invalid drop_tokens_mode `{}`.",
                        other
                    )))
                }
            },
            split_join_tokens: match map.get("split_join_tokens").map(String::as_str) {
                Some("off") | Some("false") => SplitJoinMode::Off,
                None | Some("fallback") => SplitJoinMode::Fallback,
                Some("always") | Some("true") => SplitJoinMode::Always,
                Some(other) => {
                    return Err(EngineError::ClientError(format!(
                        "Invalid split_join_tokens `{}`.",
                        other
                    )))
                }
            },
            prioritize_exact_match: opt_bool(map, "prioritize_exact_match", true)?,
            prioritize_token_position: opt_bool(map, "prioritize_token_position", false)?,
            prioritize_num_matching_fields: opt_bool(map, "prioritize_num_matching_fields", true)?,
            pre_segmented_query: opt_bool(map, "pre_segmented_query", false)?,
            exhaustive_search,
            search_cutoff_ms: opt_usize(map, "search_cutoff_ms", 30_000)? as u64,
            snippet_threshold: opt_usize(map, "snippet_threshold", 30)?,
            highlight_affix_num_tokens: opt_usize(map, "highlight_affix_num_tokens", 4)?,
            highlight_full_fields: csv_list(map.get("highlight_full_fields")),
            highlight_fields: csv_list(map.get("highlight_fields")),
            highlight_start_tag: map
                .get("highlight_start_tag")
                .cloned()
                .unwrap_or_else(|| "<mark>".to_string()),
            highlight_end_tag: map
                .get("highlight_end_tag")
                .cloned()
                .unwrap_or_else(|| "</mark>".to_string()),
            enable_highlight_v1: opt_bool(map, "enable_highlight_v1", true)?,
            text_match_type: match map.get("text_match_type").map(String::as_str) {
                None | Some("max_score") => TextMatchType::MaxScore,
                Some("max_weighted_score") => TextMatchType::MaxWeightedScore,
                Some("sum_score") => TextMatchType::SumScore,
                Some(other) => {
                    return Err(EngineError::ClientError(format!(
                        "Invalid text_match_type `{}`.",
                        other
                    )))
                }
            },
            max_extra_prefix: opt_usize(map, "max_extra_prefix", usize::MAX)?,
            max_extra_suffix: opt_usize(map, "max_extra_suffix", usize::MAX)?,
            vector_query: match map.get("vector_query") {
                Some(raw) if !raw.is_empty() => Some(parse_vector_query(raw)?),
                _ => None,
            },
            remote_embedding_timeout_ms: opt_usize(map, "remote_embedding_timeout_ms", 5_000)?
                as u64,
            remote_embedding_num_tries: opt_usize(map, "remote_embedding_num_tries", 2)?,
            stopwords: map.get("stopwords").cloned().unwrap_or_default(),
            override_tags: csv_list(map.get("override_tags")),
            enable_typos_for_numerical_tokens: opt_bool(
                map,
                "enable_typos_for_numerical_tokens",
                true,
            )?,
            enable_typos_for_alpha_numerical_tokens: opt_bool(
                map,
                "enable_typos_for_alpha_numerical_tokens",
                true,
            )?,
            enable_lazy_filter: opt_bool(map, "enable_lazy_filter", false)?,
            max_filter_by_candidates: opt_usize(map, "max_filter_by_candidates", usize::MAX)?,
            rerank_hybrid_matches: opt_bool(map, "rerank_hybrid_matches", false)?,
            enable_analytics: opt_bool(map, "enable_analytics", true)?,
            validate_field_names: opt_bool(map, "validate_field_names", true)?,
        };

        Ok(params)
    }

    /// Wildcard queries skip the text-match stage entirely.
    pub fn is_wildcard(&self) -> bool {
        self.q == "*"
    }

    /// Effective start offset: a non-zero `page` wins over `offset`.
    pub fn start_offset(&self) -> usize {
        if self.page > 0 {
            (self.page - 1) * self.per_page
        } else {
            self.offset
        }
    }

    /// Per-field lookup helpers: the last configured value extends to the
    /// remaining `query_by` entries.
    pub fn num_typos_for(&self, field_idx: usize) -> usize {
        *self
            .num_typos
            .get(field_idx)
            .or_else(|| self.num_typos.last())
            .unwrap_or(&2)
    }

    pub fn prefix_for(&self, field_idx: usize) -> bool {
        *self
            .prefix
            .get(field_idx)
            .or_else(|| self.prefix.last())
            .unwrap_or(&true)
    }

    pub fn infix_for(&self, field_idx: usize) -> InfixMode {
        *self
            .infix
            .get(field_idx)
            .or_else(|| self.infix.last())
            .unwrap_or(&InfixMode::Off)
    }

    pub fn weight_for(&self, field_idx: usize) -> u32 {
        self.query_by_weights
            .get(field_idx)
            .copied()
            .unwrap_or_else(|| {
                // Without explicit weights, earlier fields outrank later ones.
                (self.query_by.len().saturating_sub(field_idx)) as u32
            })
    }
}

fn csv_list(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_usize(key: &str, raw: &str) -> EngineResult<usize> {
    raw.parse::<usize>().map_err(|_| {
        EngineError::ClientError(format!("Parameter `{}` must be an unsigned integer.", key))
    })
}

fn opt_usize(map: &BTreeMap<String, String>, key: &str, default: usize) -> EngineResult<usize> {
    match map.get(key) {
        Some(raw) => parse_usize(key, raw),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> EngineResult<bool> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(EngineError::ClientError(format!(
            "Parameter `{}` must be `true` or `false`.",
            key
        ))),
    }
}

fn opt_bool(map: &BTreeMap<String, String>, key: &str, default: bool) -> EngineResult<bool> {
    match map.get(key) {
        Some(raw) => parse_bool(key, raw),
        None => Ok(default),
    }
}

fn parse_pinned(raw: Option<&String>) -> EngineResult<Vec<(String, usize)>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|v| !v.is_empty()) {
        let Some((id, position)) = entry.rsplit_once(':') else {
            return Err(EngineError::ClientError(format!(
                "Invalid pinned_hits entry `{}`: expected `id:position`.",
                entry
            )));
        };
        let position = position.parse::<usize>().map_err(|_| {
            EngineError::ClientError(format!(
                "Invalid pinned_hits position in `{}`.",
                entry
            ))
        })?;
        if position == 0 {
            return Err(EngineError::ClientError(
                "pinned_hits positions are 1-based.".into(),
            ));
        }
        out.push((id.to_string(), position));
    }
    Ok(out)
}

fn parse_vector_query(raw: &str) -> EngineResult<VectorQuery> {
    let err = || {
        EngineError::ClientError(
            "Invalid vector_query: expected `field:([0.1, 0.2], k:10)`.".into(),
        )
    };
    let colon = raw.find(':').ok_or_else(err)?;
    let field = raw[..colon].trim().to_string();
    let rest = raw[colon + 1..].trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(err)?;

    let open = inner.find('[').ok_or_else(err)?;
    let close = inner.find(']').ok_or_else(err)?;
    if close < open {
        return Err(err());
    }
    let values: Vec<f32> = inner[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<f32>().map_err(|_| err()))
        .collect::<EngineResult<_>>()?;

    let mut k = 10usize;
    for part in inner[close + 1..].split(',').map(str::trim) {
        if let Some(v) = part.strip_prefix("k:") {
            k = v.trim().parse::<usize>().map_err(|_| err())?;
        }
    }

    Ok(VectorQuery { field, values, k })
}
