use serde_json::{json, Value};

/// The packed 64-bit text-match score. Field layout from high to low bit
/// weight:
///
/// ```text
///   bits 48..56  best-field rank (query_by weight of the best field)
///   bits 40..48  token coverage (query tokens matched)
///   bits 32..40  exactness (all tokens matched with zero edits)
///   bits 24..32  token-position proximity (inverted span of match positions)
///   bits 16..24  number of matching fields
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextMatchScore(pub u64);

const RANK_SHIFT: u32 = 48;
const COVERAGE_SHIFT: u32 = 40;
const EXACT_SHIFT: u32 = 32;
const PROXIMITY_SHIFT: u32 = 24;
const FIELDS_SHIFT: u32 = 16;

#[allow(clippy::too_many_arguments)]
pub fn pack_score(
    field_rank: u8,
    tokens_matched: u8,
    exact: bool,
    proximity: u8,
    num_matching_fields: u8,
    prioritize_exact_match: bool,
    prioritize_token_position: bool,
    prioritize_num_matching_fields: bool,
) -> TextMatchScore {
    let mut score = ((field_rank as u64) << RANK_SHIFT) | ((tokens_matched as u64) << COVERAGE_SHIFT);
    if prioritize_exact_match && exact {
        score |= 1 << EXACT_SHIFT;
    }
    if prioritize_token_position {
        score |= (proximity as u64) << PROXIMITY_SHIFT;
    }
    if prioritize_num_matching_fields {
        score |= (num_matching_fields as u64) << FIELDS_SHIFT;
    }
    TextMatchScore(score)
}

impl TextMatchScore {
    pub fn tokens_matched(&self) -> u8 {
        ((self.0 >> COVERAGE_SHIFT) & 0xFF) as u8
    }

    pub fn field_rank(&self) -> u8 {
        ((self.0 >> RANK_SHIFT) & 0xFF) as u8
    }

    pub fn num_matching_fields(&self) -> u8 {
        ((self.0 >> FIELDS_SHIFT) & 0xFF) as u8
    }

    /// The `text_match_info` object attached to each hit.
    pub fn info_json(&self, typo_edits: u32) -> Value {
        json!({
            "score": self.0.to_string(),
            "fields_matched": self.num_matching_fields(),
            "tokens_matched": self.tokens_matched(),
            "best_field_score": ((self.0 >> COVERAGE_SHIFT) & 0xFFFF).to_string(),
            "best_field_weight": self.field_rank(),
            "num_tokens_dropped": 0,
            "typo_prefix_score": typo_edits,
        })
    }
}

/// Proximity component: the tighter the matched positions sit together, the
/// higher the value. `span` is (max position - min position) of the matched
/// tokens inside the document field.
pub fn proximity_score(span: u32, tokens_matched: u32) -> u8 {
    if tokens_matched <= 1 {
        return 255;
    }
    let ideal = tokens_matched - 1;
    let excess = span.saturating_sub(ideal);
    255u32.saturating_sub(excess.min(255)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_rank_dominates_coverage() {
        let high_rank = pack_score(10, 1, false, 0, 1, true, false, true);
        let low_rank = pack_score(5, 2, true, 0, 2, true, false, true);
        assert!(high_rank.0 > low_rank.0);
    }

    #[test]
    fn test_coverage_dominates_exactness() {
        let more_tokens = pack_score(1, 3, false, 0, 1, true, false, true);
        let exact = pack_score(1, 2, true, 0, 1, true, false, true);
        assert!(more_tokens.0 > exact.0);
    }

    #[test]
    fn test_exactness_toggle() {
        let with = pack_score(1, 2, true, 0, 1, true, false, true);
        let without = pack_score(1, 2, true, 0, 1, false, false, true);
        assert!(with.0 > without.0);
    }

    #[test]
    fn test_proximity_only_when_prioritized() {
        let on = pack_score(1, 2, false, 200, 1, true, true, true);
        let off = pack_score(1, 2, false, 200, 1, true, false, true);
        assert!(on.0 > off.0);
    }

    #[test]
    fn test_proximity_score() {
        // Adjacent tokens are perfect.
        assert_eq!(proximity_score(1, 2), 255);
        // One gap costs one point.
        assert_eq!(proximity_score(2, 2), 254);
        // Single-token matches have no span.
        assert_eq!(proximity_score(0, 1), 255);
    }

    #[test]
    fn test_unpack_accessors() {
        let score = pack_score(9, 4, true, 7, 3, true, true, true);
        assert_eq!(score.field_rank(), 9);
        assert_eq!(score.tokens_matched(), 4);
        assert_eq!(score.num_matching_fields(), 3);
    }
}
