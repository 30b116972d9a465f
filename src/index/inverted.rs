use std::collections::{BTreeMap, HashMap};

/// Tokenizer knobs configured per collection (and per field for locale).
#[derive(Debug, Clone, Default)]
pub struct TokenizerConfig {
    pub symbols_to_index: Vec<char>,
    pub token_separators: Vec<char>,
    pub locale: String,
}

/// Split a field value into lowercase index tokens. Alphanumerics and the
/// configured symbols stay; configured separators split; everything else is
/// treated as whitespace.
pub fn tokenize(text: &str, config: &TokenizerConfig) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if config.token_separators.contains(&ch) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else if ch.is_alphanumeric() || config.symbols_to_index.contains(&ch) {
            for lower in ch.to_lowercase() {
                current.push(lower);
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Levenshtein distance bounded by `max`; `None` when the bound is exceeded.
/// The row-minimum cutoff keeps typo expansion cheap over large dictionaries.
pub fn levenshtein_bounded(a: &str, b: &str, max: usize) -> Option<usize> {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let (a_len, b_len) = (a_chars.len(), b_chars.len());

    if a_len.abs_diff(b_len) > max {
        return None;
    }
    if a_len == 0 {
        return Some(b_len);
    }
    if b_len == 0 {
        return Some(a_len);
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0usize; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        let mut row_min = curr[0];
        for j in 1..=b_len {
            let cost = usize::from(a_chars[i - 1] != b_chars[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(curr[j]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    (prev[b_len] <= max).then_some(prev[b_len])
}

/// A token match produced by candidate expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenCandidate {
    pub token: String,
    pub distance: usize,
    pub prefix: bool,
}

/// Per-field inverted index: token → seq id → token positions.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: HashMap<String, BTreeMap<u32, Vec<u32>>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_tokens(&self) -> usize {
        self.postings.len()
    }

    /// Index a document's tokens; positions are the token offsets in order.
    pub fn add_document(&mut self, seq_id: u32, tokens: &[String]) {
        for (pos, token) in tokens.iter().enumerate() {
            self.postings
                .entry(token.clone())
                .or_default()
                .entry(seq_id)
                .or_default()
                .push(pos as u32);
        }
    }

    pub fn remove_document(&mut self, seq_id: u32, tokens: &[String]) {
        for token in tokens {
            let mut empty = false;
            if let Some(docs) = self.postings.get_mut(token) {
                docs.remove(&seq_id);
                empty = docs.is_empty();
            }
            if empty {
                self.postings.remove(token);
            }
        }
    }

    pub fn postings(&self, token: &str) -> Option<&BTreeMap<u32, Vec<u32>>> {
        self.postings.get(token)
    }

    /// Expand a query token to dictionary candidates.
    ///
    /// Exact matches come first, then edit-distance candidates within
    /// `num_typos` (gated by the min-length thresholds), then prefix matches
    /// when `prefix` is set. The result is truncated to `max_candidates`.
    #[allow(clippy::too_many_arguments)]
    pub fn candidates(
        &self,
        token: &str,
        num_typos: usize,
        prefix: bool,
        max_candidates: usize,
        min_len_1typo: usize,
        min_len_2typo: usize,
        typos_for_numerical: bool,
        typos_for_alpha_numerical: bool,
    ) -> Vec<TokenCandidate> {
        let token_len = token.chars().count();
        let mut budget = num_typos;
        if token_len < min_len_1typo {
            budget = 0;
        } else if token_len < min_len_2typo {
            budget = budget.min(1);
        }
        let is_numeric = token.chars().all(|c| c.is_ascii_digit());
        let is_alpha_numeric = !is_numeric && token.chars().any(|c| c.is_ascii_digit());
        if (is_numeric && !typos_for_numerical) || (is_alpha_numeric && !typos_for_alpha_numerical)
        {
            budget = 0;
        }

        let mut out = Vec::new();
        if self.postings.contains_key(token) {
            out.push(TokenCandidate {
                token: token.to_string(),
                distance: 0,
                prefix: false,
            });
        }

        if budget > 0 || prefix {
            let mut fuzzy: Vec<TokenCandidate> = Vec::new();
            for dict_token in self.postings.keys() {
                if dict_token == token {
                    continue;
                }
                if prefix && dict_token.starts_with(token) {
                    fuzzy.push(TokenCandidate {
                        token: dict_token.clone(),
                        distance: 0,
                        prefix: true,
                    });
                    continue;
                }
                if budget > 0 {
                    if let Some(distance) = levenshtein_bounded(token, dict_token, budget) {
                        if distance > 0 {
                            fuzzy.push(TokenCandidate {
                                token: dict_token.clone(),
                                distance,
                                prefix: false,
                            });
                        }
                    }
                }
            }
            // Closest first; shorter dictionary tokens break ties so that the
            // candidate set is stable.
            fuzzy.sort_by(|a, b| {
                a.distance
                    .cmp(&b.distance)
                    .then(a.token.len().cmp(&b.token.len()))
                    .then(a.token.cmp(&b.token))
            });
            out.extend(fuzzy);
        }

        out.truncate(max_candidates);
        out
    }

    /// Dictionary tokens containing `token` strictly inside them, bounded by
    /// the extra prefix/suffix allowances.
    pub fn infix_candidates(
        &self,
        token: &str,
        max_extra_prefix: usize,
        max_extra_suffix: usize,
        max_candidates: usize,
    ) -> Vec<String> {
        let mut out = Vec::new();
        for dict_token in self.postings.keys() {
            if dict_token == token {
                continue;
            }
            if let Some(at) = dict_token.find(token) {
                let extra_prefix = at;
                let extra_suffix = dict_token.len() - at - token.len();
                if extra_prefix <= max_extra_prefix && extra_suffix <= max_extra_suffix {
                    out.push(dict_token.clone());
                }
            }
            if out.len() >= max_candidates {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenizerConfig {
        TokenizerConfig::default()
    }

    #[test]
    fn test_tokenize_basic() {
        assert_eq!(
            tokenize("Sherlock Holmes, Vol. 1", &config()),
            vec!["sherlock", "holmes", "vol", "1"]
        );
    }

    #[test]
    fn test_tokenize_symbols_and_separators() {
        let cfg = TokenizerConfig {
            symbols_to_index: vec!['+'],
            token_separators: vec!['-'],
            locale: String::new(),
        };
        assert_eq!(tokenize("c++ e-mail", &cfg), vec!["c++", "e", "mail"]);
    }

    #[test]
    fn test_levenshtein_bounded() {
        assert_eq!(levenshtein_bounded("kitten", "sitting", 3), Some(3));
        assert_eq!(levenshtein_bounded("kitten", "sitting", 2), None);
        assert_eq!(levenshtein_bounded("same", "same", 2), Some(0));
        assert_eq!(levenshtein_bounded("ab", "abcdef", 2), None);
    }

    #[test]
    fn test_add_remove_document() {
        let mut index = InvertedIndex::new();
        let tokens = tokenize("the quick fox", &config());
        index.add_document(7, &tokens);

        assert_eq!(index.postings("quick").unwrap().get(&7), Some(&vec![1]));

        index.remove_document(7, &tokens);
        assert!(index.postings("quick").is_none());
    }

    #[test]
    fn test_typo_candidates_respect_length_gates() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &["sherlock".to_string()]);
        index.add_document(2, &["cat".to_string()]);

        // 8-char token: 2 typos allowed with defaults (4, 7).
        let candidates = index.candidates("sherlok", 2, false, 10, 4, 7, true, true);
        assert!(candidates.iter().any(|c| c.token == "sherlock"));

        // 3-char token: below min_len_1typo, no typo candidates.
        let candidates = index.candidates("cet", 2, false, 10, 4, 7, true, true);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_six_char_token_gets_one_typo() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &["flower".to_string()]);

        // "flowre" -> "flower" is distance 2; a 6-char token is capped at 1.
        let candidates = index.candidates("flowre", 2, false, 10, 4, 7, true, true);
        assert!(candidates.is_empty());

        // Distance 1 still matches.
        let candidates = index.candidates("flowes", 2, false, 10, 4, 7, true, true);
        assert_eq!(candidates[0].token, "flower");
        assert_eq!(candidates[0].distance, 1);
    }

    #[test]
    fn test_prefix_candidates() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &["sherlock".to_string(), "shelf".to_string()]);

        let candidates = index.candidates("she", 0, true, 10, 4, 7, true, true);
        let tokens: Vec<_> = candidates.iter().map(|c| c.token.as_str()).collect();
        assert!(tokens.contains(&"sherlock"));
        assert!(tokens.contains(&"shelf"));
        assert!(candidates.iter().all(|c| c.prefix));
    }

    #[test]
    fn test_numerical_typo_gate() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &["12345".to_string()]);

        let candidates = index.candidates("12346", 2, false, 10, 4, 7, false, true);
        assert!(candidates.is_empty());

        let candidates = index.candidates("12346", 2, false, 10, 4, 7, true, true);
        assert_eq!(candidates[0].token, "12345");
    }

    #[test]
    fn test_infix_candidates() {
        let mut index = InvertedIndex::new();
        index.add_document(1, &["wristwatch".to_string()]);

        let hits = index.infix_candidates("twa", usize::MAX, usize::MAX, 10);
        assert_eq!(hits, vec!["wristwatch"]);

        // Bounded affixes exclude the match.
        let hits = index.infix_candidates("twa", 2, usize::MAX, 10);
        assert!(hits.is_empty());
    }
}
