use std::collections::{BTreeSet, HashMap};

/// Per-field facet index. Keeps both directions: the value index for the
/// precomputed counting strategy, and the document column for the
/// iterate-the-filter strategy.
#[derive(Debug, Default)]
pub struct FacetIndex {
    value_docs: HashMap<String, BTreeSet<u32>>,
    doc_values: HashMap<u32, Vec<String>>,
}

impl FacetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, seq_id: u32, value: &str) {
        self.value_docs
            .entry(value.to_string())
            .or_default()
            .insert(seq_id);
        self.doc_values
            .entry(seq_id)
            .or_default()
            .push(value.to_string());
    }

    pub fn remove(&mut self, seq_id: u32) {
        let Some(values) = self.doc_values.remove(&seq_id) else {
            return;
        };
        for value in values {
            let mut empty = false;
            if let Some(docs) = self.value_docs.get_mut(&value) {
                docs.remove(&seq_id);
                empty = docs.is_empty();
            }
            if empty {
                self.value_docs.remove(&value);
            }
        }
    }

    pub fn values_of(&self, seq_id: u32) -> Option<&Vec<String>> {
        self.doc_values.get(&seq_id)
    }

    pub fn num_values(&self) -> usize {
        self.value_docs.len()
    }

    /// Iterate the result set, accumulating value → count.
    pub fn count_by_iteration<'a, I>(&self, result_ids: I) -> HashMap<String, u32>
    where
        I: IntoIterator<Item = &'a u32>,
    {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for seq_id in result_ids {
            if let Some(values) = self.doc_values.get(seq_id) {
                for value in values {
                    *counts.entry(value.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Walk the value index, intersecting each value's postings with the
    /// result set. Cheaper when distinct values are few and results are many.
    pub fn count_by_value_index(&self, result_ids: &BTreeSet<u32>) -> HashMap<String, u32> {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for (value, docs) in &self.value_docs {
            let count = docs.intersection(result_ids).count() as u32;
            if count > 0 {
                counts.insert(value.clone(), count);
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FacetIndex {
        let mut index = FacetIndex::new();
        index.insert(1, "fiction");
        index.insert(2, "fiction");
        index.insert(3, "poetry");
        index.insert(3, "classic");
        index
    }

    #[test]
    fn test_count_by_iteration() {
        let index = sample();
        let results = vec![1, 2, 3];
        let counts = index.count_by_iteration(results.iter());
        assert_eq!(counts.get("fiction"), Some(&2));
        assert_eq!(counts.get("poetry"), Some(&1));
        assert_eq!(counts.get("classic"), Some(&1));
    }

    #[test]
    fn test_count_by_value_index_matches_iteration() {
        let index = sample();
        let results: BTreeSet<u32> = [1, 3].into_iter().collect();
        let by_value = index.count_by_value_index(&results);
        let by_iter = index.count_by_iteration(results.iter());
        assert_eq!(by_value, by_iter);
        assert_eq!(by_value.get("fiction"), Some(&1));
    }

    #[test]
    fn test_remove() {
        let mut index = sample();
        index.remove(3);
        let counts = index.count_by_iteration([1, 2, 3].iter());
        assert!(!counts.contains_key("poetry"));
        assert_eq!(index.num_values(), 1);
    }
}
