//! Similarity and confidence arithmetic shared by the simulation queries.
//!
//! Every function here is total: empty inputs give `0.0`, never `NaN`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::simulation::CONFIDENCE_HALF_SATURATION;

/// `|a ∩ b| / |a ∪ b|`, or `0.0` when both are empty.
pub(crate) fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Length of the longest common subsequence of two step patterns.
pub(crate) fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// LCS length over the longer pattern's length, or `0.0` when both are
/// empty.
pub(crate) fn pattern_similarity(a: &[&str], b: &[&str]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }
    lcs_len(a, b) as f64 / longest as f64
}

/// `n / (n + CONFIDENCE_HALF_SATURATION)`: 0 at no data, 0.5 at the
/// half-saturation count, approaching 1.
pub(crate) fn saturation(sample_size: usize) -> f64 {
    let n = sample_size as f64;
    n / (n + CONFIDENCE_HALF_SATURATION)
}

/// Scale weights to sum to 1. An empty or all-zero map becomes empty.
pub(crate) fn normalize(weights: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let total: f64 = weights.values().sum();
    if total <= 0.0 {
        return BTreeMap::new();
    }
    weights
        .into_iter()
        .map(|(label, w)| (label, w / total))
        .collect()
}

/// Highest score first, ties broken by id ascending.
pub(crate) fn by_score_desc(a: (f64, &str), b: (f64, &str)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set<'a>(items: &[&'a str]) -> BTreeSet<&'a str> {
        items.iter().copied().collect()
    }

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        assert_eq!(jaccard(&set(&[]), &set(&[])), 0.0);
        assert_eq!(jaccard(&set(&["a", "b"]), &set(&["b", "c"])), 1.0 / 3.0);
    }

    #[test]
    fn lcs_matches_known_values() {
        assert_eq!(lcs_len(&["plan", "edit", "test"], &["plan", "test"]), 2);
        assert_eq!(lcs_len(&[], &["plan"]), 0);
        assert_eq!(pattern_similarity(&["a", "b", "c", "d"], &["a", "c"]), 0.5);
        assert_eq!(pattern_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn saturation_starts_at_zero_and_halves_at_constant() {
        assert_eq!(saturation(0), 0.0);
        assert_eq!(saturation(5), 0.5);
        assert!(saturation(1000) < 1.0);
    }

    #[test]
    fn normalize_sums_to_one_or_empties() {
        let dist = normalize(BTreeMap::from([("a".into(), 3.0), ("b".into(), 1.0)]));
        assert_eq!(dist["a"], 0.75);
        assert!((dist.values().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(normalize(BTreeMap::from([("a".into(), 0.0)])).is_empty());
    }
}
