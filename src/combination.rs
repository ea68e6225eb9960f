//! # Combination Canonicalization
//!
//! Pure functions that normalize a pair of feature groups (and an optional
//! conditioning set) into an order-independent cache key, and that detect
//! whether a query's requested group order matches the canonical order so
//! results can be relabeled on the way out.
//!
//! The total order used for canonicalization is (group cardinality, then
//! lexicographic content). It must be stable under permutation of the input:
//! two calls with the groups supplied in either order produce byte-identical
//! keys, which is what makes the model and decomposition caches collapse
//! symmetric queries onto one entry.

use crate::data::Feature;

/// A finite set of features treated as one atomic unit in a combination.
/// Stored as a Vec; canonicalization sorts it.
pub type FeatureGroup = Vec<Feature>;

/// A caller-facing group specification. A bare feature name is shorthand for
/// a one-element group.
#[derive(Debug, Clone)]
pub enum GroupSpec {
    Single(Feature),
    Group(Vec<Feature>),
}

impl GroupSpec {
    pub fn features(&self) -> FeatureGroup {
        match self {
            GroupSpec::Single(f) => vec![f.clone()],
            GroupSpec::Group(fs) => fs.clone(),
        }
    }
}

impl From<&str> for GroupSpec {
    fn from(f: &str) -> Self {
        GroupSpec::Single(f.to_string())
    }
}

impl From<String> for GroupSpec {
    fn from(f: String) -> Self {
        GroupSpec::Single(f)
    }
}

impl From<Vec<String>> for GroupSpec {
    fn from(fs: Vec<String>) -> Self {
        GroupSpec::Group(fs)
    }
}

impl From<Vec<&str>> for GroupSpec {
    fn from(fs: Vec<&str>) -> Self {
        GroupSpec::Group(fs.into_iter().map(str::to_string).collect())
    }
}

/// The order-independent representation of a combination plus conditioning
/// set, used as the key for both the model cache and the decomposition cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    pub groups: Vec<FeatureGroup>,
    pub conditioning: FeatureGroup,
}

/// Sorts features within each group; unless `inner_only`, also sorts the
/// groups themselves by (cardinality, lexicographic content).
pub fn sort_groups(groups: &[FeatureGroup], inner_only: bool) -> Vec<FeatureGroup> {
    let mut sorted: Vec<FeatureGroup> = groups
        .iter()
        .map(|g| {
            let mut g = g.clone();
            g.sort();
            g
        })
        .collect();
    if !inner_only {
        sorted.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    }
    sorted
}

/// Builds the canonical cache key for a set of groups and a conditioning set.
pub fn canonicalize(groups: &[FeatureGroup], conditioning: &[Feature]) -> CanonicalKey {
    let mut c = conditioning.to_vec();
    c.sort();
    CanonicalKey {
        groups: sort_groups(groups, false),
        conditioning: c,
    }
}

/// True iff the caller-supplied group order differs from canonical order, in
/// which case the per-group fields of a cached result must be swapped before
/// it is returned.
pub fn needs_relabel(groups: &[FeatureGroup]) -> bool {
    sort_groups(groups, true) != sort_groups(groups, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g(fs: &[&str]) -> FeatureGroup {
        fs.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn canonical_key_is_order_independent() {
        let k1 = canonicalize(&[g(&["b", "a"]), g(&["c"])], &[]);
        let k2 = canonicalize(&[g(&["c"]), g(&["a", "b"])], &[]);
        assert_eq!(k1, k2);
        // Smaller group first, contents sorted.
        assert_eq!(k1.groups, vec![g(&["c"]), g(&["a", "b"])]);
    }

    #[test]
    fn conditioning_set_is_sorted_into_the_key() {
        let k1 = canonicalize(&[g(&["a"]), g(&["b"])], &["z".to_string(), "c".to_string()]);
        let k2 = canonicalize(&[g(&["b"]), g(&["a"])], &["c".to_string(), "z".to_string()]);
        assert_eq!(k1, k2);
        assert_eq!(k1.conditioning, g(&["c", "z"]));
    }

    #[test]
    fn equal_sized_groups_ordered_lexicographically() {
        let k = canonicalize(&[g(&["d", "c"]), g(&["b", "a"])], &[]);
        assert_eq!(k.groups, vec![g(&["a", "b"]), g(&["c", "d"])]);
    }

    #[test]
    fn relabel_detection() {
        // ["b"], ["a"] is not canonical: lexicographic order puts "a" first.
        assert!(needs_relabel(&[g(&["b"]), g(&["a"])]));
        assert!(!needs_relabel(&[g(&["a"]), g(&["b"])]));
        // Larger group supplied first must be swapped regardless of content.
        assert!(needs_relabel(&[g(&["a", "b"]), g(&["z"])]));
        assert!(!needs_relabel(&[g(&["z"]), g(&["a", "b"])]));
    }
}
