//! # Term Algebra
//!
//! Enumeration of the interaction terms a GAM of bounded order may contain,
//! and computation of the *excluded* set for a grouped fit: the cross-group
//! interactions a model must not use when the groups are required to
//! contribute independently.
//!
//! Terms are canonical sorted tuples of feature names, so set membership is
//! insensitive to the order features were listed in.

use crate::combination::FeatureGroup;
use crate::data::Feature;
use itertools::Itertools;
use std::collections::HashSet;

/// One additive model term: a sorted tuple of feature names. Length 1 is a
/// main effect, length k a k-way interaction.
pub type Term = Vec<Feature>;

/// Builds the canonical (sorted) form of a term.
pub fn term(features: &[Feature]) -> Term {
    let mut t = features.to_vec();
    t.sort();
    t
}

/// All interaction terms of size 2..=`max_order` over `features`. Main
/// effects (size 1) are implicit in every fit and not enumerated here.
pub fn enumerate_terms(features: &[Feature], max_order: usize) -> Vec<Term> {
    let mut sorted = features.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut terms = Vec::new();
    for d in 2..=max_order {
        for combo in sorted.iter().combinations(d) {
            terms.push(combo.into_iter().cloned().collect::<Term>());
        }
    }
    terms
}

/// Like [`enumerate_terms`] but drops any term present in `exclude`.
pub fn enumerate_terms_excluding(
    features: &[Feature],
    max_order: usize,
    exclude: &HashSet<Term>,
) -> Vec<Term> {
    enumerate_terms(features, max_order)
        .into_iter()
        .filter(|t| !exclude.contains(t))
        .collect()
}

/// Terms that cross group boundaries and are therefore disallowed when
/// fitting a model in which the groups must not interact: all terms over the
/// union of the groups and `c`, minus the terms expressible within any single
/// group joined with `c`.
pub fn excluded_terms(
    groups: &[FeatureGroup],
    max_order: usize,
    c: &[Feature],
) -> HashSet<Term> {
    let mut allowed: HashSet<Term> = HashSet::new();
    for group in groups {
        let mut scope = group.clone();
        scope.extend_from_slice(c);
        allowed.extend(enumerate_terms(&scope, max_order));
    }

    let mut all_features: Vec<Feature> = groups.iter().flatten().cloned().collect();
    all_features.extend_from_slice(c);

    enumerate_terms(&all_features, max_order)
        .into_iter()
        .filter(|t| !allowed.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs(names: &[&str]) -> Vec<Feature> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn enumerates_all_pairs_and_triples() {
        let terms = enumerate_terms(&fs(&["c", "a", "b"]), 3);
        assert_eq!(
            terms,
            vec![
                fs(&["a", "b"]),
                fs(&["a", "c"]),
                fs(&["b", "c"]),
                fs(&["a", "b", "c"]),
            ]
        );
    }

    #[test]
    fn order_one_enumerates_nothing() {
        assert!(enumerate_terms(&fs(&["a", "b"]), 1).is_empty());
    }

    #[test]
    fn excluded_terms_are_exactly_the_cross_group_ones() {
        let groups = vec![fs(&["a", "b"]), fs(&["c"])];
        let excluded = excluded_terms(&groups, 2, &[]);
        // Within-group pair (a,b) is allowed; the two cross pairs are not.
        assert_eq!(
            excluded,
            HashSet::from([fs(&["a", "c"]), fs(&["b", "c"])])
        );
    }

    #[test]
    fn conditioning_features_may_interact_with_every_group() {
        let groups = vec![fs(&["a"]), fs(&["b"])];
        let excluded = excluded_terms(&groups, 2, &fs(&["z"]));
        // (a,z) and (b,z) are allowed; only the cross-group (a,b) is excluded.
        assert_eq!(excluded, HashSet::from([fs(&["a", "b"])]));
    }

    #[test]
    fn higher_order_cross_terms_are_excluded_too() {
        let groups = vec![fs(&["a"]), fs(&["b"])];
        let excluded = excluded_terms(&groups, 3, &fs(&["z"]));
        assert!(excluded.contains(&fs(&["a", "b"])));
        assert!(excluded.contains(&fs(&["a", "b", "z"])));
        assert!(!excluded.contains(&fs(&["a", "z"])));
        assert!(!excluded.contains(&fs(&["b", "z"])));
    }

    #[test]
    fn excluded_term_lookup_ignores_feature_order() {
        let groups = vec![fs(&["b"]), fs(&["a"])];
        let excluded = excluded_terms(&groups, 2, &[]);
        assert!(excluded.contains(&term(&fs(&["b", "a"]))));
    }
}
