//! # Decomposition Engine
//!
//! Orchestrates the five-model variance decomposition. The engine owns one
//! train/evaluation split and two memoizing caches:
//!
//! 1. **Model cache** — fitted learners keyed by (interaction order,
//!    canonical combination, conditioning set). Memoization here is a
//!    correctness requirement, not an optimization: every call site must
//!    observe the *same* fitted function for a given key, otherwise the
//!    variance comparisons between nested models are meaningless.
//! 2. **Decomposition cache** — finished six-quantity results keyed by
//!    canonical combination plus conditioning set, relabeled on the way out
//!    when a caller supplies the groups in the non-canonical order.
//!
//! Both caches are split-dependent; `new_split` replaces the partitions and
//! clears them together. Execution is strictly sequential within one engine
//! instance, so no locking is involved, and the type is not meant to be
//! shared across threads.

use crate::combination::{
    CanonicalKey, FeatureGroup, GroupSpec, canonicalize, needs_relabel, sort_groups,
};
use crate::data::{DataError, Dataset, Feature, Split, split_rng};
use crate::learner::{FitError, Learner, LearnerFactory};
use crate::terms::{Term, enumerate_terms, enumerate_terms_excluding, excluded_terms};
use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;

/// Interaction order used by the query layer; `compute` accepts any order.
pub const DEFAULT_ORDER: usize = 2;

/// Errors raised by the decomposition engine and its query layer.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Expected exactly two feature groups, got {0}.")]
    InvalidCombination(usize),
    #[error("Feature '{0}' is not a column of the dataset.")]
    UnknownFeature(String),
    #[error("Feature '{0}' appears in more than one of the groups/conditioning set.")]
    Overlap(String),
    #[error("Model fit failed: {0}")]
    ModelFit(#[from] FitError),
    #[error("The evaluation target has (near) zero variance; the decomposition is undefined.")]
    DegenerateTarget,
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Failed to write results: {0}")]
    Output(#[from] csv::Error),
}

/// The six-quantity decomposition returned for one combination, each field a
/// proportion of total evaluation-target variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    /// Variance explained by the first group alone (given the conditioning set).
    pub var_g1: f64,
    /// Variance explained by the second group alone (given the conditioning set).
    pub var_g2: f64,
    /// Variance already explained by the conditioning set.
    pub var_gc: f64,
    /// Additive collaboration, covariance-adjusted.
    pub additive_collab_explv: f64,
    /// The covariance term itself, reported as -2*cov(g1, g2).
    pub additive_collab_cov: f64,
    /// Variance explained by cross-group interactions.
    pub interactive_collab: f64,
}

impl Decomposition {
    pub const FIELD_NAMES: [&'static str; 6] = [
        "var_g1",
        "var_g2",
        "var_gc",
        "additive_collab_explv",
        "additive_collab_cov",
        "interactive_collab",
    ];

    /// The result relabeled for the opposite group order. Only the per-group
    /// attributions move; the collaboration and covariance terms are
    /// symmetric in the two groups by construction.
    pub fn swapped(&self) -> Self {
        Self {
            var_g1: self.var_g2,
            var_g2: self.var_g1,
            ..*self
        }
    }

    pub fn values(&self) -> [f64; 6] {
        [
            self.var_g1,
            self.var_g2,
            self.var_gc,
            self.additive_collab_explv,
            self.additive_collab_cov,
            self.interactive_collab,
        ]
    }

    /// Sum of all six fields: the total explained-variance attribution of
    /// the combination.
    pub fn total(&self) -> f64 {
        self.values().iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModelKey {
    order: usize,
    key: CanonicalKey,
}

/// The engine. Owns the dataset, the split, the learner factory and both
/// caches.
pub struct CollabExplainer {
    dataset: Dataset,
    test_size: f64,
    rng: StdRng,
    split: Split,
    factory: Box<dyn LearnerFactory>,
    models: HashMap<ModelKey, Rc<dyn Learner>>,
    decomps: HashMap<CanonicalKey, Decomposition>,
}

impl CollabExplainer {
    /// Splits the dataset once and readies empty caches. `seed` fixes the
    /// shuffle for reproducible experiments.
    pub fn new(
        dataset: Dataset,
        factory: Box<dyn LearnerFactory>,
        test_size: f64,
        seed: Option<u64>,
    ) -> Result<Self, DataError> {
        let mut rng = split_rng(seed);
        let split = dataset.split(test_size, &mut rng)?;
        Ok(Self {
            dataset,
            test_size,
            rng,
            split,
            factory,
            models: HashMap::new(),
            decomps: HashMap::new(),
        })
    }

    /// Draws a fresh train/evaluation partition and clears both caches as one
    /// transactional invalidation. Fitted models are partition-specific, so
    /// keeping them across a resplit would be a correctness bug.
    pub fn new_split(&mut self, test_size: Option<f64>) -> Result<(), DataError> {
        if let Some(ts) = test_size {
            self.test_size = ts;
        }
        self.split = self.dataset.split(self.test_size, &mut self.rng)?;
        self.models.clear();
        self.decomps.clear();
        log::info!(
            "Resplit dataset (test_size {}); model and decomposition caches cleared",
            self.test_size
        );
        Ok(())
    }

    pub fn feature_names(&self) -> &[Feature] {
        self.dataset.feature_names()
    }

    pub fn target_name(&self) -> &str {
        self.dataset.target_name()
    }

    /// Canonical keys of every decomposition computed so far.
    pub fn cached_combinations(&self) -> Vec<CanonicalKey> {
        self.decomps.keys().cloned().collect()
    }

    /// Validates a combination: exactly two groups, every feature a dataset
    /// column, groups mutually disjoint and disjoint from the conditioning
    /// set. Returns the two groups in caller order.
    fn validate(
        &self,
        groups: &[FeatureGroup],
        c: &[Feature],
    ) -> Result<(FeatureGroup, FeatureGroup), CollabError> {
        if groups.len() != 2 {
            return Err(CollabError::InvalidCombination(groups.len()));
        }
        for f in groups.iter().flatten().chain(c.iter()) {
            if !self.dataset.feature_names().contains(f) {
                return Err(CollabError::UnknownFeature(f.clone()));
            }
        }
        let first: HashSet<&Feature> = groups[0].iter().collect();
        for f in &groups[1] {
            if first.contains(f) {
                return Err(CollabError::Overlap(f.clone()));
            }
        }
        let both: HashSet<&Feature> = groups[0].iter().chain(groups[1].iter()).collect();
        for f in c {
            if both.contains(f) {
                return Err(CollabError::Overlap(f.clone()));
            }
        }
        Ok((groups[0].clone(), groups[1].clone()))
    }

    /// Fetches or fits the model for a set of groups at a given order,
    /// conditioned on `c`. With a non-empty conditioning set the model for
    /// `c` alone is obtained first (recursively, through this same cache) and
    /// its training-set prediction regressed out of the target, so the
    /// requested model explains only what `c` does not. More than one group
    /// means cross-group interaction terms are excluded from the fit.
    ///
    /// Failed fits propagate and are never cached, so a later request for
    /// the same key retries.
    fn get_model(
        &mut self,
        groups: &[FeatureGroup],
        order: usize,
        c: &[Feature],
    ) -> Result<Rc<dyn Learner>, CollabError> {
        let key = ModelKey {
            order,
            key: canonicalize(groups, c),
        };
        if let Some(model) = self.models.get(&key) {
            log::debug!("Using precomputed model for {:?}", key.key.groups);
            return Ok(Rc::clone(model));
        }
        log::debug!(
            "Fitting model for {:?} | C = {:?}",
            key.key.groups,
            key.key.conditioning
        );

        let c_sorted = key.key.conditioning.clone();
        let y_res: Array1<f64> = if c_sorted.is_empty() {
            self.split.y_train.clone()
        } else {
            let cond = self.get_model(&[c_sorted.clone()], order, &[])?;
            let pred = cond.predict(&self.split.x_train.select(&c_sorted)?)?;
            &self.split.y_train - &pred
        };

        let exclude = if key.key.groups.len() > 1 {
            Some(excluded_terms(&key.key.groups, order, &c_sorted))
        } else {
            None
        };
        let fs_full: Vec<Feature> = key
            .key
            .groups
            .iter()
            .flatten()
            .chain(c_sorted.iter())
            .cloned()
            .collect();

        let mut learner = self.factory.build(order, exclude);
        let start = Instant::now();
        learner.fit(&self.split.x_train.select(&fs_full)?, y_res.view())?;
        log::info!(
            "Fitting model for {:?} took {:.3?}",
            key.key.groups,
            start.elapsed()
        );

        let learner: Rc<dyn Learner> = Rc::from(learner);
        self.models.insert(key, Rc::clone(&learner));
        Ok(learner)
    }

    /// Query entry point: validate, canonicalize, serve from the result cache
    /// (relabeling when the caller's group order is not canonical), or
    /// compute and store. Uses interaction order [`DEFAULT_ORDER`].
    pub fn get(&mut self, comb: &[GroupSpec], c: &[Feature]) -> Result<Decomposition, CollabError> {
        let groups: Vec<FeatureGroup> = comb.iter().map(GroupSpec::features).collect();
        self.validate(&groups, c)?;

        let key = canonicalize(&groups, c);
        if let Some(res) = self.decomps.get(&key) {
            return Ok(if needs_relabel(&groups) {
                res.swapped()
            } else {
                *res
            });
        }

        let canonical = sort_groups(&groups, false);
        let res = self.compute(&canonical, DEFAULT_ORDER, c)?;
        self.decomps.insert(key, res);
        Ok(res)
    }

    /// Computes the decomposition for a validated combination, conditional on
    /// `c`, using GAMs of at most order `order`.
    ///
    /// Five models are involved: the baseline (conditioning set alone), the
    /// full model over the union, the grouped model (cross-group interactions
    /// excluded), and one model per group. Explained variances are measured
    /// R²-style on the evaluation partition against the conditioning
    /// residual, the grouped model's additive components are extracted and
    /// (when `c` is non-empty) orthogonalized against the conditioning set,
    /// and everything is rescaled to proportions of total target variance.
    pub fn compute(
        &mut self,
        groups: &[FeatureGroup],
        order: usize,
        c: &[Feature],
    ) -> Result<Decomposition, CollabError> {
        let (g1, g2) = self.validate(groups, c)?;
        let mut c_sorted = c.to_vec();
        c_sorted.sort();
        let c = c_sorted;

        let var_y = variance(self.split.y_test.view());
        if var_y <= f64::EPSILON {
            return Err(CollabError::DegenerateTarget);
        }

        let fs: Vec<Feature> = g1.iter().chain(g2.iter()).cloned().collect();
        let fs_full: Vec<Feature> = fs.iter().chain(c.iter()).cloned().collect();
        let fs_0: Vec<Feature> = g1.iter().chain(c.iter()).cloned().collect();
        let fs_1: Vec<Feature> = g2.iter().chain(c.iter()).cloned().collect();

        // Baseline: what the conditioning set already explains.
        let (y_test_res, baseline_pred) = if c.is_empty() {
            (self.split.y_test.clone(), None)
        } else {
            let baseline = self.get_model(&[c.clone()], order, &[])?;
            let pred = baseline.predict(&self.split.x_test.select(&c)?)?;
            (&self.split.y_test - &pred, Some(pred))
        };
        let var_y_res = variance(y_test_res.view());
        if var_y_res <= f64::EPSILON {
            return Err(CollabError::DegenerateTarget);
        }
        let mut var_fc = baseline_pred
            .as_ref()
            .map_or(0.0, |p| variance(p.view()) / var_y_res);

        // Full model: groups may interact freely within the order bound.
        let model_full = self.get_model(&[fs.clone()], order, &c)?;
        let var_total = r2_score(
            y_test_res.view(),
            model_full
                .predict(&self.split.x_test.select(&fs_full)?)?
                .view(),
        );

        // Grouped model: cross-group interactions excluded.
        let grouped = self.get_model(&[g1.clone(), g2.clone()], order, &c)?;
        let var_gam = r2_score(
            y_test_res.view(),
            grouped
                .predict(&self.split.x_test.select(&fs_full)?)?
                .view(),
        );

        // Per-group models.
        let model_1 = self.get_model(&[g1.clone()], order, &c)?;
        let mut var_f1 = r2_score(
            y_test_res.view(),
            model_1.predict(&self.split.x_test.select(&fs_0)?)?.view(),
        );
        let model_2 = self.get_model(&[g2.clone()], order, &c)?;
        let mut var_f2 = r2_score(
            y_test_res.view(),
            model_2.predict(&self.split.x_test.select(&fs_1)?)?.view(),
        );

        // GAM components of the grouped model. A group's component collects
        // everything built purely from the group plus its interactions with
        // the conditioning set, but no pure-C term.
        let mut terms_c: Vec<Term> = enumerate_terms(&c, order);
        terms_c.extend(c.iter().map(|f| vec![f.clone()]));
        let terms_c_set: HashSet<Term> = terms_c.iter().cloned().collect();

        let mut terms_g1 = enumerate_terms_excluding(&fs_0, order, &terms_c_set);
        terms_g1.extend(g1.iter().map(|f| vec![f.clone()]));
        let mut terms_g2 = enumerate_terms_excluding(&fs_1, order, &terms_c_set);
        terms_g2.extend(g2.iter().map(|f| vec![f.clone()]));

        let g1_test = grouped.predict_components(&self.split.x_test, &terms_g1)?;
        let g2_test = grouped.predict_components(&self.split.x_test, &terms_g2)?;

        // With a non-empty conditioning set the components are not unique:
        // any variation attributable to C must be projected out, by
        // regressing each component (on the training side) against C.
        let (g1_res, g2_res) = if c.is_empty() {
            (g1_test.clone(), g2_test.clone())
        } else {
            let g1_train = grouped.predict_components(&self.split.x_train, &terms_g1)?;
            let g2_train = grouped.predict_components(&self.split.x_train, &terms_g2)?;
            let x_train_c = self.split.x_train.select(&c)?;
            let x_test_c = self.split.x_test.select(&c)?;

            let mut aux_1 = self.factory.build(order, None);
            aux_1.fit(&x_train_c, g1_train.view())?;
            let g1_pred = aux_1.predict(&x_test_c)?;
            let mut aux_2 = self.factory.build(order, None);
            aux_2.fit(&x_train_c, g2_train.view())?;
            let g2_pred = aux_2.predict(&x_test_c)?;

            let gc_test = grouped.predict_components(&self.split.x_test, &terms_c)?;
            let shared = variance((&(&g1_pred + &g2_pred) + &gc_test).view())
                / variance((&(&g1_test + &g2_test) + &gc_test).view());
            log::debug!(
                "Variance of GAM components explained by the conditioning set: {shared:.4}"
            );

            (&g1_test - &g1_pred, &g2_test - &g2_pred)
        };

        let mut cov_g1_g2 = covariance(g1_res.view(), g2_res.view()) / var_y_res;
        let additive_collab = -(var_f1 + var_f2 - var_gam);
        let mut additive_collab_wo_cov = additive_collab + 2.0 * cov_g1_g2;
        let mut interactive_collab = var_total - var_gam;

        // Rescale from "proportion of residual-after-C variance" to
        // "proportion of total target variance", so results at different
        // conditioning sets are comparable on a common scale.
        let factor = var_y_res / var_y;
        var_f1 *= factor;
        var_f2 *= factor;
        var_fc *= factor;
        additive_collab_wo_cov *= factor;
        cov_g1_g2 *= factor;
        interactive_collab *= factor;

        Ok(Decomposition {
            var_g1: var_f1,
            var_g2: var_f2,
            var_gc: var_fc,
            additive_collab_explv: additive_collab_wo_cov,
            additive_collab_cov: -2.0 * cov_g1_g2,
            interactive_collab,
        })
    }
}

/// Population variance, the convention used for every variance ratio here.
fn variance(v: ArrayView1<'_, f64>) -> f64 {
    let n = v.len();
    if n == 0 {
        return 0.0;
    }
    let mean = v.mean().unwrap_or(0.0);
    v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64
}

/// Sample covariance (n - 1 denominator).
fn covariance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let n = a.len();
    if n < 2 || b.len() != n {
        return 0.0;
    }
    let ma = a.mean().unwrap_or(0.0);
    let mb = b.mean().unwrap_or(0.0);
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - ma) * (y - mb))
        .sum::<f64>()
        / (n - 1) as f64
}

/// Coefficient of determination of `pred` against `truth`.
fn r2_score(truth: ArrayView1<'_, f64>, pred: ArrayView1<'_, f64>) -> f64 {
    let mean = truth.mean().unwrap_or(0.0);
    let ss_tot: f64 = truth.iter().map(|&y| (y - mean).powi(2)).sum();
    let ss_res: f64 = truth
        .iter()
        .zip(pred.iter())
        .map(|(&y, &p)| (y - p).powi(2))
        .sum();
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureMatrix;
    use crate::gam::PolyGamFactory;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn synthetic(n: usize, seed: u64) -> Dataset {
        // y = x1 + x2 + x3, all standard normal.
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut values = Array2::zeros((n, 3));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let (a, b, c): (f64, f64, f64) = (
                normal.sample(&mut rng),
                normal.sample(&mut rng),
                normal.sample(&mut rng),
            );
            values[[i, 0]] = a;
            values[[i, 1]] = b;
            values[[i, 2]] = c;
            y[i] = a + b + c;
        }
        let names = vec!["x1".to_string(), "x2".to_string(), "x3".to_string()];
        Dataset::new(FeatureMatrix::new(names, values).unwrap(), "y", y).unwrap()
    }

    fn explainer(n: usize, seed: u64) -> CollabExplainer {
        CollabExplainer::new(
            synthetic(n, seed),
            Box::new(PolyGamFactory::default()),
            0.25,
            Some(seed),
        )
        .unwrap()
    }

    #[test]
    fn wrong_arity_rejected() {
        let mut ex = explainer(200, 1);
        let err = ex.get(&["x1".into()], &[]).unwrap_err();
        assert!(matches!(err, CollabError::InvalidCombination(1)));
        let err = ex
            .get(&["x1".into(), "x2".into(), "x3".into()], &[])
            .unwrap_err();
        assert!(matches!(err, CollabError::InvalidCombination(3)));
    }

    #[test]
    fn unknown_feature_rejected() {
        let mut ex = explainer(200, 2);
        let err = ex.get(&["x1".into(), "nope".into()], &[]).unwrap_err();
        match err {
            CollabError::UnknownFeature(f) => assert_eq!(f, "nope"),
            other => panic!("Expected UnknownFeature, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_groups_rejected() {
        let mut ex = explainer(200, 3);
        let err = ex
            .get(
                &[vec!["x1", "x2"].into(), vec!["x2", "x3"].into()],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, CollabError::Overlap(f) if f == "x2"));
    }

    #[test]
    fn conditioning_overlap_rejected() {
        let mut ex = explainer(200, 4);
        let err = ex
            .get(&["x1".into(), "x2".into()], &["x2".to_string()])
            .unwrap_err();
        assert!(matches!(err, CollabError::Overlap(f) if f == "x2"));
    }

    #[test]
    fn degenerate_target_rejected() {
        let names = vec!["x1".to_string(), "x2".to_string()];
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = 40;
        let mut values = Array2::zeros((n, 2));
        for i in 0..n {
            values[[i, 0]] = normal.sample(&mut rng);
            values[[i, 1]] = normal.sample(&mut rng);
        }
        let y = Array1::from_elem(n, 3.5);
        let ds = Dataset::new(FeatureMatrix::new(names, values).unwrap(), "y", y).unwrap();
        let mut ex =
            CollabExplainer::new(ds, Box::new(PolyGamFactory::default()), 0.25, Some(5)).unwrap();
        let err = ex.get(&["x1".into(), "x2".into()], &[]).unwrap_err();
        assert!(matches!(err, CollabError::DegenerateTarget));
    }

    #[test]
    fn single_feature_shorthand_matches_group_form() {
        let mut ex = explainer(400, 6);
        let a = ex.get(&["x1".into(), "x2".into()], &[]).unwrap();
        let b = ex
            .get(&[vec!["x1"].into(), vec!["x2"].into()], &[])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn swapped_query_relabels_only_the_group_fields() {
        let mut ex = explainer(400, 7);
        let ab = ex.get(&["x1".into(), "x2".into()], &[]).unwrap();
        let ba = ex.get(&["x2".into(), "x1".into()], &[]).unwrap();
        assert_abs_diff_eq!(ab.var_g1, ba.var_g2, epsilon = 1e-12);
        assert_abs_diff_eq!(ab.var_g2, ba.var_g1, epsilon = 1e-12);
        assert_abs_diff_eq!(ab.var_gc, ba.var_gc, epsilon = 1e-12);
        assert_abs_diff_eq!(
            ab.additive_collab_explv,
            ba.additive_collab_explv,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            ab.additive_collab_cov,
            ba.additive_collab_cov,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(ab.interactive_collab, ba.interactive_collab, epsilon = 1e-12);
    }

    #[test]
    fn new_split_clears_the_caches() {
        let mut ex = explainer(400, 8);
        ex.get(&["x1".into(), "x2".into()], &[]).unwrap();
        assert_eq!(ex.cached_combinations().len(), 1);
        assert!(!ex.models.is_empty());
        ex.new_split(None).unwrap();
        assert!(ex.cached_combinations().is_empty());
        assert!(ex.models.is_empty());
    }

    #[test]
    fn stats_helpers_match_reference_values() {
        let v = array![1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(variance(v.view()), 1.25, epsilon = 1e-12);
        let a = array![1.0, 2.0, 3.0];
        let b = array![2.0, 4.0, 6.0];
        assert_abs_diff_eq!(covariance(a.view(), b.view()), 2.0, epsilon = 1e-12);
        let perfect = r2_score(a.view(), a.view());
        assert_abs_diff_eq!(perfect, 1.0, epsilon = 1e-12);
        let mean_pred = array![2.0, 2.0, 2.0];
        assert_abs_diff_eq!(r2_score(a.view(), mean_pred.view()), 0.0, epsilon = 1e-12);
    }
}
