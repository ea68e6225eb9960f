//! # Aggregation Layer
//!
//! Drives the query layer over whole families of combinations: every
//! unordered feature pair (as a long table or as symmetric matrices), every
//! feature against the rest, and pairs-vs-rest conditioned on everything
//! else. Also owns CSV persistence of the pairwise results table. Thin
//! orchestration over [`CollabExplainer::get`]; all the statistics live in
//! the engine.

use crate::combination::GroupSpec;
use crate::data::Feature;
use crate::engine::{CollabError, CollabExplainer, Decomposition};
use indicatif::ProgressBar;
use itertools::Itertools;
use ndarray::Array2;
use std::path::Path;

/// One ordered feature pair and its decomposition.
#[derive(Debug, Clone)]
pub struct PairwiseRow {
    pub feature1: Feature,
    pub feature2: Feature,
    pub result: Decomposition,
}

/// Row-per-ordered-combination results table.
#[derive(Debug, Clone, Default)]
pub struct PairwiseTable {
    pub rows: Vec<PairwiseRow>,
}

impl PairwiseTable {
    /// Writes the table as delimited text: one header row, one row per
    /// ordered combination.
    pub fn save(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["feature1".to_string(), "feature2".to_string()];
        header.extend(Decomposition::FIELD_NAMES.iter().map(|s| s.to_string()));
        writer.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![row.feature1.clone(), row.feature2.clone()];
            record.extend(row.result.values().iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Row-per-feature results table (one-vs-rest, pairs-vs-rest).
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    pub rows: Vec<(Feature, Decomposition)>,
}

/// The all-pairwise decomposition reshaped into symmetric feature-by-feature
/// matrices. Cells for pairs that were never computed hold NaN; the diagonal
/// of `bivariate_variance` holds per-feature explained variance.
#[derive(Debug, Clone)]
pub struct PairwiseMatrices {
    pub features: Vec<Feature>,
    pub bivariate_variance: Array2<f64>,
    pub additive_collab: Array2<f64>,
    pub additive_collab_wo_cov: Array2<f64>,
    pub neg2_cov: Array2<f64>,
    pub interactive_collab: Array2<f64>,
}

impl CollabExplainer {
    /// Decomposes every unordered feature pair (or only the already-cached
    /// ones) and returns a long table containing both orders of each pair.
    /// The reversed row is a relabeled cache hit, never a second computation.
    pub fn get_all_pairwise(&mut self, only_precomputed: bool) -> Result<PairwiseTable, CollabError> {
        let combinations: Vec<(Feature, Feature)> = if only_precomputed {
            // Only singleton pairs with no conditioning fit the row-per-pair
            // shape of this table; grouped or conditioned entries are skipped.
            self.cached_combinations()
                .into_iter()
                .filter(|k| {
                    k.conditioning.is_empty()
                        && k.groups.len() == 2
                        && k.groups.iter().all(|g| g.len() == 1)
                })
                .map(|k| (k.groups[0][0].clone(), k.groups[1][0].clone()))
                .collect()
        } else {
            self.feature_names()
                .iter()
                .cloned()
                .tuple_combinations()
                .collect()
        };

        log::info!("Computing decompositions for {} feature pairs", combinations.len());
        let progress = ProgressBar::new(combinations.len() as u64);
        let mut table = PairwiseTable::default();
        for (f1, f2) in combinations {
            let forward = self.get(&[f1.clone().into(), f2.clone().into()], &[])?;
            table.rows.push(PairwiseRow {
                feature1: f1.clone(),
                feature2: f2.clone(),
                result: forward,
            });
            let reverse = self.get(&[f2.clone().into(), f1.clone().into()], &[])?;
            table.rows.push(PairwiseRow {
                feature1: f2,
                feature2: f1,
                result: reverse,
            });
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(table)
    }

    /// All-pairwise decomposition as symmetric matrices.
    pub fn get_all_pairwise_matrices(&mut self) -> Result<PairwiseMatrices, CollabError> {
        let features = self.feature_names().to_vec();
        let n = features.len();
        let nan = Array2::from_elem((n, n), f64::NAN);
        let mut out = PairwiseMatrices {
            features: features.clone(),
            bivariate_variance: nan.clone(),
            additive_collab: nan.clone(),
            additive_collab_wo_cov: nan.clone(),
            neg2_cov: nan.clone(),
            interactive_collab: nan,
        };
        if n < 2 {
            return Ok(out);
        }

        let progress = ProgressBar::new((n * (n - 1) / 2) as u64);
        for i in 0..n {
            for j in (i + 1)..n {
                let res = self.get(
                    &[features[i].clone().into(), features[j].clone().into()],
                    &[],
                )?;
                out.bivariate_variance[[i, i]] = res.var_g1;
                out.bivariate_variance[[j, j]] = res.var_g2;
                for (m, value) in [
                    (&mut out.bivariate_variance, res.total()),
                    (
                        &mut out.additive_collab,
                        res.additive_collab_explv + res.additive_collab_cov,
                    ),
                    (&mut out.additive_collab_wo_cov, res.additive_collab_explv),
                    (&mut out.neg2_cov, res.additive_collab_cov),
                    (&mut out.interactive_collab, res.interactive_collab),
                ] {
                    m[[i, j]] = value;
                    m[[j, i]] = value;
                }
                progress.inc(1);
            }
        }
        progress.finish_and_clear();
        Ok(out)
    }

    /// All pairs containing `feature`, both orders; the reversed rows are
    /// label swaps of the forward results.
    pub fn get_pairwise_onefixed(&mut self, feature: &str) -> Result<PairwiseTable, CollabError> {
        let others: Vec<Feature> = self
            .feature_names()
            .iter()
            .filter(|f| f.as_str() != feature)
            .cloned()
            .collect();
        log::info!("Computing all pairwise decompositions for feature {feature}");

        let mut table = PairwiseTable::default();
        let progress = ProgressBar::new(others.len() as u64);
        for other in others {
            let res = self.get(&[feature.into(), other.clone().into()], &[])?;
            table.rows.push(PairwiseRow {
                feature1: feature.to_string(),
                feature2: other.clone(),
                result: res,
            });
            table.rows.push(PairwiseRow {
                feature1: other,
                feature2: feature.to_string(),
                result: res.swapped(),
            });
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(table)
    }

    /// Decomposition of one feature against all remaining features as a
    /// single group.
    pub fn get_one_vs_rest(&mut self, feature: &str) -> Result<Decomposition, CollabError> {
        let rest: Vec<Feature> = self
            .feature_names()
            .iter()
            .filter(|f| f.as_str() != feature)
            .cloned()
            .collect();
        self.get(&[feature.into(), GroupSpec::Group(rest)], &[])
    }

    /// One-vs-rest decomposition for every feature.
    pub fn get_all_one_vs_rest(&mut self) -> Result<FeatureTable, CollabError> {
        let features = self.feature_names().to_vec();
        let progress = ProgressBar::new(features.len() as u64);
        let mut table = FeatureTable::default();
        for feature in features {
            let res = self.get_one_vs_rest(&feature)?;
            table.rows.push((feature, res));
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(table)
    }

    /// For a fixed feature, decomposes ({fixed}, {j}) for every other feature
    /// j, conditioning on everything else.
    pub fn get_pairs_vs_rest(&mut self, fixed: &str) -> Result<FeatureTable, CollabError> {
        let rest: Vec<Feature> = self
            .feature_names()
            .iter()
            .filter(|f| f.as_str() != fixed)
            .cloned()
            .collect();
        let progress = ProgressBar::new(rest.len() as u64);
        let mut table = FeatureTable::default();
        for feature in &rest {
            let conditioning: Vec<Feature> =
                rest.iter().filter(|f| *f != feature).cloned().collect();
            let res = self.get(
                &[fixed.into(), feature.clone().into()],
                &conditioning,
            )?;
            table.rows.push((feature.clone(), res));
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(table)
    }

    /// Persists every already-computed pairwise decomposition as delimited
    /// text.
    pub fn save(&mut self, path: &Path) -> Result<(), CollabError> {
        let table = self.get_all_pairwise(true)?;
        table.save(path).map_err(CollabError::from)?;
        log::info!("Wrote {} result rows to '{}'", table.rows.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, FeatureMatrix};
    use crate::gam::PolyGamFactory;
    use ndarray::{Array1, Array2};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};
    use tempfile::NamedTempFile;

    fn explainer(n: usize, seed: u64) -> CollabExplainer {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut values = Array2::zeros((n, 3));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            for j in 0..3 {
                values[[i, j]] = normal.sample(&mut rng);
            }
            y[i] = values[[i, 0]] + 0.5 * values[[i, 1]] + 0.1 * normal.sample(&mut rng);
        }
        let names = vec!["x1".to_string(), "x2".to_string(), "x3".to_string()];
        let ds = Dataset::new(FeatureMatrix::new(names, values).unwrap(), "y", y).unwrap();
        CollabExplainer::new(ds, Box::new(PolyGamFactory::default()), 0.25, Some(seed)).unwrap()
    }

    #[test]
    fn pairwise_table_contains_both_orders_of_every_pair() {
        let mut ex = explainer(300, 21);
        let table = ex.get_all_pairwise(false).unwrap();
        assert_eq!(table.rows.len(), 6);
        let has = |a: &str, b: &str| {
            table
                .rows
                .iter()
                .any(|r| r.feature1 == a && r.feature2 == b)
        };
        for (a, b) in [("x1", "x2"), ("x2", "x1"), ("x1", "x3"), ("x3", "x2")] {
            assert!(has(a, b), "missing row ({a}, {b})");
        }
    }

    #[test]
    fn only_precomputed_reuses_the_cache() {
        let mut ex = explainer(300, 22);
        assert!(ex.get_all_pairwise(true).unwrap().rows.is_empty());
        ex.get(&["x1".into(), "x2".into()], &[]).unwrap();
        let table = ex.get_all_pairwise(true).unwrap();
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn matrices_are_symmetric_with_nan_free_offdiagonal() {
        let mut ex = explainer(300, 23);
        let m = ex.get_all_pairwise_matrices().unwrap();
        for i in 0..3 {
            for j in 0..3 {
                if i == j {
                    continue;
                }
                assert!(m.interactive_collab[[i, j]].is_finite());
                assert_eq!(m.interactive_collab[[i, j]], m.interactive_collab[[j, i]]);
                assert_eq!(m.bivariate_variance[[i, j]], m.bivariate_variance[[j, i]]);
            }
        }
    }

    #[test]
    fn onefixed_reverse_rows_are_label_swaps() {
        let mut ex = explainer(300, 24);
        let table = ex.get_pairwise_onefixed("x1").unwrap();
        assert_eq!(table.rows.len(), 4);
        let forward = &table.rows[0];
        let reverse = &table.rows[1];
        assert_eq!(forward.result.var_g1, reverse.result.var_g2);
        assert_eq!(forward.result.var_g2, reverse.result.var_g1);
        assert_eq!(
            forward.result.interactive_collab,
            reverse.result.interactive_collab
        );
    }

    #[test]
    fn one_vs_rest_tables_cover_every_feature() {
        let mut ex = explainer(300, 25);
        let table = ex.get_all_one_vs_rest().unwrap();
        assert_eq!(table.rows.len(), 3);
        let features: Vec<&str> = table.rows.iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(features, vec!["x1", "x2", "x3"]);
    }

    #[test]
    fn pairs_vs_rest_conditions_on_the_remainder() {
        let mut ex = explainer(300, 26);
        let table = ex.get_pairs_vs_rest("x1").unwrap();
        assert_eq!(table.rows.len(), 2);
        for (feature, res) in &table.rows {
            assert_ne!(feature, "x1");
            assert!(res.var_g1.is_finite());
        }
    }

    #[test]
    fn save_writes_header_and_one_row_per_ordered_pair() {
        let mut ex = explainer(300, 27);
        ex.get(&["x1".into(), "x3".into()], &[]).unwrap();
        let file = NamedTempFile::new().unwrap();
        ex.save(file.path()).unwrap();

        let text = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "feature1,feature2,var_g1,var_g2,var_gc,additive_collab_explv,additive_collab_cov,interactive_collab"
        );
        assert!(lines[1].starts_with("x1,x3,") || lines[1].starts_with("x3,x1,"));
    }
}
