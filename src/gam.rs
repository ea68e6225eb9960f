//! # Reference GAM Learner
//!
//! A least-squares additive model satisfying the [`Learner`] contract: each
//! main effect is a centered polynomial basis in one feature, each allowed
//! interaction term is the centered product of its (centered) features, and
//! the coefficients come from ridge-stabilized normal equations solved with
//! `ndarray-linalg`. The ridge is small and fixed; it exists to keep the
//! Gram matrix invertible, not to smooth.
//!
//! Because every term owns a contiguous block of design columns, the summed
//! contribution of any term subset (`predict_components`) is exact rather
//! than approximated, which is what the decomposition engine's component
//! orthogonalization step relies on.

use crate::data::{Feature, FeatureMatrix};
use crate::learner::{FitError, Learner, LearnerFactory};
use crate::terms::{self, Term};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Solve;
use std::collections::HashSet;
use std::ops::Range;

/// Shape-only configuration for the reference learner.
#[derive(Debug, Clone, Copy)]
pub struct PolyGamConfig {
    /// Polynomial degree of each main-effect basis.
    pub degree: usize,
    /// Ridge added to the Gram diagonal, scaled by the sample count.
    pub ridge: f64,
}

impl Default for PolyGamConfig {
    fn default() -> Self {
        Self {
            degree: 3,
            ridge: 1e-8,
        }
    }
}

/// One fitted term and the design columns it owns.
#[derive(Debug, Clone)]
struct TermBlock {
    term: Term,
    cols: Range<usize>,
}

#[derive(Debug, Clone)]
struct FittedState {
    names: Vec<Feature>,
    feature_means: Vec<f64>,
    blocks: Vec<TermBlock>,
    col_means: Array1<f64>,
    beta: Array1<f64>,
    y_mean: f64,
}

/// The reference polynomial GAM.
pub struct PolyGam {
    config: PolyGamConfig,
    order: usize,
    exclude: Option<HashSet<Term>>,
    fitted: Option<FittedState>,
}

impl PolyGam {
    pub fn new(config: PolyGamConfig, order: usize, exclude: Option<HashSet<Term>>) -> Self {
        Self {
            config,
            order,
            exclude,
            fitted: None,
        }
    }

    /// Lays out one block per main effect and one per allowed interaction.
    fn layout(&self, names: &[Feature]) -> Vec<TermBlock> {
        let mut blocks = Vec::new();
        let mut next = 0usize;
        for name in names {
            blocks.push(TermBlock {
                term: vec![name.clone()],
                cols: next..next + self.config.degree,
            });
            next += self.config.degree;
        }
        let interactions = match &self.exclude {
            Some(excluded) => terms::enumerate_terms_excluding(names, self.order, excluded),
            None => terms::enumerate_terms(names, self.order),
        };
        for t in interactions {
            blocks.push(TermBlock {
                term: t,
                cols: next..next + 1,
            });
            next += 1;
        }
        blocks
    }

    /// Builds the (uncentered) design matrix for `x` under a fixed layout and
    /// set of per-feature centers.
    fn build_design(
        x: &FeatureMatrix,
        names: &[Feature],
        feature_means: &[f64],
        blocks: &[TermBlock],
    ) -> Result<Array2<f64>, FitError> {
        let n = x.n_rows();
        let width = blocks.last().map_or(0, |b| b.cols.end);
        let mut design = Array2::zeros((n, width));

        // Centered columns for every feature the layout mentions.
        let mut centered: Vec<Array1<f64>> = Vec::with_capacity(names.len());
        for (name, &mean) in names.iter().zip(feature_means) {
            centered.push(x.column(name)?.mapv(|v| v - mean));
        }
        let index_of = |f: &Feature| {
            names
                .iter()
                .position(|n| n == f)
                .ok_or_else(|| crate::data::DataError::ColumnNotFound(f.clone()))
        };

        for block in blocks {
            if block.term.len() == 1 {
                let col = centered[index_of(&block.term[0])?].view();
                for (p, j) in block.cols.clone().enumerate() {
                    let power = (p + 1) as i32;
                    design
                        .column_mut(j)
                        .assign(&col.mapv(|v| v.powi(power)));
                }
            } else {
                let mut prod = Array1::ones(n);
                for f in &block.term {
                    prod = &prod * &centered[index_of(f)?];
                }
                design.column_mut(block.cols.start).assign(&prod);
            }
        }
        Ok(design)
    }
}

impl Learner for PolyGam {
    fn fit(&mut self, x: &FeatureMatrix, y: ArrayView1<'_, f64>) -> Result<(), FitError> {
        let n = x.n_rows();
        if n != y.len() {
            return Err(FitError::ShapeMismatch {
                x_rows: n,
                y_rows: y.len(),
            });
        }

        let names = x.names().to_vec();
        let feature_means: Vec<f64> = names
            .iter()
            .map(|f| x.column(f).map(|c| c.mean().unwrap_or(0.0)))
            .collect::<Result<_, _>>()?;
        let blocks = self.layout(&names);

        let mut design = Self::build_design(x, &names, &feature_means, &blocks)?;
        let col_means: Array1<f64> = design
            .columns()
            .into_iter()
            .map(|c| c.mean().unwrap_or(0.0))
            .collect();
        for (mut col, &m) in design.columns_mut().into_iter().zip(col_means.iter()) {
            col.mapv_inplace(|v| v - m);
        }

        let y_mean = y.mean().unwrap_or(0.0);
        let y_centered = y.mapv(|v| v - y_mean);

        let width = design.ncols();
        let beta = if width == 0 {
            Array1::zeros(0)
        } else {
            let mut gram = design.t().dot(&design);
            let ridge = self.config.ridge * n as f64;
            for j in 0..width {
                gram[[j, j]] += ridge;
            }
            let rhs = design.t().dot(&y_centered);
            gram.solve_into(rhs)?
        };

        self.fitted = Some(FittedState {
            names,
            feature_means,
            blocks,
            col_means,
            beta,
            y_mean,
        });
        Ok(())
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Array1<f64>, FitError> {
        let state = self.fitted.as_ref().ok_or(FitError::NotFitted)?;
        let design =
            Self::build_design(x, &state.names, &state.feature_means, &state.blocks)?;
        let centered = &design - &state.col_means;
        Ok(centered.dot(&state.beta) + state.y_mean)
    }

    fn predict_components(
        &self,
        x: &FeatureMatrix,
        requested: &[Term],
    ) -> Result<Array1<f64>, FitError> {
        let state = self.fitted.as_ref().ok_or(FitError::NotFitted)?;
        let design =
            Self::build_design(x, &state.names, &state.feature_means, &state.blocks)?;

        let wanted: HashSet<Term> = requested.iter().map(|t| terms::term(t)).collect();
        let mut total = Array1::zeros(x.n_rows());
        for block in &state.blocks {
            if !wanted.contains(&block.term) {
                continue;
            }
            for j in block.cols.clone() {
                let centered = design.column(j).mapv(|v| v - state.col_means[j]);
                total = total + centered * state.beta[j];
            }
        }
        Ok(total)
    }
}

/// Factory for [`PolyGam`] instances sharing one configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolyGamFactory {
    pub config: PolyGamConfig,
}

impl LearnerFactory for PolyGamFactory {
    fn build(&self, order: usize, exclude: Option<HashSet<Term>>) -> Box<dyn Learner> {
        Box::new(PolyGam::new(self.config, order, exclude))
    }
}
