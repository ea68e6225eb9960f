//! # Learner Capability Contract
//!
//! The decomposition engine is learner-agnostic: it only requires an additive
//! model that can be fit with a set of interaction terms *excluded*, predict
//! on new rows, and report the summed contribution of a chosen subset of its
//! terms. Anything satisfying [`Learner`] (plus a [`LearnerFactory`] to
//! construct configured instances) plugs in; the crate ships one reference
//! implementation in [`crate::gam`].

use crate::data::{DataError, FeatureMatrix};
use crate::terms::Term;
use ndarray::{Array1, ArrayView1};
use std::collections::HashSet;
use thiserror::Error;

/// Errors surfaced by a learner during fitting or prediction.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Design matrix has {x_rows} rows but the target has {y_rows}.")]
    ShapeMismatch { x_rows: usize, y_rows: usize },
    #[error("The learner was asked to predict before being fit.")]
    NotFitted,
    #[error("A linear system solve failed; the design may be singular: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
    #[error(transparent)]
    Input(#[from] DataError),
}

/// An additive model of bounded interaction order.
///
/// `predict_components` must return the sum of the fitted additive
/// contributions of exactly the given terms, evaluated row-wise on `x`; terms
/// the model never fitted contribute nothing.
pub trait Learner {
    fn fit(&mut self, x: &FeatureMatrix, y: ArrayView1<'_, f64>) -> Result<(), FitError>;
    fn predict(&self, x: &FeatureMatrix) -> Result<Array1<f64>, FitError>;
    fn predict_components(
        &self,
        x: &FeatureMatrix,
        terms: &[Term],
    ) -> Result<Array1<f64>, FitError>;
}

/// Constructs learners configured for a maximum interaction order and an
/// optional set of forbidden interaction terms.
pub trait LearnerFactory {
    fn build(&self, order: usize, exclude: Option<HashSet<Term>>) -> Box<dyn Learner>;
}
