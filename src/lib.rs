//! Vecchia approximation of Gaussian-process covariance matrices.
//!
//! Training points are ordered, each point conditions on at most k earlier nearest neighbours
//! found with segmented cover trees, and the resulting sparse factor `Σ⁻¹ ≈ BᵀD⁻¹B` drives
//! likelihood evaluation, gradients and prediction at new locations.

pub mod algo;
pub mod components;
pub mod config;
pub mod convergence;
pub mod covariance;
pub mod error;
pub mod factor;
pub mod linalg;
pub mod metric;
pub mod predict;
pub mod telemetry;
pub mod tree;

pub use algo::{find_nearest_neighbors, NeighborDistances, NeighborQuery, NeighborSet};
pub use components::{ComponentId, FullScaleContext, GpComponent, VecchiaComponents, WoodburySystem};
pub use config::{
    Approximation, Likelihood, NeighborSelection, Parallelism, PredictionType, VecchiaConfig,
    VecchiaOrdering,
};
pub use convergence::{ConvergenceCheck, ConvergenceCriterion, ConvergenceObserver, NeighborRedetermination};
pub use covariance::{CovFunction, CovarianceFunction, MaternShape, PairGeometry, ScaleOptions};
pub use error::{LinalgError, VecchiaError};
pub use factor::{build_factor, calc_cov_factor, FactorOptions, ParameterGradient, VecchiaFactor};
pub use metric::{Euclidean, Metric, ResidualCorrelation};
pub use predict::{
    predict, predict_latent_observed_first, predict_observed_first, predict_predicted_first,
    PredictOptions, Prediction, PredictionFactors, PredictionOutcome,
};
pub use telemetry::SearchTelemetry;
