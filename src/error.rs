use thiserror::Error;

/// Failures of the dense and sparse factorisations used by the factor builder and predictor.
#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(faer::linalg::solvers::LltError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(faer::linalg::solvers::LdltError),
    #[error("sparse Cholesky factorization of a {dim}x{dim} matrix failed")]
    SparseCholesky { dim: usize },
    #[error("failed to assemble sparse matrix: {0}")]
    SparseAssembly(String),
}

#[derive(Debug, Error)]
pub enum VecchiaError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("duplicate coordinates: {0}")]
    DuplicateCoordinates(String),

    #[error("ordering '{ordering}' requires a space-time covariance function")]
    TimeOrderingWithoutSpaceTime { ordering: String },

    #[error(
        "random coefficient processes are not supported for covariance functions \
         whose neighbors are determined dynamically"
    )]
    RandomCoefficientsNeedSavedDistances,

    #[error(
        "conditional variance D[{index}] = {value:e} is not positive; the Vecchia approximation \
         is numerically unusable"
    )]
    NonPositiveConditionalVariance { index: usize, value: f64 },

    #[error("factorization of the neighbor covariance block of point {index} failed: {source}")]
    LocalCholesky {
        index: usize,
        #[source]
        source: LinalgError,
    },

    #[error(transparent)]
    Linalg(#[from] LinalgError),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),
}
