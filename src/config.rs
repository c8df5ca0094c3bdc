use crate::error::VecchiaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment knob overriding the worker count when [`Parallelism::from_env`] is used.
pub const NUM_THREADS_ENV: &str = "VECCHIA_NUM_THREADS";

/// Order in which observations enter the Vecchia conditioning sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VecchiaOrdering {
    #[default]
    None,
    Random,
    Time,
    TimeRandomSpace,
}

impl VecchiaOrdering {
    pub fn shuffles(self) -> bool {
        matches!(self, VecchiaOrdering::Random | VecchiaOrdering::TimeRandomSpace)
    }

    pub fn sorts_by_time(self) -> bool {
        matches!(self, VecchiaOrdering::Time | VecchiaOrdering::TimeRandomSpace)
    }
}

impl fmt::Display for VecchiaOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VecchiaOrdering::None => "none",
            VecchiaOrdering::Random => "random",
            VecchiaOrdering::Time => "time",
            VecchiaOrdering::TimeRandomSpace => "time_random_space",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NeighborSelection {
    /// Euclidean nearest neighbours (on range-scaled coordinates for anisotropic kernels).
    #[default]
    #[serde(alias = "default")]
    Nearest,
    /// Residual-correlation pseudo-distance of the full-scale approximation.
    ResidualCorrelation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    #[default]
    Gaussian,
    NonGaussian,
}

impl Likelihood {
    pub fn is_gaussian(self) -> bool {
        matches!(self, Likelihood::Gaussian)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Approximation {
    #[default]
    Vecchia,
    FullScaleVecchia,
}

/// Ordering and conditioning strategy used when extending the factorisation to new locations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PredictionType {
    #[default]
    #[serde(rename = "order_obs_first_cond_obs_only")]
    ObservedFirstCondObsOnly,
    #[serde(rename = "order_obs_first_cond_all")]
    ObservedFirstCondAll,
    #[serde(rename = "order_pred_first")]
    PredictedFirst,
    #[serde(rename = "latent_order_obs_first_cond_obs_only")]
    LatentObservedFirstCondObsOnly,
    #[serde(rename = "latent_order_obs_first_cond_all")]
    LatentObservedFirstCondAll,
}

impl PredictionType {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionType::ObservedFirstCondObsOnly => "order_obs_first_cond_obs_only",
            PredictionType::ObservedFirstCondAll => "order_obs_first_cond_all",
            PredictionType::PredictedFirst => "order_pred_first",
            PredictionType::LatentObservedFirstCondObsOnly => "latent_order_obs_first_cond_obs_only",
            PredictionType::LatentObservedFirstCondAll => "latent_order_obs_first_cond_all",
        }
    }
}

impl FromStr for PredictionType {
    type Err = VecchiaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            PredictionType::ObservedFirstCondObsOnly,
            PredictionType::ObservedFirstCondAll,
            PredictionType::PredictedFirst,
            PredictionType::LatentObservedFirstCondObsOnly,
            PredictionType::LatentObservedFirstCondAll,
        ];
        all.into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                VecchiaError::InvalidConfiguration(format!("unknown prediction type '{s}'"))
            })
    }
}

/// Worker pool used by the neighbour search, the factor builder and the predictor.
///
/// `num_segments` fixes how many cover trees the search partitions the data into; when unset
/// it follows the worker count so results only depend on the pool size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Parallelism {
    #[serde(default)]
    pub num_threads: Option<usize>,
    #[serde(default)]
    pub num_segments: Option<usize>,
}

impl Parallelism {
    pub fn sequential() -> Self {
        Parallelism {
            num_threads: Some(1),
            num_segments: Some(1),
        }
    }

    pub fn with_threads(num_threads: usize) -> Self {
        Parallelism {
            num_threads: Some(num_threads.max(1)),
            num_segments: None,
        }
    }

    pub fn from_env() -> Self {
        let num_threads = std::env::var(NUM_THREADS_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&v| v > 0);
        Parallelism {
            num_threads,
            num_segments: None,
        }
    }

    /// Number of contiguous segments (one cover tree each) for the neighbour search.
    pub fn num_segments(&self) -> usize {
        self.num_segments
            .or(self.num_threads)
            .unwrap_or_else(rayon::current_num_threads)
            .max(1)
    }

    /// Runs `op` inside a dedicated pool when a worker count is configured, otherwise on the
    /// global rayon pool.
    pub fn install<R, F>(&self, op: F) -> Result<R, VecchiaError>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self.num_threads {
            None => Ok(op()),
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n.max(1))
                    .build()
                    .map_err(|e| VecchiaError::ThreadPool(e.to_string()))?;
                Ok(pool.install(op))
            }
        }
    }
}

fn default_num_neighbors() -> usize {
    20
}

fn default_cover_tree_base() -> f64 {
    2.0
}

fn default_check_duplicates() -> bool {
    true
}

/// Settings of a Vecchia-approximated Gaussian process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VecchiaConfig {
    /// Number of conditioning neighbours per training point.
    #[serde(default = "default_num_neighbors")]
    pub num_neighbors: usize,
    /// Number of conditioning neighbours per prediction point; falls back to `num_neighbors`.
    #[serde(default)]
    pub num_neighbors_pred: Option<usize>,
    /// Branching base of the cover tree (radius at level l is `base^-l`).
    #[serde(default = "default_cover_tree_base")]
    pub cover_tree_base: f64,
    #[serde(default)]
    pub ordering: VecchiaOrdering,
    #[serde(default)]
    pub neighbor_selection: NeighborSelection,
    #[serde(default)]
    pub likelihood: Likelihood,
    #[serde(default)]
    pub approximation: Approximation,
    #[serde(default)]
    pub pred_type: PredictionType,
    #[serde(default = "default_check_duplicates")]
    pub check_duplicates: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub parallelism: Parallelism,
}

impl Default for VecchiaConfig {
    fn default() -> Self {
        VecchiaConfig {
            num_neighbors: default_num_neighbors(),
            num_neighbors_pred: None,
            cover_tree_base: default_cover_tree_base(),
            ordering: VecchiaOrdering::default(),
            neighbor_selection: NeighborSelection::default(),
            likelihood: Likelihood::default(),
            approximation: Approximation::default(),
            pred_type: PredictionType::default(),
            check_duplicates: default_check_duplicates(),
            seed: 0,
            parallelism: Parallelism::default(),
        }
    }
}

impl VecchiaConfig {
    pub fn num_neighbors_pred(&self) -> usize {
        self.num_neighbors_pred.unwrap_or(self.num_neighbors)
    }

    pub fn is_full_scale(&self) -> bool {
        matches!(self.approximation, Approximation::FullScaleVecchia)
    }

    pub fn uses_residual_correlation(&self) -> bool {
        matches!(self.neighbor_selection, NeighborSelection::ResidualCorrelation)
    }

    pub fn validate(&self) -> Result<(), VecchiaError> {
        if self.num_neighbors == 0 {
            return Err(VecchiaError::InvalidConfiguration(
                "num_neighbors must be positive".to_string(),
            ));
        }
        if self.num_neighbors_pred == Some(0) {
            return Err(VecchiaError::InvalidConfiguration(
                "num_neighbors_pred must be positive".to_string(),
            ));
        }
        if !(self.cover_tree_base > 1.0) {
            return Err(VecchiaError::InvalidConfiguration(format!(
                "cover_tree_base must be larger than 1, got {}",
                self.cover_tree_base
            )));
        }
        if self.uses_residual_correlation() && !self.is_full_scale() {
            return Err(VecchiaError::InvalidConfiguration(
                "neighbor_selection 'residual_correlation' requires the full-scale Vecchia approximation"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_correlation_needs_full_scale() {
        let mut config = VecchiaConfig {
            neighbor_selection: NeighborSelection::ResidualCorrelation,
            ..VecchiaConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VecchiaError::InvalidConfiguration(_))
        ));
        config.approximation = Approximation::FullScaleVecchia;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn prediction_type_parses_textual_names() {
        for name in [
            "order_obs_first_cond_obs_only",
            "order_obs_first_cond_all",
            "order_pred_first",
            "latent_order_obs_first_cond_obs_only",
            "latent_order_obs_first_cond_all",
        ] {
            let parsed: PredictionType = name.parse().expect("known name");
            assert_eq!(parsed.as_str(), name);
        }
        assert!("order_random".parse::<PredictionType>().is_err());
    }

    #[test]
    fn explicit_segments_override_thread_count() {
        let par = Parallelism {
            num_threads: Some(2),
            num_segments: Some(5),
        };
        assert_eq!(par.num_segments(), 5);
        assert_eq!(Parallelism::with_threads(3).num_segments(), 3);
        assert_eq!(Parallelism::sequential().num_segments(), 1);
    }
}
