//! Covariance oracle consumed by the neighbour search, the factor builder and the predictor.
//!
//! Parameters are laid out as `[σ², ranges…]`. Isotropic kernels are evaluated on distances, so
//! the neighbour search can cache them; anisotropic and space-time kernels need coordinates.

use crate::error::VecchiaError;
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// Smoothness of the Matérn family with closed-form kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaternShape {
    Half,
    ThreeHalves,
    FiveHalves,
}

impl MaternShape {
    pub fn from_smoothness(nu: f64) -> Result<Self, VecchiaError> {
        match nu {
            x if x == 0.5 => Ok(MaternShape::Half),
            x if x == 1.5 => Ok(MaternShape::ThreeHalves),
            x if x == 2.5 => Ok(MaternShape::FiveHalves),
            other => Err(VecchiaError::InvalidConfiguration(format!(
                "Matern smoothness {other} is not supported (use 0.5, 1.5 or 2.5)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Profile {
    Matern(MaternShape),
    Gaussian,
}

impl Profile {
    /// Correlation at scaled distance `r`.
    #[inline]
    fn value(self, r: f64) -> f64 {
        match self {
            Profile::Matern(MaternShape::Half) => (-r).exp(),
            Profile::Matern(MaternShape::ThreeHalves) => {
                let a = 3f64.sqrt() * r;
                (1.0 + a) * (-a).exp()
            }
            Profile::Matern(MaternShape::FiveHalves) => {
                let a = 5f64.sqrt() * r;
                (1.0 + a + a * a / 3.0) * (-a).exp()
            }
            Profile::Gaussian => (-r * r).exp(),
        }
    }

    /// `−k'(r)·part/r`: derivative of the correlation with respect to a log-range whose squared
    /// scaled difference is `part` (where `r² = Σ parts`).
    #[inline]
    fn log_range_derivative(self, r: f64, part: f64) -> f64 {
        match self {
            Profile::Matern(MaternShape::Half) => {
                if r <= 0.0 {
                    0.0
                } else {
                    (-r).exp() * part / r
                }
            }
            Profile::Matern(MaternShape::ThreeHalves) => 3.0 * (-(3f64.sqrt()) * r).exp() * part,
            Profile::Matern(MaternShape::FiveHalves) => {
                let a = 5f64.sqrt() * r;
                5.0 / 3.0 * (1.0 + a) * (-a).exp() * part
            }
            Profile::Gaussian => 2.0 * (-r * r).exp() * part,
        }
    }
}

/// Covariance function variants shipped with the crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CovFunction {
    Exponential,
    Gaussian,
    Matern {
        shape: MaternShape,
    },
    /// Compactly supported Wendland correlation with fixed taper range; only σ² is estimated.
    Wendland {
        taper_range: f64,
        smoothness: u8,
        mu: f64,
    },
    MaternArd {
        shape: MaternShape,
    },
    GaussianArd,
    /// Coordinate 0 is time with its own range; the remaining columns share a spatial range.
    MaternSpaceTime {
        shape: MaternShape,
    },
}

/// Where a covariance block is evaluated: cached pairwise distances or two coordinate sets.
#[derive(Clone, Copy, Debug)]
pub enum PairGeometry<'a, 'b> {
    Distances(ArrayView2<'a, f64>),
    Coordinates {
        rows: ArrayView2<'a, f64>,
        cols: ArrayView2<'b, f64>,
    },
}

impl PairGeometry<'_, '_> {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            PairGeometry::Distances(d) => d.dim(),
            PairGeometry::Coordinates { rows, cols } => (rows.nrows(), cols.nrows()),
        }
    }
}

/// Scale on which covariances and their derivatives are reported.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleOptions {
    /// Transformed scale: variances relative to the nugget, derivatives w.r.t. log-parameters.
    pub transf_scale: bool,
    /// Nugget variance; multiplies all values on the original scale.
    pub nugget_var: f64,
}

impl Default for ScaleOptions {
    fn default() -> Self {
        ScaleOptions {
            transf_scale: true,
            nugget_var: 1.0,
        }
    }
}

pub trait CovarianceFunction {
    /// Number of parameters `[σ², ranges…]` for coordinates of dimension `dim`.
    fn num_cov_par(&self, dim: usize) -> usize;

    fn is_space_time_model(&self) -> bool;

    /// Whether the kernel depends on coordinates only through Euclidean distances, so that the
    /// neighbour search may cache them.
    fn should_save_distances(&self) -> bool;

    /// Covariance block together with one derivative block per parameter when requested.
    fn eval_with_gradient(
        &self,
        pars: &[f64],
        geometry: PairGeometry<'_, '_>,
        opts: ScaleOptions,
        calc_gradient: bool,
    ) -> Result<(Array2<f64>, Vec<Array2<f64>>), VecchiaError>;

    fn eval_covariance(
        &self,
        pars: &[f64],
        geometry: PairGeometry<'_, '_>,
        opts: ScaleOptions,
    ) -> Result<Array2<f64>, VecchiaError> {
        Ok(self.eval_with_gradient(pars, geometry, opts, false)?.0)
    }

    fn eval_covariance_gradient(
        &self,
        pars: &[f64],
        geometry: PairGeometry<'_, '_>,
        opts: ScaleOptions,
    ) -> Result<Vec<Array2<f64>>, VecchiaError> {
        Ok(self.eval_with_gradient(pars, geometry, opts, true)?.1)
    }

    /// Coordinates divided by their range(s); Euclidean distances on the result order points
    /// the way the kernel correlates them.
    fn scale_coordinates(&self, pars: &[f64], coords: ArrayView2<'_, f64>) -> Array2<f64>;

    /// Scalar covariance between two points on the transformed scale.
    fn covariance_pair(&self, pars: &[f64], x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64;
}

impl CovFunction {
    fn profile(&self) -> Option<Profile> {
        match self {
            CovFunction::Exponential => Some(Profile::Matern(MaternShape::Half)),
            CovFunction::Gaussian | CovFunction::GaussianArd => Some(Profile::Gaussian),
            CovFunction::Matern { shape }
            | CovFunction::MaternArd { shape }
            | CovFunction::MaternSpaceTime { shape } => Some(Profile::Matern(*shape)),
            CovFunction::Wendland { .. } => None,
        }
    }

    /// Checks that `pars` has the expected length and positive entries.
    pub fn check_pars(&self, pars: &[f64], dim: usize) -> Result<(), VecchiaError> {
        let expected = self.num_cov_par(dim);
        if pars.len() != expected {
            return Err(VecchiaError::DimensionMismatch {
                what: "covariance parameters",
                expected,
                found: pars.len(),
            });
        }
        if let Some(bad) = pars.iter().find(|p| !(**p > 0.0) || !p.is_finite()) {
            return Err(VecchiaError::InvalidConfiguration(format!(
                "covariance parameters must be positive and finite, got {bad}"
            )));
        }
        if self.is_space_time_model() && dim < 2 {
            return Err(VecchiaError::InvalidConfiguration(
                "space-time covariance functions need a time column and at least one spatial column"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn wendland(&self, r: f64) -> f64 {
        let CovFunction::Wendland { smoothness, mu, .. } = self else {
            return 0.0;
        };
        if r >= 1.0 {
            return 0.0;
        }
        let base = 1.0 - r;
        match smoothness {
            0 => base.powf(*mu),
            1 => base.powf(mu + 1.0) * (1.0 + (mu + 1.0) * r),
            _ => {
                let m = mu + 2.0;
                base.powf(m) * (1.0 + m * r + (m * m - 1.0) * r * r / 3.0)
            }
        }
    }

    /// Fills `parts` with the squared scaled differences belonging to each range parameter.
    fn range_parts(&self, ranges: &[f64], x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>, parts: &mut [f64]) {
        match self {
            CovFunction::MaternArd { .. } | CovFunction::GaussianArd => {
                for (k, part) in parts.iter_mut().enumerate() {
                    let d = (x[k] - y[k]) / ranges[k];
                    *part = d * d;
                }
            }
            CovFunction::MaternSpaceTime { .. } => {
                let dt = (x[0] - y[0]) / ranges[0];
                parts[0] = dt * dt;
                let mut ds = 0.0;
                for k in 1..x.len() {
                    let d = x[k] - y[k];
                    ds += d * d;
                }
                parts[1] = ds / (ranges[1] * ranges[1]);
            }
            _ => {
                let d = euclidean(x, y) / ranges[0];
                parts[0] = d * d;
            }
        }
    }

    fn entry(
        &self,
        pars: &[f64],
        geometry: &PairGeometry<'_, '_>,
        i: usize,
        j: usize,
        parts: &mut [f64],
    ) -> Result<f64, VecchiaError> {
        let sigma2 = pars[0];
        if let CovFunction::Wendland { taper_range, .. } = self {
            let d = match geometry {
                PairGeometry::Distances(dist) => dist[[i, j]],
                PairGeometry::Coordinates { rows, cols } => euclidean(rows.row(i), cols.row(j)),
            };
            return Ok(sigma2 * self.wendland(d / taper_range));
        }
        match geometry {
            PairGeometry::Distances(dist) => {
                if !self.should_save_distances() {
                    return Err(VecchiaError::InvalidConfiguration(
                        "anisotropic covariance functions must be evaluated on coordinates"
                            .to_string(),
                    ));
                }
                let d = dist[[i, j]] / pars[1];
                parts[0] = d * d;
            }
            PairGeometry::Coordinates { rows, cols } => {
                self.range_parts(&pars[1..], rows.row(i), cols.row(j), parts);
            }
        }
        let r = parts.iter().sum::<f64>().sqrt();
        Ok(match self.profile() {
            Some(profile) => sigma2 * profile.value(r),
            None => 0.0,
        })
    }
}

impl CovarianceFunction for CovFunction {
    fn num_cov_par(&self, dim: usize) -> usize {
        match self {
            CovFunction::Wendland { .. } => 1,
            CovFunction::MaternArd { .. } | CovFunction::GaussianArd => 1 + dim,
            CovFunction::MaternSpaceTime { .. } => 3,
            _ => 2,
        }
    }

    fn is_space_time_model(&self) -> bool {
        matches!(self, CovFunction::MaternSpaceTime { .. })
    }

    fn should_save_distances(&self) -> bool {
        !matches!(
            self,
            CovFunction::MaternArd { .. } | CovFunction::GaussianArd | CovFunction::MaternSpaceTime { .. }
        )
    }

    fn eval_with_gradient(
        &self,
        pars: &[f64],
        geometry: PairGeometry<'_, '_>,
        opts: ScaleOptions,
        calc_gradient: bool,
    ) -> Result<(Array2<f64>, Vec<Array2<f64>>), VecchiaError> {
        let (nr, nc) = geometry.shape();
        let num_par = match geometry {
            PairGeometry::Coordinates { rows, .. } => self.num_cov_par(rows.ncols()),
            PairGeometry::Distances(_) => self.num_cov_par(0),
        };
        if pars.len() < num_par {
            return Err(VecchiaError::DimensionMismatch {
                what: "covariance parameters",
                expected: num_par,
                found: pars.len(),
            });
        }
        let scale = if opts.transf_scale { 1.0 } else { opts.nugget_var };
        let mut cov = Array2::<f64>::zeros((nr, nc));
        let mut grads = if calc_gradient {
            vec![Array2::<f64>::zeros((nr, nc)); num_par]
        } else {
            Vec::new()
        };
        let mut parts = vec![0.0; num_par.saturating_sub(1).max(1)];
        let profile = self.profile();
        for i in 0..nr {
            for j in 0..nc {
                let value = self.entry(pars, &geometry, i, j, &mut parts)?;
                cov[[i, j]] = scale * value;
                if !calc_gradient {
                    continue;
                }
                // variance slot: log-derivative is the value itself, on the original scale the
                // derivative w.r.t. the absolute variance is the correlation
                grads[0][[i, j]] = if opts.transf_scale {
                    value
                } else {
                    value / pars[0]
                };
                if let Some(profile) = profile {
                    let r = parts.iter().sum::<f64>().sqrt();
                    for p in 1..num_par {
                        let dlog = pars[0] * profile.log_range_derivative(r, parts[p - 1]);
                        grads[p][[i, j]] = if opts.transf_scale {
                            dlog
                        } else {
                            scale * dlog / pars[p]
                        };
                    }
                }
            }
        }
        Ok((cov, grads))
    }

    fn scale_coordinates(&self, pars: &[f64], coords: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut scaled = coords.to_owned();
        match self {
            CovFunction::MaternArd { .. } | CovFunction::GaussianArd => {
                for (k, mut col) in scaled.columns_mut().into_iter().enumerate() {
                    let range = pars.get(k + 1).copied().unwrap_or(1.0);
                    col.mapv_inplace(|v| v / range);
                }
            }
            CovFunction::MaternSpaceTime { .. } => {
                for (k, mut col) in scaled.columns_mut().into_iter().enumerate() {
                    let range = if k == 0 { pars[1] } else { pars[2] };
                    col.mapv_inplace(|v| v / range);
                }
            }
            CovFunction::Wendland { taper_range, .. } => {
                scaled.mapv_inplace(|v| v / taper_range);
            }
            _ => {
                let range = pars[1];
                scaled.mapv_inplace(|v| v / range);
            }
        }
        scaled
    }

    fn covariance_pair(&self, pars: &[f64], x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
        if let CovFunction::Wendland { taper_range, .. } = self {
            return pars[0] * self.wendland(euclidean(x, y) / taper_range);
        }
        let mut parts = [0.0; 16];
        let nparts = self.num_cov_par(x.len()) - 1;
        let r = if nparts <= parts.len() {
            self.range_parts(&pars[1..], x, y, &mut parts[..nparts]);
            parts[..nparts].iter().sum::<f64>().sqrt()
        } else {
            let mut buf = vec![0.0; nparts];
            self.range_parts(&pars[1..], x, y, &mut buf);
            buf.iter().sum::<f64>().sqrt()
        };
        match self.profile() {
            Some(profile) => pars[0] * profile.value(r),
            None => 0.0,
        }
    }
}

#[inline]
pub fn euclidean(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

/// Pairwise Euclidean distances between the rows of `a` and `b`.
pub fn pairwise_distances(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| euclidean(a.row(i), b.row(j)))
}

/// Dense covariance between two coordinate sets on the transformed scale.
pub fn dense_covariance(
    cov: &CovFunction,
    pars: &[f64],
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, VecchiaError> {
    cov.eval_covariance(
        pars,
        PairGeometry::Coordinates { rows: a, cols: b },
        ScaleOptions::default(),
    )
}
