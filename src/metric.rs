use crate::covariance::{CovFunction, CovarianceFunction};
use ndarray::{ArrayView1, ArrayView2};
use num_traits::Float;
use std::fmt::Debug;
use wide::f64x4;

/// Distance between data points addressed by their row index.
pub trait Metric<T>: Sync + Send {
    fn distance(&self, i: usize, j: usize) -> T;

    /// Distances from `i` to every index in `candidates`, written to `out` in the same order.
    fn distances_into(&self, i: usize, candidates: &[usize], out: &mut Vec<T>) {
        out.clear();
        out.reserve(candidates.len());
        out.extend(candidates.iter().map(|&j| self.distance(i, j)));
    }

    fn num_points(&self) -> usize;
}

/// L2 distance between rows of a coordinate matrix.
#[derive(Copy, Clone)]
pub struct Euclidean<'a, T> {
    coords: ArrayView2<'a, T>,
}

impl<'a, T> Euclidean<'a, T> {
    pub fn new(coords: ArrayView2<'a, T>) -> Self {
        Euclidean { coords }
    }
}

impl<T> Metric<T> for Euclidean<'_, T>
where
    T: Float + Debug + Send + Sync + std::iter::Sum,
{
    #[inline]
    fn distance(&self, i: usize, j: usize) -> T {
        let a = self.coords.row(i);
        let b = self.coords.row(j);
        a.iter()
            .zip(b.iter())
            .map(|(&x, &y)| {
                let diff = x - y;
                diff * diff
            })
            .sum::<T>()
            .sqrt()
    }

    fn num_points(&self) -> usize {
        self.coords.nrows()
    }
}

/// Residual-correlation pseudo-distance of the full-scale approximation.
///
/// For the residual process `r = f − Σ_cross Σ_ip⁻¹ u` the correlation between points i and j is
/// `(cov(i, j) − ⟨w_i, w_j⟩) / sqrt(v_i v_j)`, where `w_i` is the whitened cross-covariance row
/// and `v_i` the residual variance. The distance is `sqrt(1 − |corr|^0.1)`, which lies in [0, 1].
pub struct ResidualCorrelation<'a> {
    coords: ArrayView2<'a, f64>,
    whitened: ArrayView2<'a, f64>,
    resid_var: ArrayView1<'a, f64>,
    cov: &'a CovFunction,
    pars: &'a [f64],
}

impl<'a> ResidualCorrelation<'a> {
    /// `whitened` holds one row `L_ip⁻¹ Σ_cross[i, :]ᵀ` per point; residual variances must already
    /// be floored away from zero.
    pub fn new(
        coords: ArrayView2<'a, f64>,
        whitened: ArrayView2<'a, f64>,
        resid_var: ArrayView1<'a, f64>,
        cov: &'a CovFunction,
        pars: &'a [f64],
    ) -> Self {
        debug_assert_eq!(coords.nrows(), whitened.nrows());
        debug_assert_eq!(coords.nrows(), resid_var.len());
        ResidualCorrelation {
            coords,
            whitened,
            resid_var,
            cov,
            pars,
        }
    }

    #[inline]
    fn correlation_to_distance(corr: f64) -> f64 {
        let corr = corr.clamp(-1.0, 1.0);
        (1.0 - corr.abs().powf(0.1)).max(0.0).sqrt()
    }
}

impl Metric<f64> for ResidualCorrelation<'_> {
    fn distance(&self, i: usize, j: usize) -> f64 {
        let k = self
            .cov
            .covariance_pair(self.pars, self.coords.row(i), self.coords.row(j));
        let dot = dot_product_simd(self.whitened.row(i), self.whitened.row(j));
        let denom = (self.resid_var[i] * self.resid_var[j]).sqrt();
        Self::correlation_to_distance((k - dot) / denom)
    }

    fn distances_into(&self, i: usize, candidates: &[usize], out: &mut Vec<f64>) {
        out.clear();
        out.reserve(candidates.len());
        let xi = self.coords.row(i);
        let vi = self.resid_var[i];
        // standard layout lets us slice the query row once
        if let Some(w_flat) = self.whitened.as_slice() {
            let m = self.whitened.ncols();
            let wi = &w_flat[i * m..(i + 1) * m];
            for &j in candidates {
                let wj = &w_flat[j * m..(j + 1) * m];
                let k = self.cov.covariance_pair(self.pars, xi, self.coords.row(j));
                let denom = (vi * self.resid_var[j]).sqrt();
                out.push(Self::correlation_to_distance(
                    (k - dot_product_simd_slice(wi, wj)) / denom,
                ));
            }
            return;
        }
        out.extend(candidates.iter().map(|&j| self.distance(i, j)));
    }

    fn num_points(&self) -> usize {
        self.coords.nrows()
    }
}

#[inline(always)]
fn dot_product_simd(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if let (Some(av), Some(bv)) = (a.as_slice(), b.as_slice()) {
        return dot_product_simd_slice(av, bv);
    }
    a.dot(&b)
}

#[inline(always)]
pub(crate) fn dot_product_simd_slice(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let chunks_a = a.chunks_exact(4);
    let chunks_b = b.chunks_exact(4);
    let tail: f64 = chunks_a
        .remainder()
        .iter()
        .zip(chunks_b.remainder())
        .map(|(x, y)| x * y)
        .sum();
    let mut acc = f64x4::ZERO;
    for (ca, cb) in chunks_a.zip(chunks_b) {
        let va = f64x4::from([ca[0], ca[1], ca[2], ca[3]]);
        let vb = f64x4::from([cb[0], cb[1], cb[2], cb[3]]);
        acc += va * vb;
    }
    acc.reduce_add() + tail
}
