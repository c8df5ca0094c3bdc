#![allow(dead_code)]

use faer::Side;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use vecchia_gp::covariance::dense_covariance;
use vecchia_gp::linalg::FaerCholesky;
use vecchia_gp::CovFunction;

pub fn uniform_coords(n: usize, dim: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, dim), |_| rng.gen::<f64>())
}

/// Smooth surface plus Gaussian noise.
pub fn response(coords: &Array2<f64>, seed: u64) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.3).expect("valid normal");
    coords
        .rows()
        .into_iter()
        .map(|x| (3.0 * x[0]).sin() + (2.0 * x[x.len() - 1]).cos() + noise.sample(&mut rng))
        .collect()
}

pub fn spd_inverse(a: &Array2<f64>) -> Array2<f64> {
    let chol = a.cholesky(Side::Lower).expect("spd");
    chol.solve_mat(&Array2::eye(a.nrows()))
}

/// `K(coords, coords) + I`.
pub fn response_covariance(cov: &CovFunction, pars: &[f64], coords: &Array2<f64>) -> Array2<f64> {
    let k = dense_covariance(cov, pars, coords.view(), coords.view()).expect("covariance");
    k + Array2::<f64>::eye(coords.nrows())
}

/// Exact GP conditioning of the latent process at `coords_p` on noisy observations `y`.
pub fn exact_latent_prediction(
    cov: &CovFunction,
    pars: &[f64],
    coords_o: &Array2<f64>,
    y: &Array1<f64>,
    coords_p: &Array2<f64>,
) -> (Array1<f64>, Array2<f64>) {
    let sigma_oo_inv = spd_inverse(&response_covariance(cov, pars, coords_o));
    let k_po = dense_covariance(cov, pars, coords_p.view(), coords_o.view()).expect("covariance");
    let k_pp = dense_covariance(cov, pars, coords_p.view(), coords_p.view()).expect("covariance");
    let weights = k_po.dot(&sigma_oo_inv);
    let mean = weights.dot(y);
    let cov_p = k_pp - weights.dot(&k_po.t());
    (mean, cov_p)
}

pub fn max_abs_diff<'a>(a: impl IntoIterator<Item = &'a f64>, b: impl IntoIterator<Item = &'a f64>) -> f64 {
    a.into_iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}
