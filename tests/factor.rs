mod common;

use approx::assert_relative_eq;
use common::{max_abs_diff, response, response_covariance, spd_inverse, uniform_coords};
use faer::Side;
use ndarray::{array, Array1, Array2};
use vecchia_gp::linalg::{solve_lower_triangular, sparse_to_dense, FaerCholesky};
use vecchia_gp::{
    build_factor, calc_cov_factor, Approximation, CovFunction, FactorOptions, Likelihood, MaternShape,
    Parallelism, VecchiaComponents, VecchiaConfig, VecchiaError, VecchiaFactor,
};

fn config(num_neighbors: usize) -> VecchiaConfig {
    VecchiaConfig {
        num_neighbors,
        parallelism: Parallelism::with_threads(2),
        ..VecchiaConfig::default()
    }
}

#[test]
fn full_conditioning_reproduces_the_exact_cholesky_factor() {
    let n = 50;
    let coords = uniform_coords(n, 2, 7);
    let cov = CovFunction::Exponential;
    let pars = [1.3, 0.4];
    let components =
        VecchiaComponents::create(coords.view(), None, cov.clone(), &pars, config(49), None).expect("components");
    assert_eq!(components.num_neighbors(), 49);
    let factor = build_factor(&components, &FactorOptions::default()).expect("factor");

    let sigma = response_covariance(&cov, &pars, &coords);
    let l = sigma.cholesky(Side::Lower).expect("spd").lower_triangular();
    let l_inv = solve_lower_triangular(&l, &Array2::eye(n));
    let diag_l = l.diag().to_owned();
    let b_exact = Array2::from_shape_fn((n, n), |(i, j)| diag_l[i] * l_inv[[i, j]]);
    let d_exact = diag_l.mapv(|v| v * v);

    let b = sparse_to_dense(factor.b());
    assert!(max_abs_diff(b.iter(), b_exact.iter()) < 1e-8);
    let d = factor.d_inv().mapv(|v| 1.0 / v);
    assert!(max_abs_diff(d.iter(), d_exact.iter()) < 1e-8);
}

#[test]
fn conditional_variances_stay_positive_with_a_nugget() {
    let coords = uniform_coords(200, 2, 3);
    let components = VecchiaComponents::create(
        coords.view(),
        None,
        CovFunction::Matern {
            shape: MaternShape::FiveHalves,
        },
        &[2.0, 0.2],
        config(12),
        None,
    )
    .expect("components");
    let factor = build_factor(&components, &FactorOptions::default()).expect("factor");
    assert!(factor.d_inv().iter().all(|&w| w > 0.0 && w.is_finite()));
    assert!(factor.d_inv().iter().all(|&w| w <= 1.0 + 1e-12));
}

#[test]
fn gaussian_duplicates_are_accepted() {
    let coords = array![[0.0, 0.0], [0.5, 0.5], [0.5, 0.5], [1.0, 0.2], [0.3, 0.9]];
    let components =
        VecchiaComponents::create(coords.view(), None, CovFunction::Exponential, &[1.0, 0.5], config(2), None)
            .expect("gaussian likelihood tolerates duplicates");
    assert!(components.has_duplicates());
    let factor = build_factor(&components, &FactorOptions::default()).expect("factor");
    assert!(factor.d_inv().iter().all(|&w| w > 0.0));
}

#[test]
fn non_gaussian_duplicates_are_fatal() {
    let coords = array![[0.0, 0.0], [0.5, 0.5], [0.5, 0.5], [1.0, 0.2]];
    let cfg = VecchiaConfig {
        likelihood: Likelihood::NonGaussian,
        ..config(2)
    };
    let err = VecchiaComponents::create(coords.view(), None, CovFunction::Exponential, &[1.0, 0.5], cfg, None)
        .err()
        .expect("duplicates must be rejected");
    assert!(matches!(err, VecchiaError::DuplicateCoordinates(_)));
}

#[test]
fn vanishing_conditional_variance_is_fatal_without_nugget() {
    // the duplicate of point 1 is explained perfectly by it once the jitter is lost to rounding
    let coords = array![[0.0], [1.0], [1.0]];
    let cfg = VecchiaConfig {
        likelihood: Likelihood::NonGaussian,
        check_duplicates: false,
        ..config(1)
    };
    let components =
        VecchiaComponents::create(coords.view(), None, CovFunction::Exponential, &[1e12, 0.5], cfg, None)
            .expect("components");
    let err = build_factor(&components, &FactorOptions::default()).expect_err("D = 0");
    assert!(matches!(
        err,
        VecchiaError::NonPositiveConditionalVariance { index: 2, .. }
    ));
}

/// Derivatives of B (as a dense matrix) and D by central differences.
fn finite_differences(
    eval: impl Fn(&[f64]) -> VecchiaFactor,
    theta: &[f64],
    h: f64,
) -> Vec<(Array2<f64>, Array1<f64>)> {
    (0..theta.len())
        .map(|p| {
            let mut up = theta.to_vec();
            let mut down = theta.to_vec();
            up[p] += h;
            down[p] -= h;
            let (f_up, f_down) = (eval(&up), eval(&down));
            let db = (sparse_to_dense(f_up.b()) - sparse_to_dense(f_down.b())) / (2.0 * h);
            let dd = (f_up.d_inv().mapv(|v| 1.0 / v) - f_down.d_inv().mapv(|v| 1.0 / v)) / (2.0 * h);
            (db, dd)
        })
        .collect()
}

fn assert_gradients_match(factor: &VecchiaFactor, fd: &[(Array2<f64>, Array1<f64>)]) {
    assert_eq!(factor.gradients().len(), fd.len());
    for (p, (db, dd)) in fd.iter().enumerate() {
        let grad = factor.gradients()[p].as_ref().expect("gradient slot");
        let b_grad = sparse_to_dense(&grad.b);
        for (a, f) in b_grad.iter().zip(db.iter()) {
            assert_relative_eq!(*a, *f, max_relative = 1e-5, epsilon = 1e-7);
        }
        for (a, f) in grad.d.iter().zip(dd.iter()) {
            assert_relative_eq!(*a, *f, max_relative = 1e-5, epsilon = 1e-7);
        }
    }
}

#[test]
fn log_parameter_gradients_match_finite_differences() {
    let coords = uniform_coords(30, 2, 5);
    let cov = CovFunction::Matern {
        shape: MaternShape::ThreeHalves,
    };
    let pars = [1.4, 0.25];
    let mut components =
        VecchiaComponents::create(coords.view(), None, cov, &pars, config(10), None).expect("components");
    let factor = calc_cov_factor(&mut components, &pars, &FactorOptions::with_gradient()).expect("factor");

    let log_theta: Vec<f64> = pars.iter().map(|p| p.ln()).collect();
    let fd = finite_differences(
        |theta| {
            let pars: Vec<f64> = theta.iter().map(|t| t.exp()).collect();
            let mut comps = VecchiaComponents::create(
                coords.view(),
                None,
                components.cov_function().clone(),
                &pars,
                config(10),
                None,
            )
            .expect("components");
            calc_cov_factor(&mut comps, &pars, &FactorOptions::default()).expect("factor")
        },
        &log_theta,
        1e-5,
    );
    assert_gradients_match(&factor, &fd);
}

#[test]
fn original_scale_gradients_include_the_nugget() {
    let coords = uniform_coords(30, 2, 9);
    let cov = CovFunction::Exponential;
    // absolute variance s, range, nugget ν; the kernel sees σ² = s / ν
    let theta = [0.9, 0.3, 0.2];
    let options = |calc_gradient: bool, nugget: f64| FactorOptions {
        calc_gradient,
        transf_scale: false,
        nugget_var: nugget,
        calc_gradient_nugget: calc_gradient,
    };
    let eval = |theta: &[f64], calc_gradient: bool| {
        let pars = [theta[0] / theta[2], theta[1]];
        let components =
            VecchiaComponents::create(coords.view(), None, cov.clone(), &pars, config(10), None).expect("components");
        build_factor(&components, &options(calc_gradient, theta[2])).expect("factor")
    };
    let factor = eval(&theta, true);
    assert_eq!(factor.gradients().len(), 3);
    let fd = finite_differences(|t| eval(t, false), &theta, 1e-6);
    assert_gradients_match(&factor, &fd);
}

#[test]
fn full_scale_gradients_match_finite_differences() {
    let coords = uniform_coords(30, 2, 13);
    let inducing = uniform_coords(6, 2, 14);
    let cov = CovFunction::Exponential;
    let pars = [1.1, 0.35];
    let cfg = VecchiaConfig {
        approximation: Approximation::FullScaleVecchia,
        ..config(10)
    };
    let mut components =
        VecchiaComponents::create(coords.view(), None, cov, &pars, cfg.clone(), Some(inducing.view()))
            .expect("components");
    let factor = calc_cov_factor(&mut components, &pars, &FactorOptions::with_gradient()).expect("factor");
    assert!(factor.gradients().iter().all(Option::is_some));

    let log_theta: Vec<f64> = pars.iter().map(|p| p.ln()).collect();
    let fd = finite_differences(
        |theta| {
            let pars: Vec<f64> = theta.iter().map(|t| t.exp()).collect();
            let mut comps = VecchiaComponents::create(
                coords.view(),
                None,
                CovFunction::Exponential,
                &pars,
                cfg.clone(),
                Some(inducing.view()),
            )
            .expect("components");
            calc_cov_factor(&mut comps, &pars, &FactorOptions::default()).expect("factor")
        },
        &log_theta,
        1e-5,
    );
    assert_gradients_match(&factor, &fd);
}

#[test]
fn full_scale_factor_is_exact_for_the_residual_process() {
    let n = 40;
    let coords = uniform_coords(n, 2, 21);
    let inducing = uniform_coords(8, 2, 22);
    let cov = CovFunction::Exponential;
    let pars = [1.0, 0.3];
    let cfg = VecchiaConfig {
        approximation: Approximation::FullScaleVecchia,
        ..config(n - 1)
    };
    let components = VecchiaComponents::create(coords.view(), None, cov.clone(), &pars, cfg, Some(inducing.view()))
        .expect("components");
    let factor = build_factor(&components, &FactorOptions::default()).expect("factor");
    let ctx = components.full_scale().expect("full-scale context");

    // residual covariance K − Σ_cross Σ_ip⁻¹ Σ_crossᵀ + I
    let low_rank = ctx.whitened.dot(&ctx.whitened.t());
    let resid = response_covariance(&cov, &pars, &coords) - low_rank;
    let b = sparse_to_dense(factor.b());
    let precision = b.t().dot(&Array2::from_diag(factor.d_inv())).dot(&b);
    let exact = spd_inverse(&resid);
    assert!(max_abs_diff(precision.iter(), exact.iter()) < 1e-6);
}

#[test]
fn random_coefficients_at_full_conditioning_are_exact() {
    let n = 25;
    let coords = uniform_coords(n, 2, 31);
    let z = uniform_coords(n, 1, 32).mapv(|v| 2.0 * v - 1.0);
    let cov = CovFunction::Exponential;
    let pars = [1.0, 0.3, 0.6, 0.5];
    let components =
        VecchiaComponents::create(coords.view(), Some(z.view()), cov.clone(), &pars, config(n - 1), None)
            .expect("components");
    assert_eq!(components.main_components().len(), 2);
    assert_eq!(components.z_outer_z().len(), n);
    let factor = build_factor(&components, &FactorOptions::default()).expect("factor");

    let k0 = response_covariance(&cov, &pars[..2], &coords);
    let k1 = response_covariance(&cov, &pars[2..], &coords) - Array2::<f64>::eye(n);
    let zz = Array2::from_shape_fn((n, n), |(i, j)| z[[i, 0]] * z[[j, 0]]);
    let sigma = k0 + k1 * zz;
    let b = sparse_to_dense(factor.b());
    let precision = b.t().dot(&Array2::from_diag(factor.d_inv())).dot(&b);
    let exact = spd_inverse(&sigma);
    assert!(max_abs_diff(precision.iter(), exact.iter()) < 1e-8);
}

#[test]
fn negative_log_likelihood_matches_the_dense_density() {
    let n = 30;
    let coords = uniform_coords(n, 2, 41);
    let y = response(&coords, 42);
    let cov = CovFunction::Gaussian;
    let pars = [0.8, 0.3];
    let components =
        VecchiaComponents::create(coords.view(), None, cov.clone(), &pars, config(n - 1), None).expect("components");
    let factor = build_factor(&components, &FactorOptions::default()).expect("factor");
    let y_ordered = components.to_vecchia_order(y.view());

    let sigma = response_covariance(&cov, &pars, &coords);
    let l = sigma.cholesky(Side::Lower).expect("spd").lower_triangular();
    let log_det: f64 = l.diag().iter().map(|v| 2.0 * v.ln()).sum();
    let quad = y.dot(&spd_inverse(&sigma).dot(&y));
    let exact = 0.5 * (n as f64 * (2.0 * std::f64::consts::PI).ln() + log_det + quad);
    assert_relative_eq!(factor.neg_log_likelihood(&y_ordered), exact, max_relative = 1e-8);
}
