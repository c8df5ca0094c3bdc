mod common;

use common::{exact_latent_prediction, max_abs_diff, response, spd_inverse, uniform_coords};
use ndarray::{array, concatenate, Array1, Array2, Axis};
use vecchia_gp::covariance::dense_covariance;
use vecchia_gp::linalg::sparse_get;
use vecchia_gp::{
    predict, Approximation, CovFunction, Likelihood, NeighborSelection, Parallelism, PredictOptions, Prediction,
    PredictionType, VecchiaComponents, VecchiaConfig, VecchiaError, VecchiaOrdering,
};

const ALL_MOMENTS: PredictOptions = PredictOptions {
    calc_pred_cov: true,
    calc_pred_var: true,
    predict_response: true,
};

fn config(num_neighbors: usize, num_neighbors_pred: usize) -> VecchiaConfig {
    VecchiaConfig {
        num_neighbors,
        num_neighbors_pred: Some(num_neighbors_pred),
        parallelism: Parallelism::with_threads(2),
        ..VecchiaConfig::default()
    }
}

struct Setup {
    coords: Array2<f64>,
    y: Array1<f64>,
    coords_pred: Array2<f64>,
    cov: CovFunction,
    pars: Vec<f64>,
}

fn setup(n: usize, n_p: usize) -> Setup {
    let coords = uniform_coords(n, 2, 101);
    let y = response(&coords, 102);
    Setup {
        coords,
        y,
        coords_pred: uniform_coords(n_p, 2, 103),
        cov: CovFunction::Exponential,
        pars: vec![1.2, 0.3],
    }
}

impl Setup {
    fn components(&self, config: VecchiaConfig) -> VecchiaComponents {
        VecchiaComponents::create(self.coords.view(), None, self.cov.clone(), &self.pars, config, None)
            .expect("components")
    }

    /// Latent mean and covariance of exact GP conditioning.
    fn exact(&self) -> (Array1<f64>, Array2<f64>) {
        exact_latent_prediction(&self.cov, &self.pars, &self.coords, &self.y, &self.coords_pred)
    }

    fn predict(&self, components: &VecchiaComponents, pred_type: PredictionType, options: &PredictOptions) -> Prediction {
        predict(
            components,
            pred_type,
            Some(self.y.view()),
            self.coords_pred.view(),
            None,
            options,
        )
        .expect("prediction")
        .into_moments()
        .expect("gaussian moments")
    }
}

fn response_cov(latent: &Array2<f64>) -> Array2<f64> {
    latent + &Array2::<f64>::eye(latent.nrows())
}

#[test]
fn moderate_conditioning_sets_approximate_the_exact_predictive_distribution() {
    let s = setup(100, 20);
    let components = s.components(config(15, 15));
    let (mean, cov) = s.exact();
    let pred = s.predict(&components, PredictionType::ObservedFirstCondObsOnly, &PredictOptions::default());
    assert_eq!(pred.mean.len(), 20);
    assert!(pred.cov.is_none());
    assert!(max_abs_diff(pred.mean.iter(), mean.iter()) < 0.1);
    let var_exact = response_cov(&cov).diag().to_owned();
    assert!(max_abs_diff(pred.var.expect("variances").iter(), var_exact.iter()) < 0.1);
}

#[test]
fn observed_first_routes_are_exact_at_full_conditioning() {
    let s = setup(40, 8);
    let components = s.components(config(39, 48));
    let (mean, cov) = s.exact();
    let cov = response_cov(&cov);

    let obs_only = s.predict(&components, PredictionType::ObservedFirstCondObsOnly, &ALL_MOMENTS);
    assert!(max_abs_diff(obs_only.mean.iter(), mean.iter()) < 1e-8);
    let var = obs_only.var.expect("variances");
    assert!(max_abs_diff(var.iter(), cov.diag().iter()) < 1e-8);
    // prediction points are conditionally independent given the observations
    let cov_obs_only = obs_only.cov.expect("covariance");
    assert_eq!(cov_obs_only[[0, 1]], 0.0);

    let cond_all = s.predict(&components, PredictionType::ObservedFirstCondAll, &ALL_MOMENTS);
    assert!(max_abs_diff(cond_all.mean.iter(), mean.iter()) < 1e-8);
    assert!(max_abs_diff(cond_all.cov.expect("covariance").iter(), cov.iter()) < 1e-8);
    assert!(max_abs_diff(cond_all.var.expect("variances").iter(), cov.diag().iter()) < 1e-8);
}

#[test]
fn predicted_first_route_is_exact_at_full_conditioning() {
    let s = setup(40, 8);
    let components = s.components(config(39, 48));
    let (mean, cov) = s.exact();
    let cov = response_cov(&cov);
    let pred = s.predict(&components, PredictionType::PredictedFirst, &ALL_MOMENTS);
    assert!(max_abs_diff(pred.mean.iter(), mean.iter()) < 1e-8);
    assert!(max_abs_diff(pred.cov.expect("covariance").iter(), cov.iter()) < 1e-8);
    assert!(max_abs_diff(pred.var.expect("variances").iter(), cov.diag().iter()) < 1e-8);
}

#[test]
fn latent_routes_are_exact_at_full_conditioning() {
    let s = setup(40, 8);
    let components = s.components(config(39, 48));
    let (mean, cov) = s.exact();
    let latent = PredictOptions {
        predict_response: false,
        ..ALL_MOMENTS
    };

    let obs_only = s.predict(&components, PredictionType::LatentObservedFirstCondObsOnly, &latent);
    assert!(max_abs_diff(obs_only.mean.iter(), mean.iter()) < 1e-8);
    assert!(max_abs_diff(obs_only.var.expect("variances").iter(), cov.diag().iter()) < 1e-8);

    let cond_all = s.predict(&components, PredictionType::LatentObservedFirstCondAll, &latent);
    assert!(max_abs_diff(cond_all.mean.iter(), mean.iter()) < 1e-8);
    assert!(max_abs_diff(cond_all.cov.expect("covariance").iter(), cov.iter()) < 1e-8);

    let with_nugget = s.predict(&components, PredictionType::LatentObservedFirstCondAll, &ALL_MOMENTS);
    let shifted = cov.diag().mapv(|v| v + 1.0);
    assert!(max_abs_diff(with_nugget.var.expect("variances").iter(), shifted.iter()) < 1e-8);
}

#[test]
fn latent_prediction_at_an_observed_location_shares_the_latent_value() {
    let s = setup(30, 3);
    let mut coords_pred = s.coords_pred.clone();
    coords_pred.row_mut(1).assign(&s.coords.row(4));
    let s = Setup { coords_pred, ..s };
    let components = s.components(config(29, 32));
    let (mean, cov) = s.exact();
    let latent = PredictOptions {
        predict_response: false,
        ..ALL_MOMENTS
    };
    let pred = s.predict(&components, PredictionType::LatentObservedFirstCondAll, &latent);
    assert!(max_abs_diff(pred.mean.iter(), mean.iter()) < 1e-8);
    assert!(max_abs_diff(pred.cov.expect("covariance").iter(), cov.iter()) < 1e-8);
}

#[test]
fn predict_response_false_removes_the_nugget() {
    let s = setup(60, 10);
    let components = s.components(config(10, 10));
    let response = s.predict(&components, PredictionType::ObservedFirstCondAll, &ALL_MOMENTS);
    let latent = s.predict(
        &components,
        PredictionType::ObservedFirstCondAll,
        &PredictOptions {
            predict_response: false,
            ..ALL_MOMENTS
        },
    );
    assert_eq!(response.mean, latent.mean);
    let diff = response.var.expect("variances") - latent.var.expect("variances");
    assert!(diff.iter().all(|d| (d - 1.0).abs() < 1e-12));
}

#[test]
fn random_ordering_keeps_input_order_of_the_results() {
    let s = setup(40, 8);
    let components = s.components(VecchiaConfig {
        ordering: VecchiaOrdering::Random,
        seed: 17,
        ..config(39, 48)
    });
    assert_ne!(components.data_indices(), (0..40).collect::<Vec<_>>().as_slice());
    let (mean, cov) = s.exact();
    let pred = s.predict(&components, PredictionType::ObservedFirstCondAll, &ALL_MOMENTS);
    assert!(max_abs_diff(pred.mean.iter(), mean.iter()) < 1e-8);
    let cov = response_cov(&cov);
    assert!(max_abs_diff(pred.cov.expect("covariance").iter(), cov.iter()) < 1e-8);
}

#[test]
fn random_coefficient_prediction_is_exact_at_full_conditioning() {
    let s = setup(30, 6);
    let z = uniform_coords(30, 1, 104).mapv(|v| v + 0.5);
    let z_pred = uniform_coords(6, 1, 105).mapv(|v| v + 0.5);
    let pars = [1.0, 0.3, 0.5, 0.6];
    let components = VecchiaComponents::create(s.coords.view(), Some(z.view()), s.cov.clone(), &pars, config(29, 36), None)
        .expect("components");
    let pred = predict(
        &components,
        PredictionType::ObservedFirstCondAll,
        Some(s.y.view()),
        s.coords_pred.view(),
        Some(z_pred.view()),
        &ALL_MOMENTS,
    )
    .expect("prediction")
    .into_moments()
    .expect("moments");

    let coords_all = concatenate(Axis(0), &[s.coords.view(), s.coords_pred.view()]).expect("stack");
    let z_all = concatenate(Axis(0), &[z.view(), z_pred.view()]).expect("stack");
    let k0 = dense_covariance(&s.cov, &pars[..2], coords_all.view(), coords_all.view()).expect("k0");
    let k1 = dense_covariance(&s.cov, &pars[2..], coords_all.view(), coords_all.view()).expect("k1");
    let sigma = Array2::from_shape_fn((36, 36), |(a, b)| {
        k0[[a, b]] + z_all[[a, 0]] * z_all[[b, 0]] * k1[[a, b]] + if a == b { 1.0 } else { 0.0 }
    });
    let s_oo = sigma.slice(ndarray::s![..30, ..30]).to_owned();
    let s_po = sigma.slice(ndarray::s![30.., ..30]).to_owned();
    let s_pp = sigma.slice(ndarray::s![30.., 30..]).to_owned();
    let weights = s_po.dot(&spd_inverse(&s_oo));
    let mean = weights.dot(&s.y);
    let cov = &s_pp - &weights.dot(&s_po.t());
    assert!(max_abs_diff(pred.mean.iter(), mean.iter()) < 1e-8);
    assert!(max_abs_diff(pred.cov.expect("covariance").iter(), cov.iter()) < 1e-8);
}

fn full_scale_setup(selection: NeighborSelection) -> (Setup, VecchiaComponents) {
    let s = setup(40, 8);
    let inducing = uniform_coords(6, 2, 106);
    let cfg = VecchiaConfig {
        approximation: Approximation::FullScaleVecchia,
        neighbor_selection: selection,
        ..config(39, 48)
    };
    let components =
        VecchiaComponents::create(s.coords.view(), None, s.cov.clone(), &s.pars, cfg, Some(inducing.view()))
            .expect("components");
    (s, components)
}

#[test]
fn full_scale_prediction_is_exact_at_full_conditioning() {
    for selection in [NeighborSelection::Nearest, NeighborSelection::ResidualCorrelation] {
        let (s, components) = full_scale_setup(selection);
        let (mean, cov) = s.exact();
        let cov = response_cov(&cov);
        for pred_type in [PredictionType::ObservedFirstCondObsOnly, PredictionType::ObservedFirstCondAll] {
            let pred = s.predict(&components, pred_type, &ALL_MOMENTS);
            assert!(max_abs_diff(pred.mean.iter(), mean.iter()) < 1e-6, "{selection:?} {pred_type:?}");
            let var = pred.var.expect("variances");
            assert!(max_abs_diff(var.iter(), cov.diag().iter()) < 1e-6, "{selection:?} {pred_type:?}");
        }
        let cond_all = s.predict(&components, PredictionType::ObservedFirstCondAll, &ALL_MOMENTS);
        assert!(max_abs_diff(cond_all.cov.expect("covariance").iter(), cov.iter()) < 1e-6);
    }
}

#[test]
fn full_scale_rejects_latent_and_predicted_first_routes() {
    let (s, components) = full_scale_setup(NeighborSelection::Nearest);
    for pred_type in [PredictionType::PredictedFirst, PredictionType::LatentObservedFirstCondAll] {
        let err = predict(
            &components,
            pred_type,
            Some(s.y.view()),
            s.coords_pred.view(),
            None,
            &ALL_MOMENTS,
        )
        .expect_err("unsupported route");
        assert!(matches!(err, VecchiaError::InvalidConfiguration(_)));
    }
}

#[test]
fn non_gaussian_likelihoods_receive_prediction_factors() {
    let s = setup(50, 7);
    let components = s.components(VecchiaConfig {
        likelihood: Likelihood::NonGaussian,
        ..config(8, 8)
    });
    let factors = predict(
        &components,
        PredictionType::ObservedFirstCondAll,
        None,
        s.coords_pred.view(),
        None,
        &PredictOptions::default(),
    )
    .expect("prediction")
    .into_factors()
    .expect("factors");
    assert_eq!((factors.bpo.nrows(), factors.bpo.ncols()), (7, 50));
    assert_eq!((factors.bp.nrows(), factors.bp.ncols()), (7, 7));
    for r in 0..7 {
        assert_eq!(sparse_get(&factors.bp, r, r), 1.0);
    }
    assert!(factors.dp.iter().all(|&d| d > 0.0));

    let err = predict(
        &components,
        PredictionType::PredictedFirst,
        Some(s.y.view()),
        s.coords_pred.view(),
        None,
        &PredictOptions::default(),
    )
    .expect_err("gaussian only");
    assert!(matches!(err, VecchiaError::InvalidConfiguration(_)));
}

#[test]
fn prediction_coordinates_must_match_the_training_dimension() {
    let s = setup(20, 2);
    let components = s.components(config(5, 5));
    let err = predict(
        &components,
        PredictionType::ObservedFirstCondObsOnly,
        Some(s.y.view()),
        array![[0.1, 0.2, 0.3]].view(),
        None,
        &PredictOptions::default(),
    )
    .expect_err("dimension mismatch");
    assert!(matches!(err, VecchiaError::DimensionMismatch { .. }));
}
