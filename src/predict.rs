//! Predictive distributions obtained by extending the Vecchia factor to new locations.
//!
//! All routes work on the transformed scale, i.e. with nugget variance 1 for Gaussian
//! likelihoods. Observed data enter in input order; predictions follow the order of the
//! prediction coordinates.

use crate::algo::{find_nearest_neighbors, NeighborDistances, NeighborQuery, NeighborSet};
use crate::components::{rand_coef_outer_products, VecchiaComponents, MIN_RESIDUAL_VARIANCE};
use crate::config::PredictionType;
use crate::covariance::{dense_covariance, CovarianceFunction, ScaleOptions};
use crate::error::VecchiaError;
use crate::factor::{build_factor, factorize_neighbor_block, ConditioningSource, FactorOptions};
use crate::linalg::{
    factorize_sparse_spd, solve_lower_triangular, sparse_dense_product, sparse_from_triplets,
    sparse_lower_inverse, sparse_lower_solve, sparse_lower_solve_mat, sparse_lower_transpose_solve,
    sparse_matvec, sparse_t_matvec, sparse_to_dense, weighted_gram_upper, SparseMatrix,
};
use crate::metric::{Euclidean, Metric, ResidualCorrelation};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;

/// Prediction counts above which a full predictive covariance is reported in the log.
const LARGE_PREDICTION: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredictOptions {
    pub calc_pred_cov: bool,
    pub calc_pred_var: bool,
    /// Include the nugget in variances and covariances.
    pub predict_response: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        PredictOptions {
            calc_pred_cov: false,
            calc_pred_var: true,
            predict_response: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Prediction {
    pub mean: Array1<f64>,
    pub cov: Option<Array2<f64>>,
    pub var: Option<Array1<f64>>,
}

/// Prediction blocks handed to a non-Gaussian likelihood: rows of `[Bpo Bp]` with conditional
/// variances `dp`.
#[derive(Clone, Debug)]
pub struct PredictionFactors {
    pub bpo: SparseMatrix,
    pub bp: SparseMatrix,
    pub dp: Array1<f64>,
}

#[derive(Clone, Debug)]
pub enum PredictionOutcome {
    Moments(Prediction),
    Factors(PredictionFactors),
}

impl PredictionOutcome {
    pub fn into_moments(self) -> Option<Prediction> {
        match self {
            PredictionOutcome::Moments(p) => Some(p),
            PredictionOutcome::Factors(_) => None,
        }
    }

    pub fn into_factors(self) -> Option<PredictionFactors> {
        match self {
            PredictionOutcome::Factors(f) => Some(f),
            PredictionOutcome::Moments(_) => None,
        }
    }
}

/// Predicts at `coords_pred` with the route selected by `pred_type`.
///
/// `y` is the observed response in input order; it may be omitted only for non-Gaussian
/// likelihoods, which receive the prediction factors instead of moments.
pub fn predict(
    components: &VecchiaComponents,
    pred_type: PredictionType,
    y: Option<ArrayView1<'_, f64>>,
    coords_pred: ArrayView2<'_, f64>,
    rand_coef_pred: Option<ArrayView2<'_, f64>>,
    options: &PredictOptions,
) -> Result<PredictionOutcome, VecchiaError> {
    let start = Instant::now();
    let outcome = match pred_type {
        PredictionType::ObservedFirstCondObsOnly => {
            predict_observed_first(components, true, y, coords_pred, rand_coef_pred, options)?
        }
        PredictionType::ObservedFirstCondAll => {
            predict_observed_first(components, false, y, coords_pred, rand_coef_pred, options)?
        }
        PredictionType::PredictedFirst => PredictionOutcome::Moments(predict_predicted_first(
            components,
            required_response(y)?,
            coords_pred,
            rand_coef_pred,
            options,
        )?),
        PredictionType::LatentObservedFirstCondObsOnly => PredictionOutcome::Moments(
            predict_latent_observed_first(components, true, required_response(y)?, coords_pred, options)?,
        ),
        PredictionType::LatentObservedFirstCondAll => PredictionOutcome::Moments(
            predict_latent_observed_first(components, false, required_response(y)?, coords_pred, options)?,
        ),
    };
    log::debug!(
        "prediction '{}' for {} points took {:.3?}",
        pred_type.as_str(),
        coords_pred.nrows(),
        start.elapsed()
    );
    Ok(outcome)
}

fn required_response(y: Option<ArrayView1<'_, f64>>) -> Result<ArrayView1<'_, f64>, VecchiaError> {
    y.ok_or_else(|| {
        VecchiaError::InvalidConfiguration("the observed response is required for this prediction".to_string())
    })
}

/// Observed points first, prediction points conditioning on observed points only
/// (`cond_obs_only`) or on observed and earlier prediction points.
pub fn predict_observed_first(
    components: &VecchiaComponents,
    cond_obs_only: bool,
    y: Option<ArrayView1<'_, f64>>,
    coords_pred: ArrayView2<'_, f64>,
    rand_coef_pred: Option<ArrayView2<'_, f64>>,
    options: &PredictOptions,
) -> Result<PredictionOutcome, VecchiaError> {
    let config = components.config();
    let gaussian = config.likelihood.is_gaussian();
    let n_o = components.num_data();
    let n_p = coords_pred.nrows();
    check_pred_coords(components, coords_pred)?;
    let coords_all = concatenate(Axis(0), &[components.coords(), coords_pred.reborrow()])
        .map_err(|e| VecchiaError::InvalidConfiguration(e.to_string()))?;
    let z_all = stacked_rand_coef(components, rand_coef_pred, n_p, true)?;
    let cov = components.cov_function();
    let pars0 = components.component_pars(0);

    // whitened cross-covariances of all points, observed rows first
    let full_scale = match components.full_scale() {
        Some(ctx) => {
            let sigma_pred_ip = dense_covariance(cov, pars0, coords_pred, ctx.inducing_points.view())?;
            let whitened_pred =
                solve_lower_triangular(&ctx.chol_ip().lower_triangular(), &sigma_pred_ip.t().to_owned())
                    .reversed_axes();
            let whitened_all = concatenate(Axis(0), &[ctx.whitened.view(), whitened_pred.view()])
                .map_err(|e| VecchiaError::InvalidConfiguration(e.to_string()))?;
            Some((sigma_pred_ip, whitened_pred, whitened_all))
        }
        None => None,
    };

    let query = NeighborQuery {
        num_neighbors: config.num_neighbors_pred(),
        start_at: n_o,
        end_search_at: if cond_obs_only { Some(n_o - 1) } else { None },
        prediction: true,
        cond_on_all: !cond_obs_only,
        num_data_obs: n_o,
        check_has_duplicates: !cond_obs_only && !gaussian,
        save_distances: cov.should_save_distances(),
        base: config.cover_tree_base,
        num_segments: config.parallelism.num_segments(),
    };
    let set = match &full_scale {
        Some((_, _, whitened_all)) if config.uses_residual_correlation() => {
            let resid_var: Array1<f64> = whitened_all
                .rows()
                .into_iter()
                .map(|w| (pars0[0] - w.dot(&w)).max(MIN_RESIDUAL_VARIANCE))
                .collect();
            let metric = ResidualCorrelation::new(
                coords_all.view(),
                whitened_all.view(),
                resid_var.view(),
                cov,
                pars0,
            );
            search(components, &metric, coords_all.view(), &query)?
        }
        _ => euclidean_search(components, coords_all.view(), &query)?,
    };
    if set.has_duplicates {
        return Err(VecchiaError::DuplicateCoordinates(
            "duplicates between training and prediction locations are not supported for \
             non-Gaussian likelihoods when conditioning on all points; add a small jitter"
                .to_string(),
        ));
    }

    let nugget = if gaussian { 1.0 } else { 0.0 };
    let source = conditioning_source(components, coords_all.view());
    let whitened_all = full_scale.as_ref().map(|(_, _, w)| w.view());
    let rows = regress_points(
        components,
        &source,
        n_o,
        &set,
        z_all.as_ref().map(|z| z.view()),
        nugget,
        whitened_all,
    )?;

    let mut bpo_entries = Vec::new();
    let mut bp_entries = Vec::with_capacity(n_p);
    for (r, row) in rows.iter().enumerate() {
        for (&nb, &a) in set.neighbors[r].iter().zip(row.a.iter()) {
            if nb < n_o {
                bpo_entries.push((r, nb, -a));
            } else {
                bp_entries.push((r, nb - n_o, -a));
            }
        }
        bp_entries.push((r, r, 1.0));
    }
    let bpo = sparse_from_triplets(n_p, n_o, &bpo_entries)?;
    let bp = sparse_from_triplets(n_p, n_p, &bp_entries)?;
    let dp: Array1<f64> = rows.iter().map(|row| row.d).collect();

    if !gaussian {
        return Ok(PredictionOutcome::Factors(PredictionFactors { bpo, bp, dp }));
    }
    let y = components.to_vecchia_order(required_response(y)?);
    if options.calc_pred_cov && n_p > LARGE_PREDICTION {
        log::info!("Calculating the predictive covariance matrix for {n_p} points; this can be slow");
    }

    let mut prediction = match (components.full_scale(), full_scale) {
        (Some(ctx), Some((sigma_pred_ip, whitened_pred, _))) => {
            let factor = build_factor(components, &FactorOptions::default())?;
            let wood = ctx.woodbury(&factor, &y)?;
            // residual part of the observations
            let low_rank = ctx
                .sigma_cross
                .dot(&wood.chol.solve_vec(&wood.precision_cross.t().dot(&y)));
            let y_resid = &y - &low_rank;
            let mut mean = sparse_matvec(&bpo, &y_resid).mapv(|v| -v);
            if !cond_obs_only {
                sparse_lower_solve(&bp, &mut mean);
            }
            let ip_part = ctx.chol_ip().solve_vec(&ctx.sigma_cross.t().dot(&wood.y_aux));
            mean += &sigma_pred_ip.dot(&ip_part);

            let (mut cov_mat, mut var) = vecchia_moments(&bp, &dp, cond_obs_only, options);
            if options.calc_pred_cov || options.calc_pred_var {
                let ppv = whitened_pred.dot(&ctx.whitened.t()).dot(&wood.precision_cross);
                let mut x = sparse_dense_product(&bpo, &ctx.sigma_cross);
                if !cond_obs_only {
                    sparse_lower_solve_mat(&bp, &mut x);
                }
                let ppv_w = wood.chol.solve_mat(&ppv.t().to_owned());
                let x_w = wood.chol.solve_mat(&x.t().to_owned());
                let s = ctx.chol_ip().solve_mat(&sigma_pred_ip.t().to_owned());
                if let Some(cov_mat) = cov_mat.as_mut() {
                    let xs = x.dot(&s);
                    let x_ppv_w = x.dot(&ppv_w);
                    *cov_mat += &sigma_pred_ip.dot(&s);
                    *cov_mat -= &ppv.dot(&s);
                    *cov_mat += &xs;
                    *cov_mat += &xs.t();
                    *cov_mat -= &x_ppv_w;
                    *cov_mat += &ppv.dot(&ppv_w);
                    *cov_mat -= &x_ppv_w.t();
                    *cov_mat += &x.dot(&x_w);
                }
                if let Some(var) = var.as_mut() {
                    for i in 0..n_p {
                        let lhs = &sigma_pred_ip.row(i) - &ppv.row(i) + &(&x.row(i) * 2.0);
                        var[i] += lhs.dot(&s.column(i))
                            + (&ppv.row(i) - &(&x.row(i) * 2.0)).dot(&ppv_w.column(i))
                            + x.row(i).dot(&x_w.column(i));
                    }
                }
            }
            Prediction { mean, cov: cov_mat, var }
        }
        _ => {
            let mut mean = sparse_matvec(&bpo, &y).mapv(|v| -v);
            if !cond_obs_only {
                sparse_lower_solve(&bp, &mut mean);
            }
            let (cov, var) = vecchia_moments(&bp, &dp, cond_obs_only, options);
            Prediction { mean, cov, var }
        }
    };
    if !options.predict_response {
        remove_nugget(&mut prediction, 1.0);
    }
    Ok(PredictionOutcome::Moments(prediction))
}

/// Prediction points first, observed points conditioning on prediction points and earlier
/// observations.
pub fn predict_predicted_first(
    components: &VecchiaComponents,
    y: ArrayView1<'_, f64>,
    coords_pred: ArrayView2<'_, f64>,
    rand_coef_pred: Option<ArrayView2<'_, f64>>,
    options: &PredictOptions,
) -> Result<Prediction, VecchiaError> {
    check_gaussian_route(components, "order_pred_first")?;
    check_pred_coords(components, coords_pred)?;
    let config = components.config();
    let n_o = components.num_data();
    let n_p = coords_pred.nrows();
    let coords_all = concatenate(Axis(0), &[coords_pred.reborrow(), components.coords()])
        .map_err(|e| VecchiaError::InvalidConfiguration(e.to_string()))?;
    let z_all = stacked_rand_coef(components, rand_coef_pred, n_p, false)?;
    let query = NeighborQuery {
        save_distances: components.cov_function().should_save_distances(),
        base: config.cover_tree_base,
        num_segments: config.parallelism.num_segments(),
        ..NeighborQuery::training(n_o + n_p, config.num_neighbors_pred())
    };
    let set = euclidean_search(components, coords_all.view(), &query)?;
    let source = conditioning_source(components, coords_all.view());
    let rows = regress_points(components, &source, 0, &set, z_all.as_ref().map(|z| z.view()), 1.0, None)?;

    let mut bp_entries = Vec::new();
    let mut bop_entries = Vec::new();
    let mut bo_entries = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        for (&nb, &a) in set.neighbors[i].iter().zip(row.a.iter()) {
            if i < n_p {
                bp_entries.push((i, nb, -a));
            } else if nb < n_p {
                bop_entries.push((i - n_p, nb, -a));
            } else {
                bo_entries.push((i - n_p, nb - n_p, -a));
            }
        }
        if i < n_p {
            bp_entries.push((i, i, 1.0));
        } else {
            bo_entries.push((i - n_p, i - n_p, 1.0));
        }
    }
    let bp = sparse_from_triplets(n_p, n_p, &bp_entries)?;
    let bop = sparse_from_triplets(n_o, n_p, &bop_entries)?;
    let bo = sparse_from_triplets(n_o, n_o, &bo_entries)?;
    let dp_inv: Array1<f64> = rows[..n_p].iter().map(|row| 1.0 / row.d).collect();
    let do_inv: Array1<f64> = rows[n_p..].iter().map(|row| 1.0 / row.d).collect();

    let cond_prec = weighted_gram_upper(n_p, &[(&bp, &dp_inv), (&bop, &do_inv)], None)?;
    let cond_prec = factorize_sparse_spd(&cond_prec)?;
    let y = components.to_vecchia_order(y);
    let bo_y = sparse_matvec(&bo, &y) * &do_inv;
    let mean = cond_prec.solve_vec(&sparse_t_matvec(&bop, &bo_y)).mapv(|v| -v);

    let (cov, var) = if options.calc_pred_cov || options.calc_pred_var {
        if options.calc_pred_cov && n_p > LARGE_PREDICTION {
            log::info!("Calculating the predictive covariance matrix for {n_p} points; this can be slow");
        }
        let cov = cond_prec.solve_mat(&Array2::eye(n_p));
        let var = options.calc_pred_var.then(|| cov.diag().to_owned());
        (options.calc_pred_cov.then_some(cov), var)
    } else {
        (None, None)
    };
    let mut prediction = Prediction { mean, cov, var };
    if !options.predict_response {
        remove_nugget(&mut prediction, 1.0);
    }
    Ok(prediction)
}

/// Latent process at the unique observed and prediction locations, observed locations first.
pub fn predict_latent_observed_first(
    components: &VecchiaComponents,
    cond_obs_only: bool,
    y: ArrayView1<'_, f64>,
    coords_pred: ArrayView2<'_, f64>,
    options: &PredictOptions,
) -> Result<Prediction, VecchiaError> {
    check_gaussian_route(components, "latent_order_obs_first")?;
    if components.rand_coef_data().is_some() {
        return Err(VecchiaError::InvalidConfiguration(
            "latent process predictions are not supported for random coefficient processes".to_string(),
        ));
    }
    check_pred_coords(components, coords_pred)?;
    let config = components.config();
    let n_o = components.num_data();
    let n_p = coords_pred.nrows();
    let coords_all = concatenate(Axis(0), &[components.coords(), coords_pred.reborrow()])
        .map_err(|e| VecchiaError::InvalidConfiguration(e.to_string()))?;
    let (unique_rows, unique_index) = unique_coordinates(coords_all.view());
    let n_u = unique_rows.len();
    let n_uo = unique_index[..n_o].iter().copied().max().map_or(0, |m| m + 1);
    let coords_unique = coords_all.select(Axis(0), &unique_rows);

    let z_o = sparse_from_triplets(
        n_o,
        n_u,
        &(0..n_o).map(|r| (r, unique_index[r], 1.0)).collect::<Vec<_>>(),
    )?;
    let z_p = sparse_from_triplets(
        n_p,
        n_u,
        &(0..n_p).map(|r| (r, unique_index[n_o + r], 1.0)).collect::<Vec<_>>(),
    )?;

    let query = NeighborQuery {
        num_neighbors: config.num_neighbors_pred(),
        start_at: 0,
        end_search_at: if cond_obs_only { Some(n_uo - 1) } else { None },
        prediction: cond_obs_only,
        cond_on_all: !cond_obs_only,
        num_data_obs: n_uo,
        check_has_duplicates: true,
        save_distances: components.cov_function().should_save_distances(),
        base: config.cover_tree_base,
        num_segments: config.parallelism.num_segments(),
    };
    let set = euclidean_search(components, coords_unique.view(), &query)?;
    if set.has_duplicates {
        return Err(VecchiaError::DuplicateCoordinates(
            "duplicates found among the neighbors of the unique locations".to_string(),
        ));
    }
    let source = conditioning_source(components, coords_unique.view());
    let rows = regress_points(components, &source, 0, &set, None, 0.0, None)?;
    let mut b_entries = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        b_entries.extend(set.neighbors[i].iter().zip(row.a.iter()).map(|(&nb, &a)| (i, nb, -a)));
        b_entries.push((i, i, 1.0));
    }
    let b = sparse_from_triplets(n_u, n_u, &b_entries)?;
    let d: Array1<f64> = rows.iter().map(|row| row.d).collect();
    let d_inv = d.mapv(|v| 1.0 / v);
    let ones = Array1::<f64>::ones(n_o);
    let m_upper = weighted_gram_upper(n_u, &[(&b, &d_inv), (&z_o, &ones)], None)?;
    let m_factor = factorize_sparse_spd(&m_upper)?;
    let y = components.to_vecchia_order(y);

    let mut prediction = if options.calc_pred_cov || options.calc_pred_var {
        if options.calc_pred_cov && n_p > LARGE_PREDICTION {
            log::info!("Calculating the predictive covariance matrix for {n_p} points; this can be slow");
        }
        let z_o_dense_t = sparse_to_dense(&z_o).reversed_axes();
        // (Z_o Σ Z_oᵀ + I)⁻¹ = I − Z_o M⁻¹ Z_oᵀ
        let obs_inv = Array2::<f64>::eye(n_o) - sparse_dense_product(&z_o, &m_factor.solve_mat(&z_o_dense_t));
        let b_inv = sparse_lower_inverse(&b);
        let zp_b_inv = sparse_dense_product(&z_p, &b_inv);
        let zo_b_inv = sparse_dense_product(&z_o, &b_inv);
        let zp_b_inv_d = &zp_b_inv * &d;
        let zp_sigma_zo = zp_b_inv_d.dot(&zo_b_inv.t());
        let m_aux = zp_sigma_zo.dot(&obs_inv);
        let mean = m_aux.dot(&y);
        let cov = options
            .calc_pred_cov
            .then(|| zp_b_inv_d.dot(&zp_b_inv.t()) - m_aux.dot(&zp_sigma_zo.t()));
        let var = options.calc_pred_var.then(|| {
            Array1::from_shape_fn(n_p, |i| {
                zp_b_inv_d.row(i).dot(&zp_b_inv.row(i)) - m_aux.row(i).dot(&zp_sigma_zo.row(i))
            })
        });
        Prediction { mean, cov, var }
    } else {
        let zo_t_y = sparse_t_matvec(&z_o, &y);
        let resid = &y - &sparse_matvec(&z_o, &m_factor.solve_vec(&zo_t_y));
        let mut v = sparse_t_matvec(&z_o, &resid);
        sparse_lower_transpose_solve(&b, &mut v);
        v *= &d;
        sparse_lower_solve(&b, &mut v);
        Prediction {
            mean: sparse_matvec(&z_p, &v),
            cov: None,
            var: None,
        }
    };
    if options.predict_response {
        add_nugget(&mut prediction, 1.0);
    }
    Ok(prediction)
}

/// Conditional regression of one point on its neighbours.
struct PointRegression {
    a: Array1<f64>,
    d: f64,
}

/// Regression coefficients and conditional variances for points `start_at..` of `coords`,
/// with `nugget` added to the marginal variance and to the neighbour block diagonal.
fn regress_points(
    components: &VecchiaComponents,
    source: &ConditioningSource<'_>,
    start_at: usize,
    set: &NeighborSet<f64>,
    rand_coef_all: Option<ArrayView2<'_, f64>>,
    nugget: f64,
    whitened_all: Option<ArrayView2<'_, f64>>,
) -> Result<Vec<PointRegression>, VecchiaError> {
    let gaussian = components.config().likelihood.is_gaussian();
    let distances: Option<&NeighborDistances<f64>> = set.distances.as_ref();
    let point = |r: usize| -> Result<PointRegression, VecchiaError> {
        let i = start_at + r;
        let nn = &set.neighbors[r];
        let z_outer = match rand_coef_all {
            Some(z) => rand_coef_outer_products(z, i, nn),
            None => Vec::new(),
        };
        let mut d = nugget + source.marginal_variance(&z_outer);
        if let Some(w) = whitened_all {
            d -= w.row(i).dot(&w.row(i));
        }
        if nn.is_empty() {
            return Ok(PointRegression {
                a: Array1::zeros(0),
                d,
            });
        }
        let cached = distances.map(|cache| (&cache.obs[r], &cache.between[r]));
        let blocks = source.blocks(i, nn, cached, &z_outer, false)?;
        let (mut obs, mut between) = (blocks.obs, blocks.between);
        if let Some(w) = whitened_all {
            for (a_pos, &nb) in nn.iter().enumerate() {
                obs[a_pos] -= w.row(nb).dot(&w.row(i));
                for (b_pos, &nb_b) in nn.iter().enumerate() {
                    between[[a_pos, b_pos]] -= w.row(nb).dot(&w.row(nb_b));
                }
            }
        }
        for k in 0..nn.len() {
            between[[k, k]] += nugget;
        }
        let factor = factorize_neighbor_block(i, &between, gaussian)?;
        let a = factor.solve_vec(&obs);
        d -= a.dot(&obs);
        Ok(PointRegression { a, d })
    };
    components.config().parallelism.install(|| {
        (0..set.neighbors.len())
            .into_par_iter()
            .map(point)
            .collect::<Result<Vec<_>, _>>()
    })?
}

fn conditioning_source<'a>(
    components: &'a VecchiaComponents,
    coords: ArrayView2<'a, f64>,
) -> ConditioningSource<'a> {
    ConditioningSource {
        cov: components.cov_function(),
        cov_pars: components.cov_pars().as_slice().unwrap_or(&[]),
        num_par_comp: components.num_par_comp(),
        num_gp: components.main_components().len(),
        coords,
        opts: ScaleOptions::default(),
    }
}

/// Euclidean neighbour search, on range-scaled coordinates for kernels that do not save
/// distances.
fn euclidean_search(
    components: &VecchiaComponents,
    coords: ArrayView2<'_, f64>,
    query: &NeighborQuery,
) -> Result<NeighborSet<f64>, VecchiaError> {
    let cov = components.cov_function();
    if cov.should_save_distances() {
        search(components, &Euclidean::new(coords), coords, query)
    } else {
        let scaled = cov.scale_coordinates(components.component_pars(0), coords);
        search(components, &Euclidean::new(scaled.view()), coords, query)
    }
}

fn search<M: Metric<f64>>(
    components: &VecchiaComponents,
    metric: &M,
    coords: ArrayView2<'_, f64>,
    query: &NeighborQuery,
) -> Result<NeighborSet<f64>, VecchiaError> {
    components
        .config()
        .parallelism
        .install(|| find_nearest_neighbors(metric, coords, query))?
}

fn check_pred_coords(components: &VecchiaComponents, coords_pred: ArrayView2<'_, f64>) -> Result<(), VecchiaError> {
    if coords_pred.ncols() != components.coords().ncols() {
        return Err(VecchiaError::DimensionMismatch {
            what: "prediction coordinate dimension",
            expected: components.coords().ncols(),
            found: coords_pred.ncols(),
        });
    }
    if coords_pred.nrows() == 0 {
        return Err(VecchiaError::InvalidConfiguration(
            "at least one prediction location is required".to_string(),
        ));
    }
    Ok(())
}

fn check_gaussian_route(components: &VecchiaComponents, route: &str) -> Result<(), VecchiaError> {
    if !components.config().likelihood.is_gaussian() {
        return Err(VecchiaError::InvalidConfiguration(format!(
            "prediction type '{route}' is only available for Gaussian likelihoods"
        )));
    }
    if components.full_scale().is_some() {
        return Err(VecchiaError::InvalidConfiguration(format!(
            "prediction type '{route}' is not available for the full-scale Vecchia approximation"
        )));
    }
    Ok(())
}

/// Random-coefficient covariates of observed and prediction points stacked in search order.
fn stacked_rand_coef(
    components: &VecchiaComponents,
    rand_coef_pred: Option<ArrayView2<'_, f64>>,
    n_p: usize,
    observed_first: bool,
) -> Result<Option<Array2<f64>>, VecchiaError> {
    let Some(z_obs) = components.rand_coef_data() else {
        return Ok(None);
    };
    let z_pred = rand_coef_pred.ok_or_else(|| {
        VecchiaError::InvalidConfiguration(
            "random coefficient data for the prediction points is missing".to_string(),
        )
    })?;
    if z_pred.dim() != (n_p, z_obs.ncols()) {
        return Err(VecchiaError::DimensionMismatch {
            what: "random coefficient data of the prediction points",
            expected: n_p * z_obs.ncols(),
            found: z_pred.len(),
        });
    }
    let (z_obs, z_pred) = (z_obs.reborrow(), z_pred.reborrow());
    let parts = if observed_first { [z_obs, z_pred] } else { [z_pred, z_obs] };
    concatenate(Axis(0), &parts)
        .map(Some)
        .map_err(|e| VecchiaError::InvalidConfiguration(e.to_string()))
}

/// Rows of the first occurrence of every distinct coordinate and, per input row, the position of
/// its coordinate among the distinct ones.
fn unique_coordinates(coords: ArrayView2<'_, f64>) -> (Vec<usize>, Vec<usize>) {
    let mut seen: BTreeMap<Vec<u64>, usize> = BTreeMap::new();
    let mut unique_rows = Vec::new();
    let mut unique_index = Vec::with_capacity(coords.nrows());
    for (r, row) in coords.rows().into_iter().enumerate() {
        let key: Vec<u64> = row.iter().map(|v| (v + 0.0).to_bits()).collect();
        let next = unique_rows.len();
        let idx = *seen.entry(key).or_insert(next);
        if idx == next {
            unique_rows.push(r);
        }
        unique_index.push(idx);
    }
    (unique_rows, unique_index)
}

/// Covariance and variances of `Bp⁻¹ Dp Bp⁻ᵀ`, or of `diag(Dp)` when conditioning on observed
/// points only.
fn vecchia_moments(
    bp: &SparseMatrix,
    dp: &Array1<f64>,
    cond_obs_only: bool,
    options: &PredictOptions,
) -> (Option<Array2<f64>>, Option<Array1<f64>>) {
    if cond_obs_only {
        return (
            options.calc_pred_cov.then(|| Array2::from_diag(dp)),
            options.calc_pred_var.then(|| dp.clone()),
        );
    }
    if !options.calc_pred_cov && !options.calc_pred_var {
        return (None, None);
    }
    let bp_inv = sparse_lower_inverse(bp);
    let bp_inv_d = &bp_inv * dp;
    let cov = options.calc_pred_cov.then(|| bp_inv_d.dot(&bp_inv.t()));
    let var = options.calc_pred_var.then(|| {
        Array1::from_shape_fn(dp.len(), |i| bp_inv_d.row(i).dot(&bp_inv.row(i)))
    });
    (cov, var)
}

fn add_nugget(prediction: &mut Prediction, nugget: f64) {
    if let Some(cov) = prediction.cov.as_mut() {
        cov.diag_mut().mapv_inplace(|v| v + nugget);
    }
    if let Some(var) = prediction.var.as_mut() {
        var.mapv_inplace(|v| v + nugget);
    }
}

fn remove_nugget(prediction: &mut Prediction, nugget: f64) {
    add_nugget(prediction, -nugget);
}
