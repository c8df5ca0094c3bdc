//! Sparse Vecchia factor `B`, `D⁻¹` and their derivatives with respect to the covariance
//! parameters.

use crate::components::VecchiaComponents;
use crate::covariance::{CovFunction, CovarianceFunction, PairGeometry, ScaleOptions};
use crate::error::VecchiaError;
use crate::linalg::{
    sparse_dense_product, sparse_from_triplets, sparse_matvec, sparse_t_matvec, SparseMatrix,
    SymmetricFactor,
};
use faer::Side;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Jitter on the neighbour block diagonal for likelihoods without a nugget.
const NON_GAUSSIAN_JITTER: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FactorOptions {
    pub calc_gradient: bool,
    /// Transformed scale: nugget variance 1 and derivatives w.r.t. log-parameters.
    pub transf_scale: bool,
    /// Nugget variance used on the original scale.
    pub nugget_var: f64,
    /// Appends a gradient slot for the nugget variance.
    pub calc_gradient_nugget: bool,
}

impl Default for FactorOptions {
    fn default() -> Self {
        FactorOptions {
            calc_gradient: false,
            transf_scale: true,
            nugget_var: 1.0,
            calc_gradient_nugget: false,
        }
    }
}

impl FactorOptions {
    pub fn with_gradient() -> Self {
        FactorOptions {
            calc_gradient: true,
            ..FactorOptions::default()
        }
    }

    /// Only Gaussian likelihoods carry a nugget to scale back with.
    fn scale(&self, gaussian: bool) -> ScaleOptions {
        ScaleOptions {
            transf_scale: self.transf_scale,
            nugget_var: if gaussian { self.nugget_var } else { 1.0 },
        }
    }
}

/// Derivative of `B` and of the conditional variances `D` for one parameter.
#[derive(Clone, Debug)]
pub struct ParameterGradient {
    pub b: SparseMatrix,
    pub d: Array1<f64>,
}

/// `Σ⁻¹ ≈ Bᵀ D⁻¹ B` for data in Vecchia order.
#[derive(Clone, Debug)]
pub struct VecchiaFactor {
    b: SparseMatrix,
    d_inv: Array1<f64>,
    gradients: Vec<Option<ParameterGradient>>,
}

impl VecchiaFactor {
    pub fn b(&self) -> &SparseMatrix {
        &self.b
    }

    pub fn d_inv(&self) -> &Array1<f64> {
        &self.d_inv
    }

    /// One slot per parameter `[σ²₀, ranges₀…, σ²₁, …, nugget?]`; `None` for excluded slots.
    /// Empty unless gradients were requested.
    pub fn gradients(&self) -> &[Option<ParameterGradient>] {
        &self.gradients
    }

    pub fn num_data(&self) -> usize {
        self.d_inv.len()
    }

    pub fn apply_b(&self, y: &Array1<f64>) -> Array1<f64> {
        sparse_matvec(&self.b, y)
    }

    /// `Bᵀ D⁻¹ B x`.
    pub fn apply_precision(&self, x: &Array1<f64>) -> Array1<f64> {
        let bx = sparse_matvec(&self.b, x) * &self.d_inv;
        sparse_t_matvec(&self.b, &bx)
    }

    /// `Bᵀ D⁻¹ B X`.
    pub fn apply_precision_mat(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut bx = sparse_dense_product(&self.b, x);
        for (mut row, &w) in bx.axis_iter_mut(Axis(0)).zip(self.d_inv.iter()) {
            row *= w;
        }
        let mut out = Array2::<f64>::zeros(x.dim());
        for i in 0..bx.nrows() {
            for (j, v) in crate::linalg::row_entries(&self.b, i) {
                out.row_mut(j).scaled_add(v, &bx.row(i));
            }
        }
        out
    }

    /// Gaussian negative log-likelihood `½(n log 2π + Σ log D_i + (By)ᵀ D⁻¹ (By))` of `y`
    /// (Vecchia order).
    pub fn neg_log_likelihood(&self, y: &Array1<f64>) -> f64 {
        let n = self.d_inv.len() as f64;
        let by = self.apply_b(y);
        let quad: f64 = by
            .iter()
            .zip(self.d_inv.iter())
            .map(|(&r, &w)| r * r * w)
            .sum();
        let log_det: f64 = self.d_inv.iter().map(|&w| -w.ln()).sum();
        0.5 * (n * (2.0 * std::f64::consts::PI).ln() + log_det + quad)
    }
}

/// Covariance between a point and its neighbours (`obs`) and among the neighbours (`between`),
/// summed over GP components, with one derivative block per parameter of every component.
pub(crate) struct LocalBlocks {
    pub obs: Array1<f64>,
    pub between: Array2<f64>,
    pub obs_grad: Vec<Array1<f64>>,
    pub between_grad: Vec<Array2<f64>>,
}

/// Covariance inputs shared by the factor builder and the predictors.
pub(crate) struct ConditioningSource<'a> {
    pub cov: &'a CovFunction,
    /// Parameters of all GP components back to back.
    pub cov_pars: &'a [f64],
    pub num_par_comp: usize,
    pub num_gp: usize,
    /// Coordinates addressed by point and neighbour indices.
    pub coords: ArrayView2<'a, f64>,
    pub opts: ScaleOptions,
}

impl ConditioningSource<'_> {
    fn pars(&self, j: usize) -> &[f64] {
        &self.cov_pars[j * self.num_par_comp..(j + 1) * self.num_par_comp]
    }

    fn scale(&self) -> f64 {
        if self.opts.transf_scale {
            1.0
        } else {
            self.opts.nugget_var
        }
    }

    /// Marginal variance of a point; `z_outer[q]` are the outer products of its
    /// random-coefficient covariates.
    pub fn marginal_variance(&self, z_outer: &[Array2<f64>]) -> f64 {
        let scale = self.scale();
        (0..self.num_gp)
            .map(|j| {
                let z00 = if j == 0 { 1.0 } else { z_outer[j - 1][[0, 0]] };
                scale * self.pars(j)[0] * z00
            })
            .sum()
    }

    /// Derivative of the marginal variance w.r.t. the variance parameter of component `j`.
    pub fn marginal_variance_grad(&self, j: usize, z_outer: &[Array2<f64>]) -> f64 {
        let z00 = if j == 0 { 1.0 } else { z_outer[j - 1][[0, 0]] };
        if self.opts.transf_scale {
            self.pars(j)[0] * z00
        } else {
            z00
        }
    }

    pub fn blocks(
        &self,
        i: usize,
        neighbors: &[usize],
        cached: Option<(&Array1<f64>, &Array2<f64>)>,
        z_outer: &[Array2<f64>],
        calc_gradient: bool,
    ) -> Result<LocalBlocks, VecchiaError> {
        let nn = neighbors.len();
        let mut obs = Array1::<f64>::zeros(nn);
        let mut between = Array2::<f64>::zeros((nn, nn));
        let mut obs_grad = Vec::new();
        let mut between_grad = Vec::new();
        let nb_coords = self.coords.select(Axis(0), neighbors);
        let point = self.coords.slice(s![i..i + 1, ..]);
        let (obs_geometry, between_geometry) = match cached {
            Some((dist_obs, dist_between)) => (
                PairGeometry::Distances(dist_obs.view().insert_axis(Axis(1))),
                PairGeometry::Distances(dist_between.view()),
            ),
            None => (
                PairGeometry::Coordinates {
                    rows: nb_coords.view(),
                    cols: point,
                },
                PairGeometry::Coordinates {
                    rows: nb_coords.view(),
                    cols: nb_coords.view(),
                },
            ),
        };

        for j in 0..self.num_gp {
            let pars = self.pars(j);
            let (mut c, mut c_grad) =
                self.cov
                    .eval_with_gradient(pars, obs_geometry, self.opts, calc_gradient)?;
            let (mut cc, mut cc_grad) =
                self.cov
                    .eval_with_gradient(pars, between_geometry, self.opts, calc_gradient)?;
            if j > 0 {
                let zz = &z_outer[j - 1];
                let z_obs = zz.slice(s![1.., 0..1]);
                let z_between = zz.slice(s![1.., 1..]);
                c *= &z_obs;
                cc *= &z_between;
                c_grad.iter_mut().for_each(|g| *g *= &z_obs);
                cc_grad.iter_mut().for_each(|g| *g *= &z_between);
            }
            obs += &c.column(0);
            between += &cc;
            obs_grad.extend(c_grad.into_iter().map(|g| g.column(0).to_owned()));
            between_grad.extend(cc_grad);
        }
        Ok(LocalBlocks {
            obs,
            between,
            obs_grad,
            between_grad,
        })
    }
}

/// Factorises the neighbour block of point `i`; a failed Cholesky falls back to LDLT for
/// Gaussian likelihoods.
pub(crate) fn factorize_neighbor_block(
    i: usize,
    block: &Array2<f64>,
    gaussian: bool,
) -> Result<SymmetricFactor, VecchiaError> {
    match SymmetricFactor::llt(block, Side::Lower) {
        Ok(factor) => Ok(factor),
        Err(err) if gaussian => {
            log::warn!(
                "Cholesky factorization of the neighbor covariance of point {i} failed ({err}); \
                 falling back to LDLT"
            );
            SymmetricFactor::ldlt(block, Side::Lower)
                .map_err(|source| VecchiaError::LocalCholesky { index: i, source })
        }
        Err(source) => Err(VecchiaError::LocalCholesky { index: i, source }),
    }
}

struct RowFactor {
    a: Array1<f64>,
    d: f64,
    a_grad: Vec<Option<Array1<f64>>>,
    d_grad: Vec<Option<f64>>,
}

/// Sets the parameters of `components` and builds the factor for them.
pub fn calc_cov_factor(
    components: &mut VecchiaComponents,
    pars: &[f64],
    options: &FactorOptions,
) -> Result<VecchiaFactor, VecchiaError> {
    components.set_cov_pars(pars)?;
    build_factor(components, options)
}

/// Builds `B`, `D⁻¹` and the requested gradients for the current parameters of `components`.
pub fn build_factor(
    components: &VecchiaComponents,
    options: &FactorOptions,
) -> Result<VecchiaFactor, VecchiaError> {
    let config = components.config();
    let gaussian = config.likelihood.is_gaussian();
    let full_scale = components.full_scale();
    if full_scale.is_some() && !options.transf_scale {
        return Err(VecchiaError::InvalidConfiguration(
            "the full-scale Vecchia factor is only available on the transformed scale".to_string(),
        ));
    }
    let n = components.num_data();
    let num_gp = components.main_components().len();
    let num_par_comp = components.num_par_comp();
    let num_cov_par = num_par_comp * num_gp;
    let num_par = num_cov_par + usize::from(options.calc_gradient && options.calc_gradient_nugget);
    let exclude_marg_var_grad = !gaussian && num_gp == 1 && full_scale.is_none();
    let source = ConditioningSource {
        cov: components.cov_function(),
        cov_pars: components.cov_pars().as_slice().unwrap_or(&[]),
        num_par_comp,
        num_gp,
        coords: components.coords(),
        opts: options.scale(gaussian),
    };
    let d_init = match (gaussian, options.transf_scale) {
        (true, true) => 1.0,
        (true, false) => options.nugget_var,
        (false, _) => 0.0,
    };
    let block_jitter = if gaussian { d_init } else { NON_GAUSSIAN_JITTER };
    let no_outer: Vec<Array2<f64>> = Vec::new();

    let row = |i: usize| -> Result<RowFactor, VecchiaError> {
        let nn = &components.neighbors()[i];
        let z_outer = components.z_outer_z().get(i).unwrap_or(&no_outer);
        let mut d = d_init + source.marginal_variance(z_outer);
        let mut d_grad: Vec<Option<f64>> = vec![None; num_par];
        let mut a_grad: Vec<Option<Array1<f64>>> = vec![None; num_par];
        if options.calc_gradient {
            for p in 0..num_cov_par {
                if p == 0 && exclude_marg_var_grad {
                    continue;
                }
                d_grad[p] = Some(if p % num_par_comp == 0 {
                    source.marginal_variance_grad(p / num_par_comp, z_outer)
                } else {
                    0.0
                });
                a_grad[p] = Some(Array1::zeros(nn.len()));
            }
            if num_par > num_cov_par {
                d_grad[num_cov_par] = Some(1.0);
                a_grad[num_cov_par] = Some(Array1::zeros(nn.len()));
            }
        }
        if let Some(ctx) = full_scale {
            let w_i = ctx.whitened.row(i);
            d -= w_i.dot(&w_i);
        }

        let mut a = Array1::<f64>::zeros(nn.len());
        if !nn.is_empty() {
            let cached = components
                .distances()
                .map(|cache| (&cache.obs[i], &cache.between[i]));
            let LocalBlocks {
                mut obs,
                mut between,
                mut obs_grad,
                mut between_grad,
            } = source.blocks(i, nn, cached, z_outer, options.calc_gradient)?;
            if let Some(ctx) = full_scale {
                let w_i = ctx.whitened.row(i);
                for (a_pos, &nb) in nn.iter().enumerate() {
                    let w_a = ctx.whitened.row(nb);
                    obs[a_pos] -= w_a.dot(&w_i);
                    for (b_pos, &nb_b) in nn.iter().enumerate() {
                        between[[a_pos, b_pos]] -= w_a.dot(&ctx.whitened.row(nb_b));
                    }
                }
                if options.calc_gradient {
                    let s_i = ctx.ip_inv_cross.row(i);
                    for p in 0..num_par_comp {
                        let g = &ctx.cross_grad[p];
                        let h = &ctx.ipgrad_ip_inv_cross[p];
                        let g_i = g.row(i);
                        let h_i = h.row(i);
                        for (a_pos, &nb) in nn.iter().enumerate() {
                            let s_a = ctx.ip_inv_cross.row(nb);
                            obs_grad[p][a_pos] -= g.row(nb).dot(&s_i) + s_a.dot(&(&g_i - &h_i));
                            for (b_pos, &nb_b) in nn.iter().enumerate() {
                                between_grad[p][[a_pos, b_pos]] -= g.row(nb).dot(&ctx.ip_inv_cross.row(nb_b))
                                    + s_a.dot(&(&g.row(nb_b) - &h.row(nb_b)));
                            }
                        }
                    }
                }
            }
            for k in 0..nn.len() {
                between[[k, k]] += block_jitter;
            }
            let factor = factorize_neighbor_block(i, &between, gaussian)?;
            a = factor.solve_vec(&obs);
            d -= a.dot(&obs);

            if options.calc_gradient {
                for p in 0..num_cov_par {
                    let (Some(ag), Some(dg)) = (a_grad[p].as_mut(), d_grad[p].as_mut()) else {
                        continue;
                    };
                    let rhs = &obs_grad[p] - &between_grad[p].dot(&a);
                    *ag = factor.solve_vec(&rhs);
                    *dg -= ag.dot(&obs) + a.dot(&obs_grad[p]);
                }
                if num_par > num_cov_par {
                    let ag = factor.solve_vec(&a).mapv(|v| -v);
                    d_grad[num_cov_par] = Some(1.0 - ag.dot(&obs));
                    a_grad[num_cov_par] = Some(ag);
                }
            }
        }
        if options.calc_gradient {
            if let Some(ctx) = full_scale {
                let s_i = ctx.ip_inv_cross.row(i);
                for p in 0..num_par_comp {
                    if let Some(dg) = d_grad[p].as_mut() {
                        let g_i = ctx.cross_grad[p].row(i);
                        let h_i = ctx.ipgrad_ip_inv_cross[p].row(i);
                        *dg -= s_i.dot(&(&g_i * 2.0 - &h_i));
                    }
                }
            }
        }
        Ok(RowFactor { a, d, a_grad, d_grad })
    };

    let rows: Vec<RowFactor> = config
        .parallelism
        .install(|| (0..n).into_par_iter().map(row).collect::<Result<Vec<_>, _>>())??;

    if let Some((index, value)) = rows
        .iter()
        .enumerate()
        .map(|(i, r)| (i, r.d))
        .min_by(|a, b| a.1.total_cmp(&b.1))
    {
        if value <= 0.0 {
            if gaussian {
                log::warn!(
                    "The minimum of the conditional variances D[{index}] = {value:e} is not positive; \
                     the Vecchia approximation may be numerically unstable"
                );
            } else {
                return Err(VecchiaError::NonPositiveConditionalVariance { index, value });
            }
        }
    }

    let b = fill_pattern(n, components.entries_init_b(), |i, pos| -rows[i].a[pos])?;
    let d_inv = rows.iter().map(|r| 1.0 / r.d).collect();
    let gradients = if options.calc_gradient {
        (0..num_par)
            .map(|p| {
                if rows.first().map_or(true, |r| r.d_grad[p].is_none()) {
                    return Ok(None);
                }
                let b = fill_pattern(n, components.entries_init_b_grad(), |i, pos| {
                    rows[i].a_grad[p].as_ref().map_or(0.0, |ag| -ag[pos])
                })?;
                let d = rows.iter().map(|r| r.d_grad[p].unwrap_or(0.0)).collect();
                Ok(Some(ParameterGradient { b, d }))
            })
            .collect::<Result<Vec<_>, VecchiaError>>()?
    } else {
        Vec::new()
    };
    Ok(VecchiaFactor { b, d_inv, gradients })
}

/// Fills a row-major pattern of `(i, nb, _)` neighbour entries and `(i, i, 1)` diagonal entries;
/// `value(i, pos)` gives the entry of the `pos`-th neighbour of point `i`.
fn fill_pattern<F>(n: usize, pattern: &[(usize, usize, f64)], value: F) -> Result<SparseMatrix, VecchiaError>
where
    F: Fn(usize, usize) -> f64,
{
    let mut row = usize::MAX;
    let mut pos = 0usize;
    let entries: Vec<(usize, usize, f64)> = pattern
        .iter()
        .map(|&(i, c, v)| {
            if i != row {
                row = i;
                pos = 0;
            }
            if c == i {
                (i, c, v)
            } else {
                pos += 1;
                (i, c, value(i, pos - 1))
            }
        })
        .collect();
    Ok(sparse_from_triplets(n, n, &entries)?)
}
