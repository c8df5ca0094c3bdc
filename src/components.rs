//! Ordered training data, neighbour lists and the GP components a Vecchia factor is built from.

use crate::algo::{find_nearest_neighbors, NeighborDistances, NeighborQuery, NeighborSet};
use crate::config::VecchiaConfig;
use crate::covariance::{dense_covariance, CovFunction, CovarianceFunction, PairGeometry};
use crate::error::VecchiaError;
use crate::factor::VecchiaFactor;
use crate::linalg::{solve_lower_triangular, FaerCholesky, FaerCholeskyFactor};
use crate::metric::{Euclidean, Metric, ResidualCorrelation};
use crate::telemetry::SearchTelemetry;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Jitter added to the inducing-point covariance before factorising it.
const IP_JITTER: f64 = 1e-10;
/// Floor of the residual variances entering the residual-correlation distance.
pub(crate) const MIN_RESIDUAL_VARIANCE: f64 = 1e-10;

pub type ComponentId = usize;

/// One Gaussian process of the model: the intercept GP or a random-coefficient GP.
#[derive(Clone, Debug)]
pub struct GpComponent {
    pub cov: CovFunction,
    /// Covariate multiplying the process, in Vecchia order; `None` for the intercept GP.
    pub rand_coef: Option<Array1<f64>>,
}

impl GpComponent {
    pub fn is_random_coefficient(&self) -> bool {
        self.rand_coef.is_some()
    }
}

/// Outer products `z zᵀ` with `z = [z_i, z_nb…]`, one per random-coefficient column.
pub(crate) fn rand_coef_outer_products(
    rand_coef: ArrayView2<'_, f64>,
    i: usize,
    neighbors: &[usize],
) -> Vec<Array2<f64>> {
    rand_coef
        .columns()
        .into_iter()
        .map(|z_col| {
            let z: Vec<f64> = std::iter::once(z_col[i])
                .chain(neighbors.iter().map(|&nb| z_col[nb]))
                .collect();
            Array2::from_shape_fn((z.len(), z.len()), |(a, b)| z[a] * z[b])
        })
        .collect()
}

/// Inducing-point quantities of the full-scale approximation for the current parameters.
///
/// All per-point quantities are stored with one row per training point in Vecchia order.
pub struct FullScaleContext {
    pub inducing_points: Array2<f64>,
    /// `Σ_ip` including jitter.
    pub sigma_ip: Array2<f64>,
    chol_ip: FaerCholeskyFactor,
    /// `Σ_cross`, n × m.
    pub sigma_cross: Array2<f64>,
    /// Rows of `(L_ip⁻¹ Σ_crossᵀ)ᵀ`.
    pub whitened: Array2<f64>,
    /// Rows of `(Σ_ip⁻¹ Σ_crossᵀ)ᵀ`.
    pub ip_inv_cross: Array2<f64>,
    /// `dΣ_cross / dθ_p`, n × m per parameter.
    pub cross_grad: Vec<Array2<f64>>,
    /// Rows of `(dΣ_ip/dθ_p · Σ_ip⁻¹ Σ_crossᵀ)ᵀ` per parameter.
    pub ipgrad_ip_inv_cross: Vec<Array2<f64>>,
    /// `max(σ² − ‖w_i‖², 1e-10)`.
    pub resid_var: Array1<f64>,
}

/// Low-rank system of the full-scale approximation for a fixed factor and response.
pub struct WoodburySystem {
    /// Cholesky factor of `Σ_ip + Σ_crossᵀ BᵀD⁻¹B Σ_cross`.
    pub chol: FaerCholeskyFactor,
    /// `BᵀD⁻¹B Σ_cross`, n × m.
    pub precision_cross: Array2<f64>,
    /// `Σ̃⁻¹ y` with `Σ̃ = Σ_cross Σ_ip⁻¹ Σ_crossᵀ + (BᵀD⁻¹B)⁻¹`.
    pub y_aux: Array1<f64>,
}

impl FullScaleContext {
    pub fn new(
        cov: &CovFunction,
        pars: &[f64],
        coords: ArrayView2<'_, f64>,
        inducing_points: ArrayView2<'_, f64>,
    ) -> Result<Self, VecchiaError> {
        if inducing_points.ncols() != coords.ncols() {
            return Err(VecchiaError::DimensionMismatch {
                what: "inducing point dimension",
                expected: coords.ncols(),
                found: inducing_points.ncols(),
            });
        }
        let m = inducing_points.nrows();
        let mut sigma_ip = dense_covariance(cov, pars, inducing_points, inducing_points)?;
        for a in 0..m {
            sigma_ip[[a, a]] += IP_JITTER;
        }
        let chol_ip = sigma_ip.cholesky(Side::Lower)?;
        let sigma_cross = dense_covariance(cov, pars, coords, inducing_points)?;
        let cross_t = sigma_cross.t().to_owned();
        let whitened = solve_lower_triangular(&chol_ip.lower_triangular(), &cross_t)
            .reversed_axes();
        let ip_inv_cross = chol_ip.solve_mat(&cross_t).reversed_axes();

        let geometry = PairGeometry::Coordinates {
            rows: coords,
            cols: inducing_points,
        };
        let cross_grad = cov.eval_covariance_gradient(pars, geometry, Default::default())?;
        let ip_grad = cov.eval_covariance_gradient(
            pars,
            PairGeometry::Coordinates {
                rows: inducing_points,
                cols: inducing_points,
            },
            Default::default(),
        )?;
        let ipgrad_ip_inv_cross = ip_grad.iter().map(|g| ip_inv_cross.dot(g)).collect();

        let sigma2 = pars[0];
        let resid_var = whitened
            .rows()
            .into_iter()
            .map(|w| (sigma2 - w.dot(&w)).max(MIN_RESIDUAL_VARIANCE))
            .collect();

        Ok(FullScaleContext {
            inducing_points: inducing_points.to_owned(),
            sigma_ip,
            chol_ip,
            sigma_cross,
            whitened,
            ip_inv_cross,
            cross_grad,
            ipgrad_ip_inv_cross,
            resid_var,
        })
    }

    pub fn num_inducing_points(&self) -> usize {
        self.inducing_points.nrows()
    }

    pub fn chol_ip(&self) -> &FaerCholeskyFactor {
        &self.chol_ip
    }

    /// Builds the Woodbury system for the residual factor `factor` and response `y` (Vecchia order).
    pub fn woodbury(&self, factor: &VecchiaFactor, y: &Array1<f64>) -> Result<WoodburySystem, VecchiaError> {
        let precision_cross = factor.apply_precision_mat(&self.sigma_cross);
        let system = &self.sigma_ip + &self.sigma_cross.t().dot(&precision_cross);
        let system = (&system + &system.t()) * 0.5;
        let chol = system.cholesky(Side::Lower)?;
        // y_aux = P y − P Σ_cross W⁻¹ Σ_crossᵀ P y
        let py = factor.apply_precision(y);
        let inner = chol.solve_vec(&self.sigma_cross.t().dot(&py));
        let y_aux = &py - &precision_cross.dot(&inner);
        Ok(WoodburySystem {
            chol,
            precision_cross,
            y_aux,
        })
    }
}

/// Vecchia components of a fit: ordered coordinates, GP components, neighbour lists and the
/// sparsity pattern of B.
pub struct VecchiaComponents {
    config: VecchiaConfig,
    coords: Array2<f64>,
    data_indices: Vec<usize>,
    cov_pars: Array1<f64>,
    num_par_comp: usize,
    components: Vec<GpComponent>,
    main: Vec<ComponentId>,
    resid: Vec<ComponentId>,
    rand_coef_data: Option<Array2<f64>>,
    neighbors: Vec<Vec<usize>>,
    distances: Option<NeighborDistances<f64>>,
    num_neighbors: usize,
    has_duplicates: bool,
    entries_init_b: Vec<(usize, usize, f64)>,
    entries_init_b_grad: Vec<(usize, usize, f64)>,
    z_outer_z: Vec<Vec<Array2<f64>>>,
    full_scale: Option<FullScaleContext>,
    telemetry: SearchTelemetry,
}

impl VecchiaComponents {
    /// Orders the data, determines neighbours and prepares the factor pattern.
    ///
    /// `rand_coef_data` holds one covariate column per random-coefficient GP, `pars` the
    /// parameters `[σ², ranges…]` of every GP back to back (intercept GP first). All GPs share
    /// `cov_function`. `inducing_points` are required by the full-scale approximation.
    pub fn create(
        coords: ArrayView2<'_, f64>,
        rand_coef_data: Option<ArrayView2<'_, f64>>,
        cov_function: CovFunction,
        pars: &[f64],
        config: VecchiaConfig,
        inducing_points: Option<ArrayView2<'_, f64>>,
    ) -> Result<Self, VecchiaError> {
        config.validate()?;
        let n = coords.nrows();
        let dim = coords.ncols();
        if n == 0 {
            return Err(VecchiaError::InvalidConfiguration(
                "at least one observation is required".to_string(),
            ));
        }
        let num_rand_coef = rand_coef_data.map(|z| z.ncols()).unwrap_or(0);
        if let Some(z) = rand_coef_data {
            if z.nrows() != n {
                return Err(VecchiaError::DimensionMismatch {
                    what: "rows of the random coefficient data",
                    expected: n,
                    found: z.nrows(),
                });
            }
        }
        if num_rand_coef > 0 {
            if config.is_full_scale() {
                return Err(VecchiaError::InvalidConfiguration(
                    "random coefficient processes are not supported with the full-scale Vecchia approximation"
                        .to_string(),
                ));
            }
            if !cov_function.should_save_distances() {
                return Err(VecchiaError::RandomCoefficientsNeedSavedDistances);
            }
        }
        if config.ordering.sorts_by_time() && !cov_function.is_space_time_model() {
            return Err(VecchiaError::TimeOrderingWithoutSpaceTime {
                ordering: config.ordering.to_string(),
            });
        }
        if config.is_full_scale() && inducing_points.map_or(true, |ip| ip.nrows() == 0) {
            return Err(VecchiaError::InvalidConfiguration(
                "the full-scale Vecchia approximation requires inducing points".to_string(),
            ));
        }
        let num_par_comp = cov_function.num_cov_par(dim);
        let num_gp = 1 + num_rand_coef;
        check_component_pars(&cov_function, pars, dim, num_gp)?;

        let data_indices = vecchia_order(coords, &config);
        let ordered = coords.select(Axis(0), &data_indices);
        let rand_coef_data = rand_coef_data.map(|z| z.select(Axis(0), &data_indices));

        let mut components = vec![GpComponent {
            cov: cov_function.clone(),
            rand_coef: None,
        }];
        if let Some(z) = rand_coef_data.as_ref() {
            components.extend(z.columns().into_iter().map(|col| GpComponent {
                cov: cov_function.clone(),
                rand_coef: Some(col.to_owned()),
            }));
        }
        let main: Vec<ComponentId> = (0..components.len()).collect();
        let resid: Vec<ComponentId> = if config.is_full_scale() { vec![0] } else { Vec::new() };

        let full_scale = match inducing_points {
            Some(ip) if config.is_full_scale() => Some(FullScaleContext::new(
                &cov_function,
                &pars[..num_par_comp],
                ordered.view(),
                ip,
            )?),
            _ => None,
        };

        let mut this = VecchiaComponents {
            config,
            coords: ordered,
            data_indices,
            cov_pars: Array1::from(pars.to_vec()),
            num_par_comp,
            components,
            main,
            resid,
            rand_coef_data,
            neighbors: Vec::new(),
            distances: None,
            num_neighbors: 0,
            has_duplicates: false,
            entries_init_b: Vec::new(),
            entries_init_b_grad: Vec::new(),
            z_outer_z: Vec::new(),
            full_scale,
            telemetry: SearchTelemetry::default(),
        };
        let check_duplicates = this.config.check_duplicates;
        this.determine_neighbors(check_duplicates)?;
        if this.has_duplicates {
            if !this.config.likelihood.is_gaussian() {
                return Err(VecchiaError::DuplicateCoordinates(
                    "duplicates (= repeated measurements) are not supported for non-Gaussian \
                     likelihoods with the Vecchia approximation; add a small jitter to the coordinates"
                        .to_string(),
                ));
            }
            log::debug!("Vecchia neighbor sets contain duplicate coordinates");
        }
        this.z_outer_z = match this.rand_coef_data.as_ref() {
            Some(z) => (0..n)
                .map(|i| rand_coef_outer_products(z.view(), i, &this.neighbors[i]))
                .collect(),
            None => Vec::new(),
        };
        Ok(this)
    }

    /// Whether the neighbour lists change with the covariance parameters.
    pub fn neighbors_depend_on_pars(&self) -> bool {
        (self.config.is_full_scale() && self.config.uses_residual_correlation())
            || !self.cov_function().should_save_distances()
    }

    /// Replaces the covariance parameters; the inducing-point quantities follow.
    pub fn set_cov_pars(&mut self, pars: &[f64]) -> Result<(), VecchiaError> {
        let full_scale = self.full_scale_for(pars)?;
        self.cov_pars = Array1::from(pars.to_vec());
        self.full_scale = full_scale;
        Ok(())
    }

    /// Redetermines the neighbours for `pars` when they depend on the parameters and rewrites
    /// the factor pattern. Returns whether the neighbour lists were recomputed.
    ///
    /// Nothing is committed unless the inducing-point quantities and the search both succeed.
    pub fn update_nearest_neighbors(&mut self, pars: &[f64]) -> Result<bool, VecchiaError> {
        let full_scale = self.full_scale_for(pars)?;
        let set = if self.neighbors_depend_on_pars() {
            Some(self.search_neighbors(pars, full_scale.as_ref(), false)?)
        } else {
            None
        };
        self.cov_pars = Array1::from(pars.to_vec());
        self.full_scale = full_scale;
        Ok(match set {
            Some(set) => {
                self.install_neighbors(set);
                true
            }
            None => false,
        })
    }

    /// Validated `pars` and the inducing-point quantities that go with them.
    fn full_scale_for(&self, pars: &[f64]) -> Result<Option<FullScaleContext>, VecchiaError> {
        check_component_pars(
            self.cov_function(),
            pars,
            self.coords.ncols(),
            self.components.len(),
        )?;
        self.full_scale
            .as_ref()
            .map(|ctx| {
                FullScaleContext::new(
                    &self.components[0].cov,
                    &pars[..self.num_par_comp],
                    self.coords.view(),
                    ctx.inducing_points.view(),
                )
            })
            .transpose()
    }

    fn determine_neighbors(&mut self, check_duplicates: bool) -> Result<(), VecchiaError> {
        let set = self.search_neighbors(
            self.cov_pars.as_slice().unwrap_or(&[]),
            self.full_scale.as_ref(),
            check_duplicates,
        )?;
        self.install_neighbors(set);
        Ok(())
    }

    fn search_neighbors(
        &self,
        pars: &[f64],
        full_scale: Option<&FullScaleContext>,
        check_duplicates: bool,
    ) -> Result<NeighborSet<f64>, VecchiaError> {
        let n = self.coords.nrows();
        let cov = &self.components[0].cov;
        let pars0 = &pars[..self.num_par_comp];
        let query = NeighborQuery {
            check_has_duplicates: check_duplicates,
            save_distances: cov.should_save_distances(),
            base: self.config.cover_tree_base,
            num_segments: self.config.parallelism.num_segments(),
            ..NeighborQuery::training(n, self.config.num_neighbors)
        };
        let coords = self.coords.view();
        match full_scale {
            Some(ctx) if self.config.uses_residual_correlation() => {
                let metric = ResidualCorrelation::new(
                    coords,
                    ctx.whitened.view(),
                    ctx.resid_var.view(),
                    cov,
                    pars0,
                );
                run_search(&self.config, &metric, coords, &query)
            }
            _ if cov.should_save_distances() => {
                run_search(&self.config, &Euclidean::new(coords), coords, &query)
            }
            _ => {
                let scaled = cov.scale_coordinates(pars0, coords);
                run_search(&self.config, &Euclidean::new(scaled.view()), coords, &query)
            }
        }
    }

    fn install_neighbors(&mut self, set: NeighborSet<f64>) {
        self.num_neighbors = set.num_neighbors;
        self.has_duplicates = set.has_duplicates;
        self.neighbors = set.neighbors;
        self.distances = set.distances;
        self.telemetry.add_from(&set.telemetry);
        self.entries_init_b = b_pattern(&self.neighbors, true);
        self.entries_init_b_grad = b_pattern(&self.neighbors, false);
    }

    pub fn config(&self) -> &VecchiaConfig {
        &self.config
    }

    pub fn num_data(&self) -> usize {
        self.coords.nrows()
    }

    /// Coordinates in Vecchia order.
    pub fn coords(&self) -> ArrayView2<'_, f64> {
        self.coords.view()
    }

    /// `data_indices[r]` is the input row placed at position `r` of the Vecchia order.
    pub fn data_indices(&self) -> &[usize] {
        &self.data_indices
    }

    pub fn to_vecchia_order(&self, y: ArrayView1<'_, f64>) -> Array1<f64> {
        self.data_indices.iter().map(|&r| y[r]).collect()
    }

    pub fn to_input_order(&self, v: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(v.len());
        for (pos, &r) in self.data_indices.iter().enumerate() {
            out[r] = v[pos];
        }
        out
    }

    pub fn cov_pars(&self) -> &Array1<f64> {
        &self.cov_pars
    }

    /// Parameters of one GP component.
    pub fn component_pars(&self, id: ComponentId) -> &[f64] {
        let start = id * self.num_par_comp;
        &self.cov_pars.as_slice().unwrap_or(&[])[start..start + self.num_par_comp]
    }

    pub fn num_par_comp(&self) -> usize {
        self.num_par_comp
    }

    pub fn num_cov_par(&self) -> usize {
        self.num_par_comp * self.components.len()
    }

    pub fn cov_function(&self) -> &CovFunction {
        &self.components[0].cov
    }

    pub fn component(&self, id: ComponentId) -> &GpComponent {
        &self.components[id]
    }

    /// GP components entering the factor.
    pub fn main_components(&self) -> &[ComponentId] {
        &self.main
    }

    /// Components whose inducing-point part is removed under the full-scale approximation.
    pub fn residual_components(&self) -> &[ComponentId] {
        &self.resid
    }

    /// Random-coefficient covariates in Vecchia order, one column per random-coefficient GP.
    pub fn rand_coef_data(&self) -> Option<ArrayView2<'_, f64>> {
        self.rand_coef_data.as_ref().map(|z| z.view())
    }

    pub fn neighbors(&self) -> &[Vec<usize>] {
        &self.neighbors
    }

    pub fn distances(&self) -> Option<&NeighborDistances<f64>> {
        self.distances.as_ref()
    }

    pub fn num_neighbors(&self) -> usize {
        self.num_neighbors
    }

    pub fn has_duplicates(&self) -> bool {
        self.has_duplicates
    }

    /// Pattern of B: `(i, nb, 0)` per neighbour followed by `(i, i, 1)`, row by row.
    pub fn entries_init_b(&self) -> &[(usize, usize, f64)] {
        &self.entries_init_b
    }

    /// Pattern of the gradients of B: `(i, nb, 0)` per neighbour.
    pub fn entries_init_b_grad(&self) -> &[(usize, usize, f64)] {
        &self.entries_init_b_grad
    }

    /// `z zᵀ` per point and random-coefficient GP; empty without random coefficients.
    pub fn z_outer_z(&self) -> &[Vec<Array2<f64>>] {
        &self.z_outer_z
    }

    pub fn full_scale(&self) -> Option<&FullScaleContext> {
        self.full_scale.as_ref()
    }

    pub fn telemetry(&self) -> &SearchTelemetry {
        &self.telemetry
    }
}

fn check_component_pars(
    cov: &CovFunction,
    pars: &[f64],
    dim: usize,
    num_gp: usize,
) -> Result<(), VecchiaError> {
    let per = cov.num_cov_par(dim);
    if pars.len() != per * num_gp {
        return Err(VecchiaError::DimensionMismatch {
            what: "covariance parameters of all GP components",
            expected: per * num_gp,
            found: pars.len(),
        });
    }
    pars.chunks(per).try_for_each(|chunk| cov.check_pars(chunk, dim))
}

/// Permutation placing the input rows in the configured Vecchia order.
fn vecchia_order(coords: ArrayView2<'_, f64>, config: &VecchiaConfig) -> Vec<usize> {
    let mut data_indices: Vec<usize> = (0..coords.nrows()).collect();
    if config.ordering.shuffles() && !config.is_full_scale() {
        let mut rng = StdRng::seed_from_u64(config.seed);
        data_indices.shuffle(&mut rng);
    }
    if config.ordering.sorts_by_time() {
        data_indices.sort_by(|&a, &b| coords[[a, 0]].total_cmp(&coords[[b, 0]]));
    }
    data_indices
}

fn b_pattern(neighbors: &[Vec<usize>], with_diagonal: bool) -> Vec<(usize, usize, f64)> {
    let mut entries = Vec::with_capacity(neighbors.iter().map(|nn| nn.len() + 1).sum());
    for (i, nn) in neighbors.iter().enumerate() {
        entries.extend(nn.iter().map(|&nb| (i, nb, 0.0)));
        if with_diagonal {
            entries.push((i, i, 1.0));
        }
    }
    entries
}

fn run_search<M: Metric<f64>>(
    config: &VecchiaConfig,
    metric: &M,
    coords: ArrayView2<'_, f64>,
    query: &NeighborQuery,
) -> Result<NeighborSet<f64>, VecchiaError> {
    config
        .parallelism
        .install(|| find_nearest_neighbors(metric, coords, query))?
}
