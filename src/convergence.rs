//! Coupling between a derivative-free optimiser's convergence checks and neighbour
//! redetermination.

use crate::components::VecchiaComponents;
use crate::error::VecchiaError;
use ndarray::{ArrayView1, ArrayView2, Zip};

/// Result of notifying an observer about a convergence check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvergenceCheck {
    pub converged: bool,
    /// The neighbours were redetermined: objective values must be recomputed and convergence
    /// checked again.
    pub should_redetermine_neighbors: bool,
}

pub trait ConvergenceObserver {
    /// Called with the best point of the current iteration and the optimiser's verdict.
    fn on_convergence_check(&mut self, best: &[f64], converged: bool) -> Result<ConvergenceCheck, VecchiaError>;
}

/// Redetermines the Vecchia neighbours at the best point whenever they depend on the
/// covariance parameters.
pub struct NeighborRedetermination<'a> {
    components: &'a mut VecchiaComponents,
    redeterminations: usize,
}

impl<'a> NeighborRedetermination<'a> {
    pub fn new(components: &'a mut VecchiaComponents) -> Self {
        NeighborRedetermination {
            components,
            redeterminations: 0,
        }
    }

    pub fn redeterminations(&self) -> usize {
        self.redeterminations
    }

    pub fn components(&self) -> &VecchiaComponents {
        self.components
    }
}

impl ConvergenceObserver for NeighborRedetermination<'_> {
    fn on_convergence_check(&mut self, best: &[f64], converged: bool) -> Result<ConvergenceCheck, VecchiaError> {
        let redetermined = self.components.update_nearest_neighbors(best)?;
        if redetermined {
            self.redeterminations += 1;
            log::debug!(
                "redetermined Vecchia neighbors at convergence check {} (converged: {converged})",
                self.redeterminations
            );
        }
        Ok(ConvergenceCheck {
            converged,
            should_redetermine_neighbors: redetermined,
        })
    }
}

/// Relative objective and solution change test of a simplex optimiser.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConvergenceCriterion {
    pub rel_objfn_change_tol: f64,
    /// `None` disables the solution change test.
    pub rel_sol_change_tol: Option<f64>,
    pub iter_max: usize,
}

impl Default for ConvergenceCriterion {
    fn default() -> Self {
        ConvergenceCriterion {
            rel_objfn_change_tol: 1e-8,
            rel_sol_change_tol: Some(1e-8),
            iter_max: 1000,
        }
    }
}

impl ConvergenceCriterion {
    /// `max |f − f_old| / (1e-8 + max |f_old|)`.
    pub fn rel_objfn_change(values: ArrayView1<'_, f64>, values_old: ArrayView1<'_, f64>) -> f64 {
        let change = Zip::from(&values)
            .and(&values_old)
            .fold(0.0f64, |acc, &a, &b| acc.max((a - b).abs()));
        change / (1e-8 + values_old.iter().fold(0.0f64, |acc, v| acc.max(v.abs())))
    }

    /// `max |x − x_old| / (1e-8 + max |x_old|)` over all simplex points.
    pub fn rel_sol_change(points: ArrayView2<'_, f64>, points_old: ArrayView2<'_, f64>) -> f64 {
        let change = Zip::from(&points)
            .and(&points_old)
            .fold(0.0f64, |acc, &a, &b| acc.max((a - b).abs()));
        change / (1e-8 + points_old.iter().fold(0.0f64, |acc, v| acc.max(v.abs())))
    }

    pub fn has_converged(&self, rel_objfn_change: f64, rel_sol_change: f64, iter: usize) -> bool {
        let sol_moving = self
            .rel_sol_change_tol
            .map_or(true, |tol| rel_sol_change > tol);
        !(rel_objfn_change > self.rel_objfn_change_tol && sol_moving && iter < self.iter_max)
    }
}
