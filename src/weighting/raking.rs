//! Iterative proportional fitting over quota cells.
//!
//! The engine adjusts one factor per occupied cell so that the weighted
//! marginal share of every active category matches its target. A category is
//! active when it has both sample and a positive target; inactive categories
//! are left out of their dimension's totals, which keeps every factor strictly
//! positive.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Iteration limits for [`RakingEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RakingSettings {
    pub max_iterations: u32,
    /// Maximum absolute marginal deviation accepted as converged.
    pub convergence_tolerance: f64,
}

impl Default for RakingSettings {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_tolerance: 0.00005,
        }
    }
}

/// An occupied quota cell.
#[derive(Debug, Clone, PartialEq)]
pub struct RakingCell {
    /// Category index per dimension; `None` skips that dimension.
    pub categories: Vec<Option<usize>>,
    pub sample_size: f64,
    /// Starting weight of each respondent in the cell.
    pub weight: f64,
}

impl RakingCell {
    pub fn new(categories: Vec<Option<usize>>, sample_size: usize) -> Self {
        Self {
            categories,
            sample_size: sample_size as f64,
            weight: 1.0,
        }
    }

    fn mass(&self) -> f64 {
        self.sample_size * self.weight
    }
}

/// Resolved target shares of one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionTargets {
    pub name: String,
    pub targets: Vec<f64>,
}

/// A targeted category nobody in the sample falls into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmptyCategory {
    pub dimension: String,
    pub category: usize,
    pub target: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RakingOutcome {
    /// Final per-respondent weight for each input cell, same order.
    pub weights: Vec<f64>,
    pub iterations: u32,
    pub converged: bool,
    pub max_deviation: f64,
    pub empty_categories: Vec<EmptyCategory>,
    pub cancelled: bool,
}

struct ActiveDimension {
    /// Renormalized target per category, `None` when inactive.
    targets: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RakingEngine {
    settings: RakingSettings,
}

impl RakingEngine {
    pub fn new(settings: RakingSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> RakingSettings {
        self.settings
    }

    /// Rakes `cells` towards `dimensions`.
    ///
    /// The token is polled between passes; a cancelled run returns the
    /// weights of the last completed pass with `converged == false`.
    pub fn rake(
        &self,
        cells: &[RakingCell],
        dimensions: &[DimensionTargets],
        cancel: Option<&CancellationToken>,
    ) -> RakingOutcome {
        let mut weights: Vec<RakingCell> = cells.to_vec();
        let (active, empty_categories) = activate(&weights, dimensions);

        let mut max_deviation = deviation(&weights, &active);
        let mut iterations = 0;
        let mut converged = max_deviation <= self.settings.convergence_tolerance;
        let mut cancelled = false;

        while !converged && iterations < self.settings.max_iterations {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                cancelled = true;
                break;
            }

            for (d, dimension) in active.iter().enumerate() {
                adjust(&mut weights, d, dimension);
            }
            iterations += 1;

            max_deviation = deviation(&weights, &active);
            converged = max_deviation <= self.settings.convergence_tolerance;
            tracing::trace!(iterations, max_deviation, "raking pass");
        }

        RakingOutcome {
            weights: weights.iter().map(|c| c.weight).collect(),
            iterations,
            converged,
            max_deviation,
            empty_categories,
            cancelled,
        }
    }
}

fn category_mass(cells: &[RakingCell], d: usize, size: usize, field: impl Fn(&RakingCell) -> f64) -> Vec<f64> {
    let mut mass = vec![0.0; size];
    for cell in cells {
        if let Some(c) = cell.categories.get(d).copied().flatten() {
            if c < size {
                mass[c] += field(cell);
            }
        }
    }
    mass
}

fn activate(cells: &[RakingCell], dimensions: &[DimensionTargets]) -> (Vec<ActiveDimension>, Vec<EmptyCategory>) {
    let mut empty = Vec::new();
    let active = dimensions
        .iter()
        .enumerate()
        .map(|(d, dimension)| {
            let sample = category_mass(cells, d, dimension.targets.len(), |c| c.sample_size);
            let mut targets: Vec<Option<f64>> = dimension
                .targets
                .iter()
                .zip(&sample)
                .enumerate()
                .map(|(category, (&target, &n))| {
                    if n > 0.0 && target > 0.0 {
                        Some(target)
                    } else {
                        if n <= 0.0 && target > 0.0 {
                            empty.push(EmptyCategory {
                                dimension: dimension.name.clone(),
                                category,
                                target,
                            });
                        }
                        None
                    }
                })
                .collect();

            let total: f64 = targets.iter().flatten().sum();
            if total > 0.0 {
                for target in targets.iter_mut().flatten() {
                    *target /= total;
                }
            }
            ActiveDimension { targets }
        })
        .collect();
    (active, empty)
}

fn participates(cell: &RakingCell, d: usize, dimension: &ActiveDimension) -> Option<(usize, f64)> {
    let c = cell.categories.get(d).copied().flatten()?;
    dimension.targets.get(c).copied().flatten().map(|t| (c, t))
}

fn adjust(cells: &mut [RakingCell], d: usize, dimension: &ActiveDimension) {
    let size = dimension.targets.len();
    let mut mass = vec![0.0; size];
    let mut total = 0.0;
    for cell in cells.iter() {
        if let Some((c, _)) = participates(cell, d, dimension) {
            mass[c] += cell.mass();
            total += cell.mass();
        }
    }
    if total <= 0.0 {
        return;
    }

    for cell in cells.iter_mut() {
        if let Some((c, target)) = participates(cell, d, dimension) {
            if mass[c] > 0.0 {
                cell.weight *= target * total / mass[c];
            }
        }
    }
}

fn deviation(cells: &[RakingCell], active: &[ActiveDimension]) -> f64 {
    let mut worst: f64 = 0.0;
    for (d, dimension) in active.iter().enumerate() {
        let mut mass = vec![0.0; dimension.targets.len()];
        let mut total = 0.0;
        for cell in cells {
            if let Some((c, _)) = participates(cell, d, dimension) {
                mass[c] += cell.mass();
                total += cell.mass();
            }
        }
        if total <= 0.0 {
            continue;
        }
        for (c, target) in dimension.targets.iter().enumerate() {
            if let Some(target) = target {
                worst = worst.max((mass[c] / total - target).abs());
            }
        }
    }
    worst
}
