//! Pre-flight validation of schemes and plan trees.
//!
//! Nothing here touches respondent data; every check runs before the raking
//! engine is invoked, and the engine itself never re-validates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WeightingConfig;
use crate::error::InvalidReason;
use crate::weighting::quota_cells::QuotaCellEnumerator;
use crate::weighting::scheme::{WeightingPlan, WeightingSchemeDetails};

/// Ceiling on the quota-cell cross product (exclusive).
pub const MAX_NUMBER_OF_QUOTA_CELLS: u64 = 2_000_000;

/// Allowed distance of a dimension's target sum from 1.
pub const ERROR_TOLERANCE: f64 = 0.00005;

/// Allowed distance of nested target proportions from 1.
pub const NESTED_TARGET_TOLERANCE: f64 = 0.00001;

/// Structural checks on a rim scheme.
#[derive(Debug, Clone, Copy)]
pub struct SchemeValidator {
    max_quota_cells: u64,
    error_tolerance: f64,
}

impl Default for SchemeValidator {
    fn default() -> Self {
        Self::new(MAX_NUMBER_OF_QUOTA_CELLS, ERROR_TOLERANCE)
    }
}

impl SchemeValidator {
    pub fn new(max_quota_cells: u64, error_tolerance: f64) -> Self {
        Self {
            max_quota_cells,
            error_tolerance,
        }
    }

    pub fn from_config(config: &WeightingConfig) -> Self {
        Self::new(config.max_quota_cells, config.error_tolerance)
    }

    /// Returns the first failure in priority order: cell count, target ranges
    /// and sums per dimension, emptiness.
    pub fn validate(&self, scheme: &WeightingSchemeDetails) -> Result<(), InvalidReason> {
        // `>=` leaves room for the implicit unweighted cell.
        let quota_cells = QuotaCellEnumerator::quota_cell_count(scheme);
        if quota_cells >= u128::from(self.max_quota_cells) {
            return Err(InvalidReason::TooManyQuotaCells {
                quota_cells,
                limit: self.max_quota_cells,
            });
        }

        for dimension in &scheme.dimensions {
            let out_of_range = dimension
                .cell_targets
                .iter()
                .find_map(|(category, target)| target.filter(|t| !is_proportion(*t)).map(|t| (category, t)));
            if let Some((category, target)) = out_of_range {
                return Err(InvalidReason::TargetOutOfRange {
                    dimension: dimension.name(),
                    category: category.clone(),
                    target,
                });
            }

            let sum = dimension.target_sum();
            if (sum - 1.0).abs() >= self.error_tolerance {
                return Err(InvalidReason::DimensionDoesNotSumToOne {
                    dimension: dimension.name(),
                    sum,
                });
            }
        }

        if scheme.dimensions.is_empty() {
            return Err(InvalidReason::NoDimensions);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanValidationKind {
    EmptyPlan,
    QuestionHasNoTargets,
    QuestionUsedMoreThanOnce,
    MixedTargetPercentageAndPopulation,
    TargetPopulationOutsideOfRoot,
    InvalidNestedTarget,
    /// A proportion outside `[0, 1]` or a negative population.
    InvalidTargetValue,
    RimLeafWithChildren,
    TargetWithoutValueOrChildren,
    DominatedGroupRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A problem found in a plan tree, located by its path from the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanValidationMessage {
    pub kind: PlanValidationKind,
    pub severity: Severity,
    /// `Root` or `var:instance,var2:instance`
    pub path: String,
    pub message: String,
}

impl PlanValidationMessage {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Plan tree errors that block a run.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("weighting plan has {} error(s): {}", .messages.len(), summary(.messages))]
pub struct PlanValidationError {
    pub messages: Vec<PlanValidationMessage>,
}

fn summary(messages: &[PlanValidationMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.path, m.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Formats a plan-tree path.
pub fn describe_path(path: &[(String, i32)]) -> String {
    if path.is_empty() {
        return "Root".to_string();
    }
    path.iter()
        .map(|(variable, instance)| format!("{variable}:{instance}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Structural checks on a plan/target tree.
#[derive(Debug, Clone, Copy)]
pub struct PlanValidator {
    nested_target_tolerance: f64,
}

impl Default for PlanValidator {
    fn default() -> Self {
        Self::new(NESTED_TARGET_TOLERANCE)
    }
}

struct Walk<'a> {
    path: Vec<(String, i32)>,
    variables_on_path: Vec<&'a str>,
    under_group_root: bool,
}

impl PlanValidator {
    pub fn new(nested_target_tolerance: f64) -> Self {
        Self {
            nested_target_tolerance,
        }
    }

    pub fn from_config(config: &WeightingConfig) -> Self {
        Self::new(config.nested_target_tolerance)
    }

    /// Every error and warning in the tree, depth first.
    pub fn validate(&self, plans: &[WeightingPlan]) -> Vec<PlanValidationMessage> {
        let mut messages = Vec::new();
        let walk = Walk {
            path: Vec::new(),
            variables_on_path: Vec::new(),
            under_group_root: false,
        };
        self.validate_level(plans, &walk, &mut messages);
        messages
    }

    /// Splits the result into warnings (returned) and errors (failure).
    pub fn ensure_valid(
        &self,
        plans: &[WeightingPlan],
    ) -> Result<Vec<PlanValidationMessage>, PlanValidationError> {
        let (errors, warnings): (Vec<_>, Vec<_>) = self
            .validate(plans)
            .into_iter()
            .partition(PlanValidationMessage::is_error);
        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(PlanValidationError { messages: errors })
        }
    }

    fn validate_level<'a>(
        &self,
        plans: &'a [WeightingPlan],
        walk: &Walk<'a>,
        out: &mut Vec<PlanValidationMessage>,
    ) {
        let path = describe_path(&walk.path);
        let is_root = walk.path.is_empty();
        let rim_leaf = plans.len() > 1;
        let mut variables_at_level: Vec<&str> = Vec::new();

        for plan in plans {
            let variable = plan.variable_identifier.as_str();
            if walk.variables_on_path.contains(&variable) || variables_at_level.contains(&variable) {
                out.push(error(
                    PlanValidationKind::QuestionUsedMoreThanOnce,
                    &path,
                    format!("variable '{variable}' is used more than once"),
                ));
            }
            variables_at_level.push(variable);

            if plan.targets.is_empty() {
                out.push(error(
                    PlanValidationKind::EmptyPlan,
                    &path,
                    format!("plan for '{variable}' has no targets"),
                ));
                continue;
            }

            let has_proportion = plan.targets.iter().any(|t| t.target.is_some());
            let has_population = plan.targets.iter().any(|t| t.target_population.is_some());
            let has_children = plan.targets.iter().any(|t| !t.child_plans.is_empty());

            if has_proportion && has_population {
                out.push(error(
                    PlanValidationKind::MixedTargetPercentageAndPopulation,
                    &path,
                    format!("plan for '{variable}' mixes proportions and populations"),
                ));
            }

            if has_population && (!is_root || rim_leaf) {
                out.push(error(
                    PlanValidationKind::TargetPopulationOutsideOfRoot,
                    &path,
                    format!("target populations on '{variable}' are only allowed on a single root plan"),
                ));
            }

            if rim_leaf && has_children {
                out.push(error(
                    PlanValidationKind::RimLeafWithChildren,
                    &path,
                    format!("'{variable}' is raked with other plans and cannot own child plans"),
                ));
            }

            if !has_children && !has_proportion && !has_population {
                out.push(error(
                    PlanValidationKind::QuestionHasNoTargets,
                    &path,
                    format!("plan for '{variable}' has no target values"),
                ));
            }

            if !rim_leaf && has_children {
                let proportions: Vec<f64> = plan.targets.iter().filter_map(|t| t.target).collect();
                let sum: f64 = proportions.iter().sum();
                if !proportions.is_empty() && (sum - 1.0).abs() > self.nested_target_tolerance {
                    out.push(error(
                        PlanValidationKind::InvalidNestedTarget,
                        &path,
                        format!("nested targets for '{variable}' sum to {sum}, expected 1"),
                    ));
                }
            }

            for target in &plan.targets {
                let target_path = {
                    let mut p = walk.path.clone();
                    p.push((variable.to_string(), target.entity_instance_id));
                    p
                };

                if let Some(proportion) = target.target.filter(|t| !is_proportion(*t)) {
                    out.push(error(
                        PlanValidationKind::InvalidTargetValue,
                        &describe_path(&target_path),
                        format!("target {proportion} is outside [0, 1]"),
                    ));
                }
                if let Some(population) = target.target_population.filter(|p| !p.is_finite() || *p < 0.0) {
                    out.push(error(
                        PlanValidationKind::InvalidTargetValue,
                        &describe_path(&target_path),
                        format!("target population {population} is negative"),
                    ));
                }

                if !rim_leaf
                    && has_children
                    && target.child_plans.is_empty()
                    && target.target.is_none()
                    && target.target_population.is_none()
                {
                    out.push(warning(
                        PlanValidationKind::TargetWithoutValueOrChildren,
                        &describe_path(&target_path),
                        "target has neither a value nor child plans".to_string(),
                    ));
                }

                let carves_group = target.is_weighting_group_root && !target.child_plans.is_empty();
                if carves_group && walk.under_group_root {
                    out.push(warning(
                        PlanValidationKind::DominatedGroupRoot,
                        &describe_path(&target_path),
                        "group root flag is inside another weighting group and is ignored".to_string(),
                    ));
                }

                if !target.child_plans.is_empty() {
                    let mut variables_on_path = walk.variables_on_path.clone();
                    variables_on_path.push(variable);
                    let child = Walk {
                        path: target_path,
                        variables_on_path,
                        under_group_root: walk.under_group_root || carves_group,
                    };
                    self.validate_level(&target.child_plans, &child, out);
                }
            }
        }
    }
}

fn is_proportion(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn error(kind: PlanValidationKind, path: &str, message: String) -> PlanValidationMessage {
    PlanValidationMessage {
        kind,
        severity: Severity::Error,
        path: path.to_string(),
        message,
    }
}

fn warning(kind: PlanValidationKind, path: &str, message: String) -> PlanValidationMessage {
    PlanValidationMessage {
        kind,
        severity: Severity::Warning,
        path: path.to_string(),
        message,
    }
}
