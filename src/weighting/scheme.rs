//! Weighting configuration and respondent snapshot types.
//!
//! These are immutable inputs for the duration of a run. They deserialize
//! from the JSON run requests accepted by the CLI.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;

/// Survey respondent identifier.
pub type RespondentId = i32;

/// Separates the per-variable parts of a cell key. Category values are
/// integer instance ids, so the separator never appears inside one.
pub const CELL_KEY_DELIMITER: char = '|';

/// Builds the cell key for an ordered set of category values.
pub fn cell_key(values: &[i32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(&CELL_KEY_DELIMITER.to_string())
}

/// One respondent and the category value it gave for each variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Respondent {
    pub id: RespondentId,
    #[serde(default)]
    pub answers: BTreeMap<String, i32>,
}

impl Respondent {
    pub fn new(id: RespondentId) -> Self {
        Self {
            id,
            answers: BTreeMap::new(),
        }
    }

    /// Builder used by fixtures and tests.
    pub fn with_answer(mut self, variable: &str, value: i32) -> Self {
        self.answers.insert(variable.to_string(), value);
        self
    }

    pub fn answer(&self, variable: &str) -> Option<i32> {
        self.answers.get(variable).copied()
    }
}

/// A rim dimension: interlocked variables and a target per category.
///
/// A `None` target keeps that category at its raw sample share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub interlocked_variable_identifiers: Vec<String>,
    pub cell_targets: BTreeMap<String, Option<f64>>,
}

impl Dimension {
    /// Single-variable dimension keyed by instance id.
    pub fn single(variable: &str, targets: impl IntoIterator<Item = (i32, Option<f64>)>) -> Self {
        Self {
            interlocked_variable_identifiers: vec![variable.to_string()],
            cell_targets: targets
                .into_iter()
                .map(|(instance, target)| (instance.to_string(), target))
                .collect(),
        }
    }

    pub fn name(&self) -> String {
        self.interlocked_variable_identifiers.join("+")
    }

    pub fn category_count(&self) -> usize {
        self.cell_targets.len()
    }

    /// Sum of the explicit targets.
    pub fn target_sum(&self) -> f64 {
        self.cell_targets.values().flatten().sum()
    }
}

/// Ordered list of rim dimensions raked together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightingSchemeDetails {
    pub dimensions: Vec<Dimension>,
}

/// Plan node of the hierarchical target tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingPlan {
    pub variable_identifier: String,
    #[serde(default)]
    pub targets: Vec<WeightingTarget>,
}

/// Target node: a category of its parent plan's variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingTarget {
    pub entity_instance_id: i32,
    #[serde(default)]
    pub target: Option<f64>,
    #[serde(default)]
    pub target_population: Option<f64>,
    #[serde(default)]
    pub is_weighting_group_root: bool,
    #[serde(default)]
    pub child_plans: Vec<WeightingPlan>,
}

impl WeightingTarget {
    pub fn proportion(entity_instance_id: i32, target: f64) -> Self {
        Self {
            entity_instance_id,
            target: Some(target),
            target_population: None,
            is_weighting_group_root: false,
            child_plans: Vec::new(),
        }
    }

    pub fn population(entity_instance_id: i32, population: f64) -> Self {
        Self {
            entity_instance_id,
            target: None,
            target_population: Some(population),
            is_weighting_group_root: false,
            child_plans: Vec::new(),
        }
    }

    pub fn untargeted(entity_instance_id: i32) -> Self {
        Self {
            entity_instance_id,
            target: None,
            target_population: None,
            is_weighting_group_root: false,
            child_plans: Vec::new(),
        }
    }

    pub fn with_children(mut self, plans: Vec<WeightingPlan>) -> Self {
        self.child_plans = plans;
        self
    }

    pub fn as_group_root(mut self) -> Self {
        self.is_weighting_group_root = true;
        self
    }
}

impl WeightingPlan {
    pub fn new(variable: &str, targets: Vec<WeightingTarget>) -> Self {
        Self {
            variable_identifier: variable.to_string(),
            targets,
        }
    }
}

/// How a scheme describes its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemeDefinition {
    /// Interlocked rim dimensions authored directly.
    Rim(WeightingSchemeDetails),
    /// A plan/target tree.
    Plans { plans: Vec<WeightingPlan> },
}

/// The scheme applied to one filter-metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingScheme {
    #[serde(default)]
    pub filter_metric_entity_id: Option<i32>,
    pub definition: SchemeDefinition,
}

/// Weighting configuration for a product/subproduct/subset scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingStrategy {
    pub product_short_code: String,
    #[serde(default)]
    pub sub_product_id: Option<String>,
    #[serde(default)]
    pub subset_id: Option<String>,
    /// Variable splitting respondents into batches, one scheme per value.
    #[serde(default)]
    pub filter_metric: Option<String>,
    pub schemes: Vec<WeightingScheme>,
}

impl WeightingStrategy {
    /// Checks the scheme keying invariant.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.schemes.is_empty() {
            return Err(StrategyError::NoSchemes);
        }

        match &self.filter_metric {
            None => {
                if self.schemes.len() != 1 {
                    return Err(StrategyError::UnfilteredSchemeCount {
                        count: self.schemes.len(),
                    });
                }
                if let Some(entity_id) = self.schemes[0].filter_metric_entity_id {
                    return Err(StrategyError::UnexpectedFilterEntity { entity_id });
                }
            }
            Some(metric) => {
                let mut seen = BTreeSet::new();
                for scheme in &self.schemes {
                    let Some(entity_id) = scheme.filter_metric_entity_id else {
                        return Err(StrategyError::MissingFilterEntity {
                            metric: metric.clone(),
                        });
                    };
                    if !seen.insert(entity_id) {
                        return Err(StrategyError::DuplicateFilterEntity { entity_id });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Scope of one persisted set of weights.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseWeightingContextKey {
    pub product_short_code: String,
    #[serde(default)]
    pub sub_product_id: Option<String>,
    pub context: String,
    pub subset_id: String,
    #[serde(default)]
    pub weighting_target_id: Option<i32>,
}

impl std::fmt::Display for ResponseWeightingContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.product_short_code,
            self.sub_product_id.as_deref().unwrap_or("-"),
            self.context,
            self.subset_id
        )?;
        if let Some(target) = self.weighting_target_id {
            write!(f, "#{target}")?;
        }
        Ok(())
    }
}

/// A final (respondent, weight) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseWeight {
    pub respondent_id: RespondentId,
    pub weight: f64,
}
