//! Splits a strategy into independently weighted groups.
//!
//! Each scheme becomes one group per filter-metric value. Inside a plan tree,
//! a target flagged as a weighting-group root (and owning child plans) is
//! carved into a group of its own; its parent only keeps a [`GroupNode::Detached`]
//! marker so those respondents are not weighted twice.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::weighting::scheme::{
    Dimension, Respondent, SchemeDefinition, WeightingPlan, WeightingSchemeDetails, WeightingStrategy,
};
use crate::weighting::validator::describe_path;

/// Conjunction of `variable == instance` conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RespondentFilter {
    pub conditions: Vec<(String, i32)>,
}

impl RespondentFilter {
    pub fn matches(&self, respondent: &Respondent) -> bool {
        self.conditions
            .iter()
            .all(|(variable, instance)| respondent.answer(variable) == Some(*instance))
    }

    fn with(&self, variable: &str, instance: i32) -> Self {
        let mut conditions = self.conditions.clone();
        conditions.push((variable.to_string(), instance));
        Self { conditions }
    }
}

/// How a branch's weights are scaled relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BranchScale {
    Proportion(f64),
    Population(f64),
    Unscaled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Branch {
    pub entity_instance_id: i32,
    pub scale: BranchScale,
    pub node: GroupNode,
}

/// Compiled weighting tree of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupNode {
    /// Every member gets weight 1.
    Uniform,
    Rim(WeightingSchemeDetails),
    /// Cell weight is `population / sample size`.
    Expansion {
        variable: String,
        populations: BTreeMap<i32, f64>,
    },
    Nested {
        variable: String,
        branches: Vec<Branch>,
    },
    /// Members are weighted by another group.
    Detached { group: usize },
}

impl GroupNode {
    /// Rim schemes anywhere in the tree, with their plan paths.
    pub fn rim_schemes(&self) -> Vec<(String, &WeightingSchemeDetails)> {
        let mut found = Vec::new();
        self.collect_rims(&mut Vec::new(), &mut found);
        found
    }

    fn collect_rims<'a>(&'a self, path: &mut Vec<(String, i32)>, found: &mut Vec<(String, &'a WeightingSchemeDetails)>) {
        match self {
            GroupNode::Rim(details) => found.push((describe_path(path), details)),
            GroupNode::Nested { variable, branches } => {
                for branch in branches {
                    path.push((variable.clone(), branch.entity_instance_id));
                    branch.node.collect_rims(path, found);
                    path.pop();
                }
            }
            _ => {}
        }
    }
}

/// A unit of work raked independently of every other group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightingGroup {
    pub id: usize,
    pub name: String,
    /// Filter-metric value of the owning scheme.
    pub stratum: Option<i32>,
    pub filter: RespondentFilter,
    /// When set, the group's weights are scaled to sum to this value.
    pub target_population: Option<f64>,
    pub root: GroupNode,
}

/// A group-root flag that had no effect.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DominatedRoot {
    pub group: String,
    pub path: String,
}

#[derive(Debug, Default)]
pub struct Partition {
    pub groups: Vec<WeightingGroup>,
    pub dominated_roots: Vec<DominatedRoot>,
}

#[derive(Default)]
pub struct WeightingGroupPartitioner {
    partition: Partition,
}

impl WeightingGroupPartitioner {
    /// Groups in depth-first order, every parent before its carved children.
    pub fn partition(strategy: &WeightingStrategy) -> Partition {
        let mut partitioner = Self::default();
        for scheme in &strategy.schemes {
            let filter = match (&strategy.filter_metric, scheme.filter_metric_entity_id) {
                (Some(metric), Some(entity)) => RespondentFilter::default().with(metric, entity),
                _ => RespondentFilter::default(),
            };
            let stratum = scheme.filter_metric_entity_id;
            match &scheme.definition {
                SchemeDefinition::Rim(details) => {
                    partitioner.push_group(stratum, filter, None, GroupNode::Rim(details.clone()));
                }
                SchemeDefinition::Plans { plans } => {
                    partitioner.carve(stratum, filter, None, plans, false);
                }
            }
        }
        partitioner.partition
    }

    fn push_group(
        &mut self,
        stratum: Option<i32>,
        filter: RespondentFilter,
        target_population: Option<f64>,
        root: GroupNode,
    ) -> usize {
        let id = self.partition.groups.len();
        self.partition.groups.push(WeightingGroup {
            id,
            name: describe_path(&filter.conditions),
            stratum,
            filter,
            target_population,
            root,
        });
        id
    }

    fn carve(
        &mut self,
        stratum: Option<i32>,
        filter: RespondentFilter,
        target_population: Option<f64>,
        plans: &[WeightingPlan],
        nested_in_carved: bool,
    ) -> usize {
        // Reserve the slot so the parent precedes groups carved below it.
        let id = self.push_group(stratum, filter.clone(), target_population, GroupNode::Uniform);
        let root = self.compile(id, stratum, &filter, plans, nested_in_carved);
        self.partition.groups[id].root = root;
        id
    }

    fn compile(
        &mut self,
        group: usize,
        stratum: Option<i32>,
        filter: &RespondentFilter,
        plans: &[WeightingPlan],
        nested_in_carved: bool,
    ) -> GroupNode {
        match plans {
            [] => GroupNode::Uniform,
            [plan] => self.compile_single(group, stratum, filter, plan, nested_in_carved),
            _ => GroupNode::Rim(WeightingSchemeDetails {
                dimensions: plans
                    .iter()
                    .map(|plan| {
                        Dimension::single(
                            &plan.variable_identifier,
                            plan.targets.iter().map(|t| (t.entity_instance_id, t.target)),
                        )
                    })
                    .collect(),
            }),
        }
    }

    fn compile_single(
        &mut self,
        group: usize,
        stratum: Option<i32>,
        filter: &RespondentFilter,
        plan: &WeightingPlan,
        nested_in_carved: bool,
    ) -> GroupNode {
        let variable = plan.variable_identifier.as_str();
        let has_children = plan.targets.iter().any(|t| !t.child_plans.is_empty());

        if !has_children {
            if !plan.targets.is_empty() && plan.targets.iter().all(|t| t.target_population.is_some()) {
                return GroupNode::Expansion {
                    variable: variable.to_string(),
                    populations: plan
                        .targets
                        .iter()
                        .filter_map(|t| t.target_population.map(|p| (t.entity_instance_id, p)))
                        .collect(),
                };
            }
            return GroupNode::Rim(WeightingSchemeDetails {
                dimensions: vec![Dimension::single(
                    variable,
                    plan.targets.iter().map(|t| (t.entity_instance_id, t.target)),
                )],
            });
        }

        let branches = plan
            .targets
            .iter()
            .map(|target| {
                let scale = match (target.target, target.target_population) {
                    (Some(p), _) => BranchScale::Proportion(p),
                    (None, Some(population)) => BranchScale::Population(population),
                    (None, None) => BranchScale::Unscaled,
                };
                let branch_filter = filter.with(variable, target.entity_instance_id);
                let carves = target.is_weighting_group_root && !target.child_plans.is_empty();

                let node = if carves && !nested_in_carved {
                    // Populations travel with the carved group; proportions are
                    // dropped because a carved group keeps its own mass.
                    let population = match scale {
                        BranchScale::Population(p) => Some(p),
                        _ => None,
                    };
                    let carved = self.carve(stratum, branch_filter, population, &target.child_plans, true);
                    GroupNode::Detached { group: carved }
                } else {
                    if carves {
                        let dominated = DominatedRoot {
                            group: self.partition.groups[group].name.clone(),
                            path: describe_path(&branch_filter.conditions),
                        };
                        tracing::warn!(
                            group = %dominated.group,
                            path = %dominated.path,
                            "group root flag inside another weighting group is ignored"
                        );
                        self.partition.dominated_roots.push(dominated);
                    }
                    self.compile(group, stratum, &branch_filter, &target.child_plans, nested_in_carved)
                };

                Branch {
                    entity_instance_id: target.entity_instance_id,
                    scale,
                    node,
                }
            })
            .collect();

        GroupNode::Nested {
            variable: variable.to_string(),
            branches,
        }
    }
}
