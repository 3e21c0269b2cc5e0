//! Evaluation of one weighting group's compiled tree into respondent weights.

use std::collections::BTreeSet;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::weighting::partitioner::{BranchScale, GroupNode, WeightingGroup};
use crate::weighting::quota_cells::QuotaCellEnumerator;
use crate::weighting::raking::{DimensionTargets, RakingCell, RakingEngine};
use crate::weighting::scheme::{Respondent, RespondentId, ResponseWeight, WeightingSchemeDetails};
use crate::weighting::validator::describe_path;

/// Data problems found while weighting a group. None of them stop the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// A targeted category with no respondents; its share is spread over the rest.
    EmptyCategory {
        path: String,
        dimension: String,
        category: String,
        target: f64,
    },
    ZeroSample { path: String },
    /// Respondents in a zero-target branch are left unweighted.
    ZeroTarget { path: String, respondents: usize },
    NoMatchingBranch {
        path: String,
        variable: String,
        respondents: usize,
    },
    ExcludedFromDimension {
        path: String,
        dimension: String,
        respondents: usize,
    },
}

/// Weights and run facts for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub group: usize,
    pub name: String,
    pub members: usize,
    /// Sorted by respondent id.
    pub weights: Vec<ResponseWeight>,
    pub unweighted: Vec<RespondentId>,
    pub detached: usize,
    pub iterations: u32,
    pub converged: bool,
    pub cancelled: bool,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupEvaluator {
    engine: RakingEngine,
}

struct Evaluation<'a> {
    engine: RakingEngine,
    cancel: Option<&'a CancellationToken>,
    members: Vec<&'a Respondent>,
    path: Vec<(String, i32)>,
    detached: BTreeSet<usize>,
    iterations: u32,
    converged: bool,
    cancelled: bool,
    diagnostics: Vec<Diagnostic>,
}

impl GroupEvaluator {
    pub fn new(engine: RakingEngine) -> Self {
        Self { engine }
    }

    /// Weights the members of `group` drawn from `respondents`.
    pub fn evaluate(
        &self,
        group: &WeightingGroup,
        respondents: &[Respondent],
        cancel: Option<&CancellationToken>,
    ) -> GroupOutcome {
        let members: Vec<&Respondent> = respondents.iter().filter(|r| group.filter.matches(r)).collect();
        let mut evaluation = Evaluation {
            engine: self.engine,
            cancel,
            members,
            path: group.filter.conditions.clone(),
            detached: BTreeSet::new(),
            iterations: 0,
            converged: true,
            cancelled: false,
            diagnostics: Vec::new(),
        };

        let everyone: Vec<usize> = (0..evaluation.members.len()).collect();
        let mut weighted = evaluation.node(&group.root, &everyone);

        match group.target_population {
            Some(population) if population <= 0.0 => {
                if !weighted.is_empty() {
                    let path = evaluation.here();
                    evaluation.report(Diagnostic::ZeroTarget {
                        path,
                        respondents: weighted.len(),
                    });
                    weighted.clear();
                }
            }
            Some(population) => {
                let mass: f64 = weighted.iter().map(|(_, w)| w).sum();
                if mass > 0.0 {
                    for (_, weight) in weighted.iter_mut() {
                        *weight *= population / mass;
                    }
                }
            }
            None => {}
        }

        let weighted_positions: BTreeSet<usize> = weighted.iter().map(|(i, _)| *i).collect();
        let mut unweighted: Vec<RespondentId> = everyone
            .iter()
            .filter(|i| !weighted_positions.contains(i) && !evaluation.detached.contains(i))
            .map(|&i| evaluation.members[i].id)
            .collect();
        unweighted.sort_unstable();

        let mut weights: Vec<ResponseWeight> = weighted
            .into_iter()
            .map(|(i, weight)| ResponseWeight {
                respondent_id: evaluation.members[i].id,
                weight,
            })
            .collect();
        weights.sort_by_key(|w| w.respondent_id);

        GroupOutcome {
            group: group.id,
            name: group.name.clone(),
            members: evaluation.members.len(),
            weights,
            unweighted,
            detached: evaluation.detached.len(),
            iterations: evaluation.iterations,
            converged: evaluation.converged,
            cancelled: evaluation.cancelled,
            diagnostics: evaluation.diagnostics,
        }
    }
}

impl Evaluation<'_> {
    fn here(&self) -> String {
        describe_path(&self.path)
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        tracing::warn!(?diagnostic, "weighting data issue");
        self.diagnostics.push(diagnostic);
    }

    fn node(&mut self, node: &GroupNode, members: &[usize]) -> Vec<(usize, f64)> {
        if let GroupNode::Detached { .. } = node {
            self.detached.extend(members.iter().copied());
            return Vec::new();
        }
        if members.is_empty() {
            let path = self.here();
            self.report(Diagnostic::ZeroSample { path });
            return Vec::new();
        }

        match node {
            GroupNode::Uniform => members.iter().map(|&i| (i, 1.0)).collect(),
            GroupNode::Rim(details) => self.rim(details, members),
            GroupNode::Expansion { variable, populations } => {
                let mut weighted = Vec::new();
                let mut matched = 0;
                for (&instance, &population) in populations {
                    let cell: Vec<usize> = members
                        .iter()
                        .copied()
                        .filter(|&i| self.members[i].answer(variable) == Some(instance))
                        .collect();
                    matched += cell.len();
                    if population <= 0.0 {
                        if !cell.is_empty() {
                            self.path.push((variable.clone(), instance));
                            let path = self.here();
                            self.path.pop();
                            self.report(Diagnostic::ZeroTarget {
                                path,
                                respondents: cell.len(),
                            });
                        }
                        continue;
                    }
                    if cell.is_empty() {
                        let path = self.here();
                        self.report(Diagnostic::EmptyCategory {
                            path,
                            dimension: variable.clone(),
                            category: instance.to_string(),
                            target: population,
                        });
                        continue;
                    }
                    let weight = population / cell.len() as f64;
                    weighted.extend(cell.into_iter().map(|i| (i, weight)));
                }
                let unmatched = members.len() - matched;
                if unmatched > 0 {
                    let path = self.here();
                    self.report(Diagnostic::NoMatchingBranch {
                        path,
                        variable: variable.clone(),
                        respondents: unmatched,
                    });
                }
                weighted
            }
            GroupNode::Nested { variable, branches } => {
                let mut matched = 0;
                let mut scaled: Vec<(BranchScale, Vec<(usize, f64)>)> = Vec::new();

                for branch in branches {
                    let branch_members: Vec<usize> = members
                        .iter()
                        .copied()
                        .filter(|&i| self.members[i].answer(variable) == Some(branch.entity_instance_id))
                        .collect();
                    matched += branch_members.len();

                    self.path.push((variable.clone(), branch.entity_instance_id));
                    let zero_target = matches!(
                        branch.scale,
                        BranchScale::Proportion(t) | BranchScale::Population(t) if t <= 0.0
                    );
                    if zero_target && !branch_members.is_empty() && !matches!(branch.node, GroupNode::Detached { .. }) {
                        let path = self.here();
                        self.report(Diagnostic::ZeroTarget {
                            path,
                            respondents: branch_members.len(),
                        });
                    } else if !(zero_target && branch_members.is_empty()) {
                        let weights = self.node(&branch.node, &branch_members);
                        if !weights.is_empty() {
                            scaled.push((branch.scale, weights));
                        }
                    }
                    self.path.pop();
                }

                let unmatched = members.len() - matched;
                if unmatched > 0 {
                    let path = self.here();
                    self.report(Diagnostic::NoMatchingBranch {
                        path,
                        variable: variable.clone(),
                        respondents: unmatched,
                    });
                }

                scale_branches(scaled)
            }
            GroupNode::Detached { .. } => Vec::new(),
        }
    }

    fn rim(&mut self, details: &WeightingSchemeDetails, members: &[usize]) -> Vec<(usize, f64)> {
        let respondents: Vec<&Respondent> = members.iter().map(|&i| self.members[i]).collect();
        let assignment = QuotaCellEnumerator::build_cells(details, &respondents);

        for dimension in &assignment.dimensions {
            let excluded = dimension.excluded();
            if excluded > 0 {
                let path = self.here();
                self.report(Diagnostic::ExcludedFromDimension {
                    path,
                    dimension: dimension.name.clone(),
                    respondents: excluded,
                });
            }
        }

        let occupied = assignment.occupied_cells();
        let cells: Vec<RakingCell> = occupied
            .iter()
            .map(|(cell, positions)| RakingCell::new(cell.categories().to_vec(), positions.len()))
            .collect();
        let targets: Vec<DimensionTargets> = assignment
            .dimensions
            .iter()
            .map(|d| DimensionTargets {
                name: d.name.clone(),
                targets: d.resolved_targets(),
            })
            .collect();

        let outcome = self.engine.rake(&cells, &targets, self.cancel);
        self.iterations = self.iterations.max(outcome.iterations);
        self.converged &= outcome.converged;
        self.cancelled |= outcome.cancelled;

        for empty in outcome.empty_categories {
            let category = assignment
                .dimensions
                .iter()
                .find(|d| d.name == empty.dimension)
                .and_then(|d| d.categories.get(empty.category).cloned())
                .unwrap_or_else(|| empty.category.to_string());
            let path = self.here();
            self.report(Diagnostic::EmptyCategory {
                path,
                dimension: empty.dimension,
                category,
                target: empty.target,
            });
        }

        occupied
            .iter()
            .zip(outcome.weights)
            .flat_map(|((_, positions), weight)| positions.iter().map(move |&p| (members[p], weight)))
            .collect()
    }
}

/// Applies sibling scaling: proportion branches share the weighted count of
/// all proportion branches, population branches are expanded to their totals.
fn scale_branches(branches: Vec<(BranchScale, Vec<(usize, f64)>)>) -> Vec<(usize, f64)> {
    let proportion_total: f64 = branches
        .iter()
        .filter_map(|(scale, _)| match scale {
            BranchScale::Proportion(p) => Some(*p),
            _ => None,
        })
        .sum();
    let proportion_count: usize = branches
        .iter()
        .filter(|(scale, _)| matches!(scale, BranchScale::Proportion(_)))
        .map(|(_, weights)| weights.len())
        .sum();

    branches
        .into_iter()
        .flat_map(|(scale, weights)| {
            let mass: f64 = weights.iter().map(|(_, w)| w).sum();
            let factor = match scale {
                BranchScale::Proportion(p) if proportion_total > 0.0 && mass > 0.0 => {
                    p / proportion_total * proportion_count as f64 / mass
                }
                BranchScale::Population(population) if mass > 0.0 => population / mass,
                _ => 1.0,
            };
            weights.into_iter().map(move |(i, w)| (i, w * factor))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weighting::partitioner::{Branch, RespondentFilter};
    use crate::weighting::scheme::Dimension;

    fn group(root: GroupNode) -> WeightingGroup {
        WeightingGroup {
            id: 0,
            name: "Root".into(),
            stratum: None,
            filter: RespondentFilter::default(),
            target_population: None,
            root,
        }
    }

    fn sample(layout: &[(i32, i32, usize)]) -> Vec<Respondent> {
        let mut id = 0;
        let mut respondents = Vec::new();
        for &(region, gender, count) in layout {
            for _ in 0..count {
                id += 1;
                respondents.push(Respondent::new(id).with_answer("region", region).with_answer("gender", gender));
            }
        }
        respondents
    }

    fn total(outcome: &GroupOutcome, ids: impl Fn(RespondentId) -> bool) -> f64 {
        outcome
            .weights
            .iter()
            .filter(|w| ids(w.respondent_id))
            .map(|w| w.weight)
            .sum()
    }

    fn gender_rim() -> GroupNode {
        GroupNode::Rim(WeightingSchemeDetails {
            dimensions: vec![Dimension::single("gender", [(1, Some(0.5)), (2, Some(0.5))])],
        })
    }

    #[test]
    fn test_nested_proportions_split_weighted_count() {
        // Region 1: ids 1..=80, region 2: ids 81..=100.
        let respondents = sample(&[(1, 1, 60), (1, 2, 20), (2, 1, 10), (2, 2, 10)]);
        let root = GroupNode::Nested {
            variable: "region".into(),
            branches: vec![
                Branch {
                    entity_instance_id: 1,
                    scale: BranchScale::Proportion(0.5),
                    node: gender_rim(),
                },
                Branch {
                    entity_instance_id: 2,
                    scale: BranchScale::Proportion(0.5),
                    node: gender_rim(),
                },
            ],
        };

        let outcome = GroupEvaluator::default().evaluate(&group(root), &respondents, None);
        assert!(outcome.converged);
        assert_eq!(outcome.weights.len(), 100);
        assert!((total(&outcome, |id| id <= 80) - 50.0).abs() < 1e-6);
        assert!((total(&outcome, |id| id > 80) - 50.0).abs() < 1e-6);
        assert!((total(&outcome, |id| id <= 60) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_expansion_weights_to_population() {
        let respondents = sample(&[(1, 1, 4), (2, 1, 1), (3, 1, 2)]);
        let root = GroupNode::Expansion {
            variable: "region".into(),
            populations: [(1, 100.0), (2, 30.0), (4, 10.0)].into_iter().collect(),
        };
        let outcome = GroupEvaluator::default().evaluate(&group(root), &respondents, None);

        assert_eq!(outcome.weights[0].weight, 25.0);
        assert_eq!(outcome.weights[4].weight, 30.0);
        assert_eq!(outcome.unweighted, vec![6, 7]);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::EmptyCategory { category, .. } if category == "4")));
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::NoMatchingBranch { respondents: 2, .. })));
    }

    #[test]
    fn test_detached_and_zero_target_branches() {
        let respondents = sample(&[(1, 1, 5), (2, 1, 5), (3, 1, 5)]);
        let root = GroupNode::Nested {
            variable: "region".into(),
            branches: vec![
                Branch {
                    entity_instance_id: 1,
                    scale: BranchScale::Proportion(1.0),
                    node: GroupNode::Uniform,
                },
                Branch {
                    entity_instance_id: 2,
                    scale: BranchScale::Unscaled,
                    node: GroupNode::Detached { group: 1 },
                },
                Branch {
                    entity_instance_id: 3,
                    scale: BranchScale::Proportion(0.0),
                    node: GroupNode::Uniform,
                },
            ],
        };
        let outcome = GroupEvaluator::default().evaluate(&group(root), &respondents, None);

        assert_eq!(outcome.weights.len(), 5);
        assert_eq!(outcome.detached, 5);
        assert_eq!(outcome.unweighted, vec![11, 12, 13, 14, 15]);
        assert!(matches!(
            outcome.diagnostics.as_slice(),
            [Diagnostic::ZeroTarget { respondents: 5, .. }]
        ));
    }

    #[test]
    fn test_group_population_scales_total() {
        let respondents = sample(&[(1, 1, 3), (1, 2, 1)]);
        let mut weighted = group(gender_rim());
        weighted.target_population = Some(1000.0);
        let outcome = GroupEvaluator::default().evaluate(&weighted, &respondents, None);
        assert!((total(&outcome, |_| true) - 1000.0).abs() < 1e-6);
        assert!((outcome.weights[3].weight - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_population_cell_leaves_members_unweighted() {
        let respondents = sample(&[(1, 1, 3), (2, 1, 2)]);
        let root = GroupNode::Expansion {
            variable: "region".into(),
            populations: [(1, 0.0), (2, 50.0)].into_iter().collect(),
        };
        let outcome = GroupEvaluator::default().evaluate(&group(root), &respondents, None);

        assert_eq!(outcome.weights.len(), 2);
        assert!(outcome.weights.iter().all(|w| w.weight == 25.0));
        assert_eq!(outcome.unweighted, vec![1, 2, 3]);
        assert_eq!(
            outcome.diagnostics,
            vec![Diagnostic::ZeroTarget {
                path: "region:1".into(),
                respondents: 3
            }]
        );
    }

    #[test]
    fn test_zero_group_population_leaves_members_unweighted() {
        let respondents = sample(&[(1, 1, 3), (1, 2, 1)]);
        let mut carved = group(gender_rim());
        carved.target_population = Some(0.0);
        let outcome = GroupEvaluator::default().evaluate(&carved, &respondents, None);

        assert!(outcome.weights.is_empty());
        assert_eq!(outcome.unweighted, vec![1, 2, 3, 4]);
        assert!(matches!(
            outcome.diagnostics.as_slice(),
            [Diagnostic::ZeroTarget { respondents: 4, .. }]
        ));
    }

    #[test]
    fn test_filter_limits_members_and_empty_group_reports_zero_sample() {
        let respondents = sample(&[(1, 1, 3)]);
        let mut filtered = group(GroupNode::Uniform);
        filtered.filter = RespondentFilter {
            conditions: vec![("region".into(), 2)],
        };
        let outcome = GroupEvaluator::default().evaluate(&filtered, &respondents, None);
        assert_eq!(outcome.members, 0);
        assert!(outcome.weights.is_empty());
        assert_eq!(
            outcome.diagnostics,
            vec![Diagnostic::ZeroSample {
                path: "region:2".into()
            }]
        );
    }
}
