//! Cross-component scenarios: partition, rake, summarize.

use proptest::prelude::*;

use super::distribution::WeightDistributionBuilder;
use super::nested::{Diagnostic, GroupEvaluator};
use super::partitioner::WeightingGroupPartitioner;
use super::quota_cells::QuotaCellEnumerator;
use super::raking::{DimensionTargets, RakingCell, RakingEngine};
use super::scheme::{
    Dimension, Respondent, SchemeDefinition, WeightingPlan, WeightingScheme, WeightingSchemeDetails,
    WeightingStrategy, WeightingTarget,
};

const MALE: i32 = 1;
const FEMALE: i32 = 2;

fn gender_age_scheme() -> WeightingSchemeDetails {
    WeightingSchemeDetails {
        dimensions: vec![
            Dimension::single("gender", [(MALE, Some(0.5)), (FEMALE, Some(0.5))]),
            Dimension::single("age", [(1, Some(0.3)), (2, Some(0.4)), (3, Some(0.3))]),
        ],
    }
}

/// 700 men and 300 women, with younger men over-represented.
fn skewed_sample() -> Vec<Respondent> {
    (0..1000)
        .map(|id| {
            let gender = if id < 700 { MALE } else { FEMALE };
            let age = match (gender, id % 10) {
                (MALE, 0..=5) => 1,
                (MALE, 6..=8) => 2,
                (FEMALE, 0..=2) => 1,
                (FEMALE, 3..=6) => 2,
                _ => 3,
            };
            Respondent::new(id).with_answer("gender", gender).with_answer("age", age)
        })
        .collect()
}

fn strategy(plans: Vec<WeightingPlan>) -> WeightingStrategy {
    WeightingStrategy {
        product_short_code: "retail".into(),
        sub_product_id: None,
        subset_id: None,
        filter_metric: None,
        schemes: vec![WeightingScheme {
            filter_metric_entity_id: None,
            definition: SchemeDefinition::Plans { plans },
        }],
    }
}

fn rake(scheme: &WeightingSchemeDetails, respondents: &[Respondent]) -> (Vec<RakingCell>, Vec<DimensionTargets>) {
    let refs: Vec<&Respondent> = respondents.iter().collect();
    let assignment = QuotaCellEnumerator::build_cells(scheme, &refs);
    let cells = assignment
        .occupied_cells()
        .into_iter()
        .map(|(cell, members)| RakingCell::new(cell.0, members.len()))
        .collect();
    let targets = assignment
        .dimensions
        .iter()
        .map(|d| DimensionTargets {
            name: d.name.clone(),
            targets: d.resolved_targets(),
        })
        .collect();
    (cells, targets)
}

#[test]
fn test_skewed_gender_sample_is_balanced() {
    let respondents = skewed_sample();
    let partition = WeightingGroupPartitioner::partition(&WeightingStrategy {
        schemes: vec![WeightingScheme {
            filter_metric_entity_id: None,
            definition: SchemeDefinition::Rim(gender_age_scheme()),
        }],
        ..strategy(Vec::new())
    });
    let outcome = GroupEvaluator::default().evaluate(&partition.groups[0], &respondents, None);

    assert!(outcome.converged);
    let men: f64 = outcome
        .weights
        .iter()
        .filter(|w| w.respondent_id < 700)
        .map(|w| w.weight)
        .sum();
    let women: f64 = outcome
        .weights
        .iter()
        .filter(|w| w.respondent_id >= 700)
        .map(|w| w.weight)
        .sum();
    assert!((men - 500.0).abs() < 0.1, "men weighted to {men}");
    assert!((women - 500.0).abs() < 0.1, "women weighted to {women}");

    let total: f64 = outcome.weights.iter().map(|w| w.weight).sum();
    for (age, share) in [(1, 0.3), (2, 0.4), (3, 0.3)] {
        let mass: f64 = outcome
            .weights
            .iter()
            .filter(|w| respondents[w.respondent_id as usize].answer("age") == Some(age))
            .map(|w| w.weight)
            .sum();
        assert!((mass / total - share).abs() < 1e-3, "age {age} weighted to {mass}");
    }

    let weights: Vec<f64> = outcome.weights.iter().map(|w| w.weight).collect();
    let summary = WeightDistributionBuilder::default()
        .summarize(&weights, 0.25, outcome.iterations, outcome.converged)
        .unwrap();
    assert!(summary.efficiency_score < 100.0);
    assert!(summary.min_weight > 0.0);
    assert_eq!(summary.weights_distribution.buckets.iter().sum::<u64>(), 1000);
}

#[test]
fn test_reraking_converged_weights_is_a_no_op() {
    let (mut cells, targets) = rake(&gender_age_scheme(), &skewed_sample());
    let engine = RakingEngine::default();
    let first = engine.rake(&cells, &targets, None);
    assert!(first.converged);

    for (cell, weight) in cells.iter_mut().zip(&first.weights) {
        cell.weight = *weight;
    }
    let second = engine.rake(&cells, &targets, None);
    assert!(second.converged);
    assert!(second.iterations <= 1);
    for (a, b) in first.weights.iter().zip(&second.weights) {
        assert!((a - b).abs() < 1e-3);
    }
}

#[test]
fn test_carved_groups_each_keep_their_mass() {
    let gender = || {
        WeightingPlan::new(
            "gender",
            vec![
                WeightingTarget::proportion(MALE, 0.5),
                WeightingTarget::proportion(FEMALE, 0.5),
            ],
        )
    };
    let plans = vec![WeightingPlan::new(
        "age",
        vec![
            WeightingTarget::proportion(1, 0.5).with_children(vec![gender()]),
            WeightingTarget::proportion(2, 0.3).with_children(vec![gender()]),
            WeightingTarget::proportion(3, 0.2)
                .with_children(vec![gender()])
                .as_group_root(),
        ],
    )];
    let respondents = skewed_sample();
    let partition = WeightingGroupPartitioner::partition(&strategy(plans));
    assert_eq!(partition.groups.len(), 2);

    let evaluator = GroupEvaluator::default();
    let root = evaluator.evaluate(&partition.groups[0], &respondents, None);
    let carved = evaluator.evaluate(&partition.groups[1], &respondents, None);

    let age3 = respondents.iter().filter(|r| r.answer("age") == Some(3)).count();
    assert_eq!(carved.members, age3);
    assert_eq!(root.detached, age3);

    let root_mass: f64 = root.weights.iter().map(|w| w.weight).sum();
    let carved_mass: f64 = carved.weights.iter().map(|w| w.weight).sum();
    assert!((root_mass - (1000 - age3) as f64).abs() < 1e-6);
    assert!((carved_mass - age3 as f64).abs() < 1e-6);

    // Age 1 gets 0.5 / 0.8 of the root group's mass.
    let age1: f64 = root
        .weights
        .iter()
        .filter(|w| respondents[w.respondent_id as usize].answer("age") == Some(1))
        .map(|w| w.weight)
        .sum();
    assert!((age1 - root_mass * 0.625).abs() < 1e-6);
}

#[test]
fn test_expansion_group_sums_to_population() {
    let plans = vec![WeightingPlan::new(
        "gender",
        vec![
            WeightingTarget::population(MALE, 48_000.0),
            WeightingTarget::population(FEMALE, 52_000.0),
        ],
    )];
    let partition = WeightingGroupPartitioner::partition(&strategy(plans));
    let outcome = GroupEvaluator::default().evaluate(&partition.groups[0], &skewed_sample(), None);
    let total: f64 = outcome.weights.iter().map(|w| w.weight).sum();
    assert!((total - 100_000.0).abs() < 1e-6);
}

#[test]
fn test_zero_population_category_is_left_unweighted() {
    let plans = vec![WeightingPlan::new(
        "gender",
        vec![
            WeightingTarget::population(MALE, 0.0),
            WeightingTarget::population(FEMALE, 500.0),
        ],
    )];
    let partition = WeightingGroupPartitioner::partition(&strategy(plans));
    let outcome = GroupEvaluator::default().evaluate(&partition.groups[0], &skewed_sample(), None);

    assert!(outcome.weights.iter().all(|w| w.weight > 0.0));
    assert_eq!(outcome.weights.len(), 300);
    assert_eq!(outcome.unweighted.len(), 700);
    assert!(outcome.unweighted.iter().all(|&id| id < 700));
}

#[test]
fn test_zero_population_carved_group_is_left_unweighted() {
    let gender = || {
        WeightingPlan::new(
            "gender",
            vec![
                WeightingTarget::proportion(MALE, 0.5),
                WeightingTarget::proportion(FEMALE, 0.5),
            ],
        )
    };
    let plans = vec![WeightingPlan::new(
        "age",
        vec![
            WeightingTarget::population(1, 0.0)
                .with_children(vec![gender()])
                .as_group_root(),
            WeightingTarget::population(2, 400.0).with_children(vec![gender()]),
            WeightingTarget::population(3, 300.0).with_children(vec![gender()]),
        ],
    )];
    let respondents = skewed_sample();
    let partition = WeightingGroupPartitioner::partition(&strategy(plans));
    assert_eq!(partition.groups.len(), 2);

    let evaluator = GroupEvaluator::default();
    let root = evaluator.evaluate(&partition.groups[0], &respondents, None);
    let carved = evaluator.evaluate(&partition.groups[1], &respondents, None);

    let age1 = respondents.iter().filter(|r| r.answer("age") == Some(1)).count();
    assert_eq!(root.detached, age1);
    assert!(root.weights.iter().all(|w| w.weight > 0.0));
    assert!(carved.weights.is_empty());
    assert_eq!(carved.unweighted.len(), age1);
    assert!(carved
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::ZeroTarget { .. })));
}

fn cells_strategy() -> impl Strategy<Value = Vec<(Option<usize>, Option<usize>, usize)>> {
    prop::collection::vec(
        (
            prop::option::weighted(0.9, 0usize..2),
            prop::option::weighted(0.9, 0usize..3),
            1usize..60,
        ),
        1..12,
    )
}

fn targets_strategy(len: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.05f64..1.0, len).prop_map(|raw| {
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|t| t / total).collect()
    })
}

proptest! {
    #[test]
    fn prop_raking_keeps_weights_positive_and_mass_constant(
        layout in cells_strategy(),
        gender in targets_strategy(2),
        age in targets_strategy(3),
    ) {
        let cells: Vec<RakingCell> = layout
            .iter()
            .map(|&(g, a, n)| RakingCell::new(vec![g, a], n))
            .collect();
        let targets = vec![
            DimensionTargets { name: "gender".into(), targets: gender },
            DimensionTargets { name: "age".into(), targets: age },
        ];

        let outcome = RakingEngine::default().rake(&cells, &targets, None);

        prop_assert!(outcome.weights.iter().all(|w| *w > 0.0 && w.is_finite()));
        let before: f64 = cells.iter().map(|c| c.sample_size).sum();
        let after: f64 = cells.iter().zip(&outcome.weights).map(|(c, w)| c.sample_size * w).sum();
        prop_assert!((before - after).abs() < 1e-6 * before);
    }
}
