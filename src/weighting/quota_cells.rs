//! Quota-cell enumeration: mapping respondents onto the categories of each
//! rim dimension and grouping them by their combined cell.

use std::collections::BTreeMap;

use crate::weighting::scheme::{Respondent, RespondentId, WeightingSchemeDetails, cell_key};

/// Category index per dimension. `None` means the respondent falls outside
/// that dimension and is not adjusted by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuotaCell(pub Vec<Option<usize>>);

impl QuotaCell {
    pub fn categories(&self) -> &[Option<usize>] {
        &self.0
    }
}

/// Categories of one dimension with each respondent's position in them.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionCells {
    pub name: String,
    /// Cell keys in the scheme's (sorted) order.
    pub categories: Vec<String>,
    pub targets: Vec<Option<f64>>,
    /// Indexed like [`QuotaCellAssignment::respondent_ids`].
    pub assignments: Vec<Option<usize>>,
}

impl DimensionCells {
    /// Respondent count per category.
    pub fn sample_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.categories.len()];
        for index in self.assignments.iter().flatten() {
            counts[*index] += 1;
        }
        counts
    }

    /// Final per-category targets.
    ///
    /// Untargeted categories keep their sample share; explicit targets are
    /// applied to whatever share the untargeted ones leave over.
    pub fn resolved_targets(&self) -> Vec<f64> {
        let counts = self.sample_counts();
        let total: usize = counts.iter().sum();
        if total == 0 {
            return self.targets.iter().map(|t| t.unwrap_or(0.0)).collect();
        }

        let share = |i: usize| counts[i] as f64 / total as f64;
        let untargeted_share: f64 = self
            .targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_none())
            .map(|(i, _)| share(i))
            .sum();

        self.targets
            .iter()
            .enumerate()
            .map(|(i, target)| match target {
                Some(p) => p * (1.0 - untargeted_share),
                None => share(i),
            })
            .collect()
    }

    /// Respondents not placed in any category of this dimension.
    pub fn excluded(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_none()).count()
    }
}

/// Result of placing a set of respondents into a scheme's dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCellAssignment {
    pub respondent_ids: Vec<RespondentId>,
    pub dimensions: Vec<DimensionCells>,
}

impl QuotaCellAssignment {
    pub fn cell_of(&self, respondent: usize) -> QuotaCell {
        QuotaCell(
            self.dimensions
                .iter()
                .map(|d| d.assignments[respondent])
                .collect(),
        )
    }

    /// Occupied cells and the respondent positions in each, in cell order.
    pub fn occupied_cells(&self) -> Vec<(QuotaCell, Vec<usize>)> {
        let mut cells: BTreeMap<QuotaCell, Vec<usize>> = BTreeMap::new();
        for respondent in 0..self.respondent_ids.len() {
            cells.entry(self.cell_of(respondent)).or_default().push(respondent);
        }
        cells.into_iter().collect()
    }
}

pub struct QuotaCellEnumerator;

impl QuotaCellEnumerator {
    /// Size of the full cross product, saturating at `u128::MAX`.
    pub fn quota_cell_count(scheme: &WeightingSchemeDetails) -> u128 {
        scheme
            .dimensions
            .iter()
            .fold(1u128, |acc, d| acc.saturating_mul(d.category_count() as u128))
    }

    /// Places every respondent into each dimension by its cell key.
    pub fn build_cells(scheme: &WeightingSchemeDetails, respondents: &[&Respondent]) -> QuotaCellAssignment {
        let dimensions = scheme
            .dimensions
            .iter()
            .map(|dimension| {
                let categories: Vec<String> = dimension.cell_targets.keys().cloned().collect();
                let targets = dimension.cell_targets.values().copied().collect();
                let index: BTreeMap<&str, usize> = categories
                    .iter()
                    .enumerate()
                    .map(|(i, key)| (key.as_str(), i))
                    .collect();

                let assignments = respondents
                    .iter()
                    .map(|respondent| {
                        let values: Option<Vec<i32>> = dimension
                            .interlocked_variable_identifiers
                            .iter()
                            .map(|variable| respondent.answer(variable))
                            .collect();
                        values.and_then(|v| index.get(cell_key(&v).as_str()).copied())
                    })
                    .collect();

                DimensionCells {
                    name: dimension.name(),
                    categories,
                    targets,
                    assignments,
                }
            })
            .collect();

        QuotaCellAssignment {
            respondent_ids: respondents.iter().map(|r| r.id).collect(),
            dimensions,
        }
    }
}
