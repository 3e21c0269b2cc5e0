//! # Respondent weighting engine
//!
//! Rim weighting (iterative proportional fitting) of survey respondents
//! against hierarchical targets, with imported weight overrides and weight
//! distribution diagnostics.

pub mod distribution;
pub mod import;
pub mod nested;
pub mod orchestrator;
pub mod partitioner;
pub mod quota_cells;
pub mod raking;
pub mod scheme;
pub mod validator;

#[cfg(test)]
mod tests;

pub use distribution::{RimWeightingCalculationResult, WeightDistributionBuilder, WeightsDistribution};
pub use import::{ImportedWeightMerger, Workbook};
pub use orchestrator::{WeightImport, WeightingRunOrchestrator, WeightingRunReport, WeightingRunRequest};
pub use partitioner::WeightingGroupPartitioner;
pub use quota_cells::QuotaCellEnumerator;
pub use raking::{RakingEngine, RakingSettings};
pub use validator::{PlanValidator, SchemeValidator};
