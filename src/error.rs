//! Error types shared across the weighting engine.
//!
//! Configuration problems are returned as values so callers can render the
//! reason directly; only store and worker faults bubble up as run failures.

use thiserror::Error;

use crate::weighting::distribution::DistributionError;
use crate::weighting::import::ImportError;
use crate::weighting::scheme::RespondentId;
use crate::weighting::validator::PlanValidationError;

/// Why a weighting scheme was rejected before raking.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReason {
    #[error("scheme has {quota_cells} quota cells, the limit is {limit}")]
    TooManyQuotaCells { quota_cells: u128, limit: u64 },
    #[error("targets for dimension '{dimension}' sum to {sum}, expected 1")]
    DimensionDoesNotSumToOne { dimension: String, sum: f64 },
    #[error("target {target} for category '{category}' of dimension '{dimension}' is outside [0, 1]")]
    TargetOutOfRange {
        dimension: String,
        category: String,
        target: f64,
    },
    #[error("scheme has no dimensions")]
    NoDimensions,
}

/// Violations of the one-scheme-per-filter-value rule of a strategy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error("strategy has no schemes")]
    NoSchemes,
    #[error("strategy without a filter metric must have exactly one scheme, found {count}")]
    UnfilteredSchemeCount { count: usize },
    #[error("strategy without a filter metric cannot key a scheme by entity {entity_id}")]
    UnexpectedFilterEntity { entity_id: i32 },
    #[error("every scheme of a strategy filtered by '{metric}' needs an entity id")]
    MissingFilterEntity { metric: String },
    #[error("filter metric entity {entity_id} has more than one scheme")]
    DuplicateFilterEntity { entity_id: i32 },
}

/// Weight store failures.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

/// Failures of a whole weighting run.
#[derive(Debug, Error)]
pub enum WeightingError {
    #[error("invalid weighting strategy: {0}")]
    InvalidStrategy(#[from] StrategyError),
    #[error(transparent)]
    InvalidPlan(#[from] PlanValidationError),
    #[error("scheme for weighting group '{group}' is invalid: {reason}")]
    InvalidScheme { group: String, reason: InvalidReason },
    #[error("weight import failed: {0}")]
    Import(#[from] ImportError),
    #[error(transparent)]
    Distribution(#[from] DistributionError),
    #[error("worker for weighting group '{group}' failed: {message}")]
    Worker { group: String, message: String },
    #[error("respondent {respondent_id} appears more than once in the answer snapshot")]
    DuplicateRespondent { respondent_id: RespondentId },
    #[error("{groups} weighting group(s) did not converge")]
    NotConverged { groups: usize },
    #[error("failed to persist weights: {0}")]
    Persistence(#[from] RepositoryError),
}
