//! # Repository Layer
//!
//! SeaORM-backed storage for weighting output, plus the [`WeightStore`] seam
//! the orchestrator persists through.

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::weighting::scheme::{ResponseWeight, ResponseWeightingContextKey};

pub mod response_weight;

pub use response_weight::ResponseWeightRepository;

/// Destination of a run's final weights.
#[async_trait]
pub trait WeightStore: Send + Sync {
    /// Replaces every stored weight of `key` with `weights`, all or nothing.
    /// Returns the number of rows written.
    async fn replace_weights(
        &self,
        key: &ResponseWeightingContextKey,
        weights: &[ResponseWeight],
    ) -> Result<usize, RepositoryError>;
}
