//! Weight summary statistics: histogram, range, and efficiency score.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DistributionConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DistributionError {
    #[error("bucket factor must be positive and finite, got {0}")]
    InvalidBucketFactor(f64),
    #[error("weight {weight} for position {position} is not a finite non-negative number")]
    InvalidWeight { position: usize, weight: f64 },
}

/// Histogram of weights in buckets of width `bucket_factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsDistribution {
    pub buckets: Vec<u64>,
    pub bucket_factor: f64,
}

/// Summary of one weighting computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RimWeightingCalculationResult {
    pub min_weight: f64,
    pub max_weight: f64,
    /// Kish effective sample size as a percentage of the actual size.
    pub efficiency_score: f64,
    pub iterations_required: u32,
    pub converged: bool,
    pub weights_distribution: WeightsDistribution,
}

#[derive(Debug, Clone, Copy)]
pub struct WeightDistributionBuilder {
    max_buckets: usize,
}

impl Default for WeightDistributionBuilder {
    fn default() -> Self {
        Self { max_buckets: 40 }
    }
}

impl WeightDistributionBuilder {
    pub fn new(max_buckets: usize) -> Self {
        Self {
            max_buckets: max_buckets.max(1),
        }
    }

    pub fn from_config(config: &DistributionConfig) -> Self {
        Self::new(config.max_buckets)
    }

    /// Counts weights into `floor(w / bucket_factor)` buckets; the last
    /// bucket absorbs everything above the cap. Trailing empty buckets are
    /// dropped.
    pub fn build(&self, weights: &[f64], bucket_factor: f64) -> Result<WeightsDistribution, DistributionError> {
        if !(bucket_factor.is_finite() && bucket_factor > 0.0) {
            return Err(DistributionError::InvalidBucketFactor(bucket_factor));
        }

        let mut buckets = vec![0u64; self.max_buckets];
        for (position, &weight) in weights.iter().enumerate() {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(DistributionError::InvalidWeight { position, weight });
            }
            let index = ((weight / bucket_factor).floor() as usize).min(self.max_buckets - 1);
            buckets[index] += 1;
        }

        while buckets.last() == Some(&0) {
            buckets.pop();
        }

        Ok(WeightsDistribution { buckets, bucket_factor })
    }

    pub fn summarize(
        &self,
        weights: &[f64],
        bucket_factor: f64,
        iterations_required: u32,
        converged: bool,
    ) -> Result<RimWeightingCalculationResult, DistributionError> {
        let weights_distribution = self.build(weights, bucket_factor)?;
        let (min_weight, max_weight) = if weights.is_empty() {
            (0.0, 0.0)
        } else {
            weights
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &w| (lo.min(w), hi.max(w)))
        };

        Ok(RimWeightingCalculationResult {
            min_weight,
            max_weight,
            efficiency_score: efficiency_score(weights),
            iterations_required,
            converged,
            weights_distribution,
        })
    }
}

/// `(Σw)² / (n · Σw²) · 100`, or 0 for an empty or all-zero set.
pub fn efficiency_score(weights: &[f64]) -> f64 {
    let n = weights.len() as f64;
    let sum: f64 = weights.iter().sum();
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if n == 0.0 || sum_sq == 0.0 {
        return 0.0;
    }
    sum * sum / (n * sum_sq) * 100.0
}
