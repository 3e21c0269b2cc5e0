//! Sequencing of one weighting run for a response weighting context.
//!
//! Validation runs up front and aborts before any numeric work. Groups are
//! then weighted on blocking workers, imported weights are merged on top,
//! statistics are computed and the final set is handed to the [`WeightStore`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{AppConfig, WeightingConfig};
use crate::error::WeightingError;
use crate::repositories::WeightStore;
use crate::telemetry::{RunContext, with_run_context};
use crate::weighting::distribution::{RimWeightingCalculationResult, WeightDistributionBuilder};
use crate::weighting::import::{ImportedWeightMerger, ValidationStatistics, Workbook};
use crate::weighting::nested::{Diagnostic, GroupEvaluator, GroupOutcome};
use crate::weighting::partitioner::{WeightingGroup, WeightingGroupPartitioner};
use crate::weighting::raking::RakingEngine;
use crate::weighting::scheme::{
    Respondent, RespondentId, ResponseWeight, ResponseWeightingContextKey, SchemeDefinition,
    WeightingStrategy,
};
use crate::weighting::validator::{PlanValidationMessage, PlanValidator, SchemeValidator};

/// Everything a run consumes: the target scope, configuration and answer snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightingRunRequest {
    pub context: ResponseWeightingContextKey,
    pub strategy: WeightingStrategy,
    pub respondents: Vec<Respondent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportSource {
    Workbook(Workbook),
    Rows(Vec<ResponseWeight>),
}

/// Manually supplied weights overriding computed ones.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightImport {
    pub source: ImportSource,
    /// When set, a failed import fails the run instead of being reported.
    pub required: bool,
}

/// Validated and partitioned strategy.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub groups: Vec<WeightingGroup>,
    pub warnings: Vec<PlanValidationMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupReport {
    pub group: usize,
    pub name: String,
    pub members: usize,
    pub weighted: usize,
    pub unweighted: usize,
    pub detached: usize,
    pub result: RimWeightingCalculationResult,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportReport {
    Merged(ValidationStatistics),
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightingRunReport {
    pub run_id: Uuid,
    pub context: ResponseWeightingContextKey,
    pub result: RimWeightingCalculationResult,
    pub groups: Vec<GroupReport>,
    pub respondents: usize,
    /// Respondents no group weighted; they are stored with weight 1.
    pub unweighted_respondents: usize,
    pub import: Option<ImportReport>,
    pub warnings: Vec<PlanValidationMessage>,
    pub cancelled: bool,
    pub persisted_rows: usize,
}

/// Validates a strategy and splits it into weighting groups.
pub fn preflight(strategy: &WeightingStrategy, config: &WeightingConfig) -> Result<Preflight, WeightingError> {
    strategy.validate()?;

    let plan_validator = PlanValidator::from_config(config);
    let mut warnings = Vec::new();
    for scheme in &strategy.schemes {
        if let SchemeDefinition::Plans { plans } = &scheme.definition {
            warnings.extend(plan_validator.ensure_valid(plans)?);
        }
    }

    let partition = WeightingGroupPartitioner::partition(strategy);
    let scheme_validator = SchemeValidator::from_config(config);
    for group in &partition.groups {
        for (path, details) in group.root.rim_schemes() {
            scheme_validator
                .validate(details)
                .map_err(|reason| WeightingError::InvalidScheme {
                    group: scheme_location(&group.name, &path),
                    reason,
                })?;
        }
    }

    Ok(Preflight {
        groups: partition.groups,
        warnings,
    })
}

fn scheme_location(group: &str, path: &str) -> String {
    match (group, path) {
        (_, "Root") => group.to_string(),
        ("Root", _) => path.to_string(),
        _ => format!("{group},{path}"),
    }
}

/// Runs weighting requests against a weight store.
#[derive(Clone)]
pub struct WeightingRunOrchestrator {
    store: Arc<dyn WeightStore>,
    config: AppConfig,
}

impl WeightingRunOrchestrator {
    pub fn new(store: Arc<dyn WeightStore>, config: AppConfig) -> Self {
        Self { store, config }
    }

    /// Executes one run; non-convergence is reported, not an error, unless
    /// `REQUIRE_CONVERGENCE` is set. Cancelled runs are never persisted.
    pub async fn run(
        &self,
        request: WeightingRunRequest,
        import: Option<WeightImport>,
        cancel: CancellationToken,
    ) -> Result<WeightingRunReport, WeightingError> {
        let run_id = Uuid::new_v4();
        with_run_context(RunContext { run_id }, self.run_in_context(run_id, request, import, cancel)).await
    }

    #[instrument(skip_all, fields(run_id = %run_id, context = %request.context))]
    async fn run_in_context(
        &self,
        run_id: Uuid,
        request: WeightingRunRequest,
        import: Option<WeightImport>,
        cancel: CancellationToken,
    ) -> Result<WeightingRunReport, WeightingError> {
        let started = Instant::now();
        counter!("weighting_runs_total").increment(1);

        let result = self.execute(run_id, request, import, cancel).await;
        if let Err(err) = &result {
            counter!("weighting_run_failures_total").increment(1);
            warn!(error = %err, "Weighting run failed");
        }

        histogram!("weighting_run_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: WeightingRunRequest,
        import: Option<WeightImport>,
        cancel: CancellationToken,
    ) -> Result<WeightingRunReport, WeightingError> {
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = request.respondents.iter().find(|r| !seen.insert(r.id)) {
            return Err(WeightingError::DuplicateRespondent {
                respondent_id: duplicate.id,
            });
        }
        let Preflight { groups, warnings } = preflight(&request.strategy, &self.config.weighting)?;
        info!(
            groups = groups.len(),
            respondents = request.respondents.len(),
            warnings = warnings.len(),
            "Starting weighting run"
        );

        let respondents = Arc::new(request.respondents);
        let outcomes = self.weigh_groups(groups, respondents.clone(), &cancel).await?;

        // Respondents outside every group keep weight 1.
        let mut computed: BTreeMap<RespondentId, f64> = respondents.iter().map(|r| (r.id, 1.0)).collect();
        let mut weighted = 0usize;
        for outcome in &outcomes {
            for w in &outcome.weights {
                if let Some(slot) = computed.get_mut(&w.respondent_id) {
                    *slot = w.weight;
                    weighted += 1;
                }
            }
        }
        let unweighted_respondents = computed.len().saturating_sub(weighted);

        let (final_weights, import_report) = match import {
            None => (computed, None),
            Some(import) => self.merge_import(computed, import)?,
        };

        let builder = WeightDistributionBuilder::from_config(&self.config.distribution);
        let bucket_factor = self.config.distribution.bucket_factor;

        let mut group_reports = Vec::with_capacity(outcomes.len());
        for outcome in &outcomes {
            let weights: Vec<f64> = outcome.weights.iter().map(|w| w.weight).collect();
            let result = builder.summarize(&weights, bucket_factor, outcome.iterations, outcome.converged)?;
            histogram!("weighting_group_iterations").record(f64::from(outcome.iterations));
            group_reports.push(GroupReport {
                group: outcome.group,
                name: outcome.name.clone(),
                members: outcome.members,
                weighted: outcome.weights.len(),
                unweighted: outcome.unweighted.len(),
                detached: outcome.detached,
                result,
                diagnostics: outcome.diagnostics.clone(),
            });
        }
        counter!("weighting_groups_total").increment(outcomes.len() as u64);

        let iterations = outcomes.iter().map(|o| o.iterations).max().unwrap_or(0);
        let non_converged = outcomes.iter().filter(|o| !o.converged).count();
        let all_weights: Vec<f64> = final_weights.values().copied().collect();
        let result = builder.summarize(&all_weights, bucket_factor, iterations, non_converged == 0)?;
        gauge!("weighting_run_efficiency_score").set(result.efficiency_score);

        let cancelled = cancel.is_cancelled() || outcomes.iter().any(|o| o.cancelled);
        let mut report = WeightingRunReport {
            run_id,
            context: request.context,
            result,
            groups: group_reports,
            respondents: respondents.len(),
            unweighted_respondents,
            import: import_report,
            warnings,
            cancelled,
            persisted_rows: 0,
        };

        if cancelled {
            warn!("Weighting run cancelled, weights were not persisted");
            return Ok(report);
        }

        if non_converged > 0 {
            counter!("weighting_non_converged_groups_total").increment(non_converged as u64);
            warn!(groups = non_converged, "Weighting groups did not converge");
            if self.config.weighting.require_convergence {
                return Err(WeightingError::NotConverged { groups: non_converged });
            }
        }

        let rows: Vec<ResponseWeight> = final_weights
            .into_iter()
            .map(|(respondent_id, weight)| ResponseWeight { respondent_id, weight })
            .collect();
        report.persisted_rows = self.store.replace_weights(&report.context, &rows).await?;

        info!(
            persisted = report.persisted_rows,
            efficiency = report.result.efficiency_score,
            iterations = report.result.iterations_required,
            "Weighting run completed"
        );
        Ok(report)
    }

    async fn weigh_groups(
        &self,
        groups: Vec<WeightingGroup>,
        respondents: Arc<Vec<Respondent>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupOutcome>, WeightingError> {
        let evaluator = GroupEvaluator::new(RakingEngine::new(self.config.weighting.raking_settings()));
        let semaphore = Arc::new(Semaphore::new(self.config.weighting.group_concurrency.max(1)));

        let mut handles = Vec::with_capacity(groups.len());
        for group in groups {
            let name = group.name.clone();
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WeightingError::Worker {
                    group: name.clone(),
                    message: "worker pool closed".to_string(),
                })?;
            let respondents = respondents.clone();
            let cancel = cancel.clone();

            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit; // Held until the group is weighted
                evaluator.evaluate(&group, &respondents, Some(&cancel))
            });
            handles.push((name, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = handle.await.map_err(|e| WeightingError::Worker {
                group: name,
                message: e.to_string(),
            })?;
            debug!(
                group = %outcome.name,
                members = outcome.members,
                iterations = outcome.iterations,
                converged = outcome.converged,
                "Weighted group"
            );
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn merge_import(
        &self,
        computed: BTreeMap<RespondentId, f64>,
        import: WeightImport,
    ) -> Result<(BTreeMap<RespondentId, f64>, Option<ImportReport>), WeightingError> {
        let merger = ImportedWeightMerger::new(self.config.import.import_settings());
        let merged = match import.source {
            ImportSource::Rows(rows) => Ok(merger.merge(&computed, &rows)),
            ImportSource::Workbook(workbook) => merger
                .read_workbook(&workbook)
                .map(|parsed| merger.merge_parsed(&computed, parsed)),
        };

        match merged {
            Ok(merged) => {
                counter!("weighting_import_rows_ignored_total").increment(merged.statistics.ignored_rows as u64);
                info!(
                    matched = merged.statistics.matched_responses,
                    ignored = merged.statistics.ignored_rows,
                    "Merged imported weights"
                );
                Ok((merged.weights, Some(ImportReport::Merged(merged.statistics))))
            }
            Err(err) if import.required => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "Optional weight import failed, keeping computed weights");
                Ok((
                    computed,
                    Some(ImportReport::Failed {
                        reason: err.to_string(),
                    }),
                ))
            }
        }
    }
}
