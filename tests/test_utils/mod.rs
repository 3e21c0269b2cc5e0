//! Test utilities for weight store and run fixtures.
//!
//! Provides in-memory SQLite databases with migrations applied, plus small
//! respondent and strategy builders shared by the integration tests.

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use rim_weighting::weighting::WeightingRunRequest;
use rim_weighting::weighting::scheme::{
    Dimension, Respondent, ResponseWeightingContextKey, SchemeDefinition, WeightingScheme,
    WeightingSchemeDetails, WeightingStrategy,
};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::sync::Arc;

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool is pinned to a single connection so every query sees the same
/// in-memory database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Sets up an in-memory SQLite database with all migrations applied and returns an Arc.
#[allow(dead_code)]
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    let db = setup_test_db().await?;
    Ok(Arc::new(db))
}

/// Context key for the `retail` product in the `UK` subset.
#[allow(dead_code)]
pub fn context_key(sub_product: Option<&str>) -> ResponseWeightingContextKey {
    ResponseWeightingContextKey {
        product_short_code: "retail".to_string(),
        sub_product_id: sub_product.map(str::to_string),
        context: "brand-tracker".to_string(),
        subset_id: "UK".to_string(),
        weighting_target_id: None,
    }
}

/// 60 men then 40 women; gender 1 is male, 2 is female.
#[allow(dead_code)]
pub fn gendered_respondents(count: i32) -> Vec<Respondent> {
    (1..=count)
        .map(|id| {
            let gender = if id * 10 <= count * 6 { 1 } else { 2 };
            Respondent::new(id).with_answer("gender", gender)
        })
        .collect()
}

/// Single rim scheme balancing gender 50/50.
#[allow(dead_code)]
pub fn gender_strategy() -> WeightingStrategy {
    WeightingStrategy {
        product_short_code: "retail".to_string(),
        sub_product_id: None,
        subset_id: Some("UK".to_string()),
        filter_metric: None,
        schemes: vec![WeightingScheme {
            filter_metric_entity_id: None,
            definition: SchemeDefinition::Rim(WeightingSchemeDetails {
                dimensions: vec![Dimension::single("gender", [(1, Some(0.5)), (2, Some(0.5))])],
            }),
        }],
    }
}

#[allow(dead_code)]
pub fn gender_request(count: i32) -> WeightingRunRequest {
    WeightingRunRequest {
        context: context_key(None),
        strategy: gender_strategy(),
        respondents: gendered_respondents(count),
    }
}
