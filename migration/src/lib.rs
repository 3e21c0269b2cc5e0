//! Database migrations for the weight store.

pub use sea_orm_migration::prelude::*;

mod m2026_10_01_000001_create_response_weighting_contexts;
mod m2026_10_01_000002_create_response_weight_configurations;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_10_01_000001_create_response_weighting_contexts::Migration),
            Box::new(m2026_10_01_000002_create_response_weight_configurations::Migration),
        ]
    }
}
