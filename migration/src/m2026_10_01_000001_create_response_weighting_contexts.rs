//! Migration to create the response_weighting_contexts table.
//!
//! A context scopes one persisted set of respondent weights.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ResponseWeightingContexts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::ProductShortCode)
                            .string_len(20)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::SubProductId)
                            .string_len(50)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::Context)
                            .string_len(256)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::SubsetId)
                            .string_len(50)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::WeightingTargetId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightingContexts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_response_weighting_contexts_key")
                    .table(ResponseWeightingContexts::Table)
                    .col(ResponseWeightingContexts::ProductShortCode)
                    .col(ResponseWeightingContexts::SubProductId)
                    .col(ResponseWeightingContexts::Context)
                    .col(ResponseWeightingContexts::SubsetId)
                    .col(ResponseWeightingContexts::WeightingTargetId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_response_weighting_contexts_key")
                    .table(ResponseWeightingContexts::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(ResponseWeightingContexts::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum ResponseWeightingContexts {
    Table,
    Id,
    ProductShortCode,
    SubProductId,
    Context,
    SubsetId,
    WeightingTargetId,
    CreatedAt,
    UpdatedAt,
}
