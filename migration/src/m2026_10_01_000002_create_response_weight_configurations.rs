//! Migration to create the response_weight_configurations table.
//!
//! Stores the final weight of every respondent of a weighting context.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ResponseWeightConfigurations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ResponseWeightConfigurations::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightConfigurations::ResponseWeightingContextId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightConfigurations::RespondentId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResponseWeightConfigurations::Weight)
                            .double()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_response_weight_configurations_context")
                            .from(
                                ResponseWeightConfigurations::Table,
                                ResponseWeightConfigurations::ResponseWeightingContextId,
                            )
                            .to(
                                ResponseWeightingContexts::Table,
                                ResponseWeightingContexts::Id,
                            )
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One weight per respondent per context
        manager
            .create_index(
                Index::create()
                    .name("idx_response_weight_configurations_context_respondent")
                    .table(ResponseWeightConfigurations::Table)
                    .col(ResponseWeightConfigurations::ResponseWeightingContextId)
                    .col(ResponseWeightConfigurations::RespondentId)
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
                    .name("idx_response_weight_configurations_context_respondent")
                    .table(ResponseWeightConfigurations::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(ResponseWeightConfigurations::Table)
                    .to_owned(),
            )
            .await
    }
}

#[derive(DeriveIden)]
enum ResponseWeightConfigurations {
    Table,
    Id,
    ResponseWeightingContextId,
    RespondentId,
    Weight,
}

#[derive(DeriveIden)]
enum ResponseWeightingContexts {
    Table,
    Id,
}
