//! Response weight configuration entity model
//!
//! One row per respondent per weighting context: the final weight written by
//! a weighting run.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

use super::response_weighting_context::Entity as ResponseWeightingContext;
use crate::weighting::scheme::ResponseWeight;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "response_weight_configurations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub response_weighting_context_id: i32,

    pub respondent_id: i32,

    #[sea_orm(column_type = "Double")]
    pub weight: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "ResponseWeightingContext",
        from = "Column::ResponseWeightingContextId",
        to = "super::response_weighting_context::Column::Id",
        on_delete = "Cascade"
    )]
    ResponseWeightingContext,
}

impl Related<ResponseWeightingContext> for Entity {
    fn to() -> RelationDef {
        Relation::ResponseWeightingContext.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for ResponseWeight {
    fn from(model: Model) -> Self {
        ResponseWeight {
            respondent_id: model.respondent_id,
            weight: model.weight,
        }
    }
}
