//! Response weighting context entity model
//!
//! A context scopes one persisted set of respondent weights by product,
//! subproduct, context name, subset and optional weighting target.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use crate::weighting::scheme::ResponseWeightingContextKey;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "response_weighting_contexts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub product_short_code: String,

    pub sub_product_id: Option<String>,

    /// Name of the weighting context within the subset
    pub context: String,

    pub subset_id: String,

    pub weighting_target_id: Option<i32>,

    pub created_at: DateTimeWithTimeZone,

    /// Touched whenever the context's weights are replaced
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::response_weight::Entity")]
    ResponseWeights,
}

impl Related<super::response_weight::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ResponseWeights.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn key(&self) -> ResponseWeightingContextKey {
        ResponseWeightingContextKey {
            product_short_code: self.product_short_code.clone(),
            sub_product_id: self.sub_product_id.clone(),
            context: self.context.clone(),
            subset_id: self.subset_id.clone(),
            weighting_target_id: self.weighting_target_id,
        }
    }
}
