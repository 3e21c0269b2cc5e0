//! Response weight repository for database operations
//!
//! Weights of one weighting context are always replaced as a set inside a
//! single transaction, so readers never observe a half-written run.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    NotSet, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;

use super::WeightStore;
use crate::error::RepositoryError;
use crate::models::response_weight::{self, Entity as ResponseWeightConfiguration};
use crate::models::response_weighting_context::{self, Entity as ResponseWeightingContext};
use crate::telemetry::current_run_id;
use crate::weighting::scheme::{ResponseWeight, ResponseWeightingContextKey};

/// Rows per `INSERT` statement, keeping bound parameters under backend limits.
const INSERT_CHUNK_SIZE: usize = 1000;

/// Repository for persisted respondent weights
#[derive(Debug, Clone)]
pub struct ResponseWeightRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

fn key_condition(key: &ResponseWeightingContextKey) -> Condition {
    use response_weighting_context::Column;

    let mut condition = Condition::all()
        .add(Column::ProductShortCode.eq(key.product_short_code.as_str()))
        .add(Column::Context.eq(key.context.as_str()))
        .add(Column::SubsetId.eq(key.subset_id.as_str()));

    condition = match &key.sub_product_id {
        Some(sub_product) => condition.add(Column::SubProductId.eq(sub_product.as_str())),
        None => condition.add(Column::SubProductId.is_null()),
    };
    match key.weighting_target_id {
        Some(target) => condition.add(Column::WeightingTargetId.eq(target)),
        None => condition.add(Column::WeightingTargetId.is_null()),
    }
}

async fn find_context<C: ConnectionTrait>(
    conn: &C,
    key: &ResponseWeightingContextKey,
) -> Result<Option<response_weighting_context::Model>, sea_orm::DbErr> {
    ResponseWeightingContext::find()
        .filter(key_condition(key))
        .one(conn)
        .await
}

impl ResponseWeightRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Finds the context row for `key`, if weights were ever stored for it
    pub async fn find_context(
        &self,
        key: &ResponseWeightingContextKey,
    ) -> Result<Option<response_weighting_context::Model>, RepositoryError> {
        Ok(find_context(&*self.db, key).await?)
    }

    /// Loads the stored weights of `key`, ordered by respondent id
    pub async fn load_weights(
        &self,
        key: &ResponseWeightingContextKey,
    ) -> Result<Vec<ResponseWeight>, RepositoryError> {
        let Some(context) = self.find_context(key).await? else {
            return Ok(Vec::new());
        };

        let rows = ResponseWeightConfiguration::find()
            .filter(response_weight::Column::ResponseWeightingContextId.eq(context.id))
            .order_by_asc(response_weight::Column::RespondentId)
            .all(&*self.db)
            .await?;

        Ok(rows.into_iter().map(ResponseWeight::from).collect())
    }

    /// Replaces all weights of `key` in one transaction, creating the context on first use
    pub async fn replace_weights(
        &self,
        key: &ResponseWeightingContextKey,
        weights: &[ResponseWeight],
    ) -> Result<usize, RepositoryError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        let context_id = match find_context(&txn, key).await? {
            Some(existing) => {
                let id = existing.id;
                let mut active: response_weighting_context::ActiveModel = existing.into();
                active.updated_at = Set(now.into());
                active.update(&txn).await?;
                id
            }
            None => {
                let created = response_weighting_context::ActiveModel {
                    id: NotSet,
                    product_short_code: Set(key.product_short_code.clone()),
                    sub_product_id: Set(key.sub_product_id.clone()),
                    context: Set(key.context.clone()),
                    subset_id: Set(key.subset_id.clone()),
                    weighting_target_id: Set(key.weighting_target_id),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                }
                .insert(&txn)
                .await?;
                created.id
            }
        };

        let removed = ResponseWeightConfiguration::delete_many()
            .filter(response_weight::Column::ResponseWeightingContextId.eq(context_id))
            .exec(&txn)
            .await?;

        for chunk in weights.chunks(INSERT_CHUNK_SIZE) {
            let rows = chunk.iter().map(|w| response_weight::ActiveModel {
                id: NotSet,
                response_weighting_context_id: Set(context_id),
                respondent_id: Set(w.respondent_id),
                weight: Set(w.weight),
            });
            ResponseWeightConfiguration::insert_many(rows)
                .exec_without_returning(&txn)
                .await?;
        }

        txn.commit().await?;

        tracing::info!(
            context = %key,
            run_id = ?current_run_id(),
            removed = removed.rows_affected,
            written = weights.len(),
            "Replaced response weights"
        );
        Ok(weights.len())
    }

    /// Deletes the context of `key` and, by cascade, its weights
    pub async fn delete_context(&self, key: &ResponseWeightingContextKey) -> Result<bool, RepositoryError> {
        let txn = self.db.begin().await?;
        let Some(context) = find_context(&txn, key).await? else {
            txn.rollback().await?;
            return Ok(false);
        };

        ResponseWeightConfiguration::delete_many()
            .filter(response_weight::Column::ResponseWeightingContextId.eq(context.id))
            .exec(&txn)
            .await?;
        let result = ResponseWeightingContext::delete_by_id(context.id)
            .exec(&txn)
            .await?;
        txn.commit().await?;

        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl WeightStore for ResponseWeightRepository {
    async fn replace_weights(
        &self,
        key: &ResponseWeightingContextKey,
        weights: &[ResponseWeight],
    ) -> Result<usize, RepositoryError> {
        ResponseWeightRepository::replace_weights(self, key, weights).await
    }
}
