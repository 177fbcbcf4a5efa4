use crate::{db::models::Farm, error::Error};
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Farms repository for handling farm operations
#[derive(Clone)]
pub struct FarmsRepository {
    pool: Arc<PgPool>,
}

impl FarmsRepository {
    /// Create a new farms repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Get farm by ID
    pub async fn get_by_id(&self, id: &Uuid) -> Result<Option<Farm>> {
        let result = sqlx::query_as::<_, Farm>(
            r#"
            SELECT id, name, user_id, image_url, created_at
            FROM farms
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get farm by ID: {}", e)))?;

        Ok(result)
    }

    /// Get all farms owned by a user
    pub async fn get_by_user(&self, user_id: &Uuid) -> Result<Vec<Farm>> {
        let result = sqlx::query_as::<_, Farm>(
            r#"
            SELECT id, name, user_id, image_url, created_at
            FROM farms
            WHERE user_id = $1
            ORDER BY name
            "#,
        )
        .bind(user_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get farms for user: {}", e)))?;

        Ok(result)
    }
}
