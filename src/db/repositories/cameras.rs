use crate::{db::models::Camera, error::Error};
use anyhow::Result;
use chrono::Utc;
use log::info;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Cameras repository for handling camera operations
#[derive(Clone)]
pub struct CamerasRepository {
    pool: Arc<PgPool>,
}

impl CamerasRepository {
    /// Create a new cameras repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create a new camera
    pub async fn create(&self, camera: &Camera) -> Result<Camera> {
        info!("Creating new camera: {}", camera.name);

        let result = sqlx::query_as::<_, Camera>(
            r#"
            INSERT INTO cameras (id, name, url, location, direction, farm_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, name, url, location, direction, farm_id, created_at, updated_at
            "#,
        )
        .bind(camera.id)
        .bind(&camera.name)
        .bind(&camera.url)
        .bind(&camera.location)
        .bind(&camera.direction)
        .bind(camera.farm_id)
        .bind(camera.created_at)
        .bind(camera.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create camera: {}", e)))?;

        Ok(result)
    }

    /// Get camera by ID
    pub async fn get_by_id(&self, id: &Uuid) -> Result<Option<Camera>> {
        let result = sqlx::query_as::<_, Camera>(
            r#"
            SELECT id, name, url, location, direction, farm_id, created_at, updated_at
            FROM cameras
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get camera by ID: {}", e)))?;

        Ok(result)
    }

    /// Get all cameras belonging to a farm
    pub async fn get_by_farm(&self, farm_id: &Uuid) -> Result<Vec<Camera>> {
        let result = sqlx::query_as::<_, Camera>(
            r#"
            SELECT id, name, url, location, direction, farm_id, created_at, updated_at
            FROM cameras
            WHERE farm_id = $1
            ORDER BY name
            "#,
        )
        .bind(farm_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get cameras for farm: {}", e)))?;

        Ok(result)
    }

    /// Update a camera's source URL. Any live session for this camera must
    /// be invalidated by the caller afterwards.
    pub async fn update_url(&self, id: &Uuid, url: &str) -> Result<Option<Camera>> {
        let result = sqlx::query_as::<_, Camera>(
            r#"
            UPDATE cameras
            SET url = $2, updated_at = $3
            WHERE id = $1
            RETURNING id, name, url, location, direction, farm_id, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(url)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update camera URL: {}", e)))?;

        Ok(result)
    }

    /// Delete a camera
    pub async fn delete(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cameras WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete camera: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}
