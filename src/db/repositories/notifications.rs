use crate::{db::models::Notification, error::Error};
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Notifications repository for handling notification records
#[derive(Clone)]
pub struct NotificationsRepository {
    pool: Arc<PgPool>,
}

impl NotificationsRepository {
    /// Create a new notifications repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create a new notification record
    pub async fn create(&self, notification: &Notification) -> Result<Notification> {
        let result = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, message, timestamp, camera_id, image_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, message, timestamp, camera_id, image_url
            "#,
        )
        .bind(notification.id)
        .bind(&notification.message)
        .bind(notification.timestamp)
        .bind(notification.camera_id)
        .bind(&notification.image_url)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create notification: {}", e)))?;

        Ok(result)
    }

    /// Get notifications for a camera, newest first
    pub async fn get_by_camera(&self, camera_id: &Uuid, limit: Option<i64>) -> Result<Vec<Notification>> {
        let limit = limit.unwrap_or(100);

        let result = sqlx::query_as::<_, Notification>(
            r#"
            SELECT id, message, timestamp, camera_id, image_url
            FROM notifications
            WHERE camera_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(camera_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get notifications for camera: {}", e)))?;

        Ok(result)
    }

    /// Get notifications for every camera the user owns, joined through
    /// camera -> farm ownership, newest first
    pub async fn get_by_user(&self, user_id: &Uuid, limit: Option<i64>) -> Result<Vec<Notification>> {
        let limit = limit.unwrap_or(100);

        let result = sqlx::query_as::<_, Notification>(
            r#"
            SELECT n.id, n.message, n.timestamp, n.camera_id, n.image_url
            FROM notifications n
            JOIN cameras c ON n.camera_id = c.id
            JOIN farms f ON c.farm_id = f.id
            WHERE f.user_id = $1
            ORDER BY n.timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get notifications for user: {}", e)))?;

        Ok(result)
    }
}
