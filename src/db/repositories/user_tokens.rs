use crate::{db::models::UserToken, error::Error};
use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Repository for push notification tokens. One token per user; a new
/// registration replaces the previous one.
#[derive(Clone)]
pub struct UserTokensRepository {
    pool: Arc<PgPool>,
}

impl UserTokensRepository {
    /// Create a new user tokens repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Register or replace the push token for a user (latest write wins)
    pub async fn upsert(&self, user_id: &Uuid, token: &str) -> Result<UserToken> {
        let result = sqlx::query_as::<_, UserToken>(
            r#"
            INSERT INTO user_tokens (user_id, token, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET token = $2, updated_at = $3
            RETURNING user_id, token, updated_at
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(Utc::now())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert user token: {}", e)))?;

        Ok(result)
    }

    /// Get the push tokens registered for a user. The schema keeps at most
    /// one, but the contract returns a list for forward compatibility.
    pub async fn get_by_user(&self, user_id: &Uuid) -> Result<Vec<String>> {
        let result = sqlx::query_scalar::<_, String>(
            r#"
            SELECT token
            FROM user_tokens
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get tokens for user: {}", e)))?;

        Ok(result)
    }

    /// Remove a user's token
    pub async fn delete(&self, user_id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete user token: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}
