use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User model. Authentication is handled elsewhere; this row is the join
/// target for farm ownership and push-token resolution.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Push notification token. At most one row per user; latest write wins.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserToken {
    pub user_id: Uuid,
    pub token: String,
    pub updated_at: DateTime<Utc>,
}
