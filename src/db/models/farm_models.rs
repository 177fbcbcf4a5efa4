use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Farm model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Farm {
    pub id: Uuid,
    pub name: String,
    pub user_id: Uuid,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}
