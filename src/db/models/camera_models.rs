use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Camera model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Camera {
    pub id: Uuid,
    pub name: String,
    /// Configured source: direct media URI, local file, device path, or an
    /// indirect platform URL that needs resolution before opening
    pub url: String,
    pub location: Option<String>,
    pub direction: Option<String>,
    pub farm_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Camera {
    pub fn new(name: &str, url: &str, farm_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            url: url.to_string(),
            location: None,
            direction: None,
            farm_id,
            created_at: now,
            updated_at: now,
        }
    }
}
