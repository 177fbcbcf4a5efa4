use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted notification record. Created once per throttle-eligible
/// detection burst; never updated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub camera_id: Uuid,
    pub image_url: Option<String>,
}

impl Notification {
    pub fn new(camera_id: Uuid, message: &str, timestamp: DateTime<Utc>, image_url: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.to_string(),
            timestamp,
            camera_id,
            image_url,
        }
    }
}
