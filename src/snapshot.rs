use crate::config::SnapshotConfig;
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use uuid::Uuid;

/// Filesystem-backed snapshot store. File names are unique per
/// (camera, notification time), and the directory is served statically so
/// each write maps to a public URL.
#[derive(Clone)]
pub struct SnapshotStore {
    storage_path: PathBuf,
    public_base_url: String,
}

impl SnapshotStore {
    pub fn new(config: &SnapshotConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.storage_path)
            .map_err(|e| Error::Io(format!("Failed to create snapshot directory: {}", e)))?;

        Ok(Self {
            storage_path: config.storage_path.clone(),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Persist an encoded JPEG and return its public URL.
    pub async fn write(
        &self,
        camera_id: Uuid,
        timestamp: DateTime<Utc>,
        jpeg: &[u8],
    ) -> Result<String> {
        let file_name = Self::file_name(camera_id, timestamp);
        let path = self.storage_path.join(&file_name);

        tokio::fs::write(&path, jpeg)
            .await
            .map_err(|e| Error::Io(format!("Failed to write snapshot {}: {}", path.display(), e)))?;

        Ok(format!("{}/{}", self.public_base_url, file_name))
    }

    fn file_name(camera_id: Uuid, timestamp: DateTime<Utc>) -> String {
        format!(
            "{}_{}.jpg",
            camera_id,
            timestamp.format("%Y%m%dT%H%M%S%.3f")
        )
    }
}
