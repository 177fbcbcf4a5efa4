use crate::config::NotificationConfig;
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use std::time::Duration;

/// Payload sent to the push backend for one recipient token.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub sound: String,
    pub title: String,
    pub body: String,
    pub data: PushData,
}

/// Structured data carried alongside the notification. All fields fall
/// back to an "unknown" sentinel instead of being omitted.
#[derive(Debug, Clone, Serialize)]
pub struct PushData {
    pub image_url: String,
    pub farmland: String,
    pub camera: String,
    pub animal: String,
}

/// Push dispatch collaborator. Delivery is best-effort from the pipeline's
/// perspective; implementations must bound their own latency.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<()>;
}

/// Expo-style push backend client (HTTP POST with a request timeout).
pub struct ExpoPushClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ExpoPushClient {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.push_timeout_ms))
            .build()
            .map_err(|e| Error::Dispatch(format!("Failed to build push client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.push_endpoint.clone(),
        })
    }
}

#[async_trait]
impl PushSender for ExpoPushClient {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("Push request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Push backend returned {}: {}", status, body);
            return Err(Error::Dispatch(format!("Push backend returned {}", status)).into());
        }

        debug!("Push notification accepted for token {}", message.to);
        Ok(())
    }
}
