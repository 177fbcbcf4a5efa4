use super::detector::Detector;
use super::notifier::NotificationDispatcher;
use super::reader::{GstSourceOpener, SourceOpener};
use super::session::{run_loop, SessionConfig, SessionHandle};
use crate::config::Config;
use crate::db::models::Camera;
use crate::db::repositories::CamerasRepository;
use crate::error::Error;
use crate::resolver::SourceResolver;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Encoded frames buffered per subscriber before a slow consumer lags
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Camera lookup used at session start.
#[async_trait]
pub trait CameraDirectory: Send + Sync {
    async fn get(&self, camera_id: Uuid) -> Result<Option<Camera>>;
}

#[async_trait]
impl CameraDirectory for CamerasRepository {
    async fn get(&self, camera_id: Uuid) -> Result<Option<Camera>> {
        self.get_by_id(&camera_id).await
    }
}

/// Live session registry. At most one entry per camera; an entry whose
/// token is cancelled counts as dead and is replaced on the next subscribe.
#[derive(Default)]
pub struct SessionMap {
    inner: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl SessionMap {
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        self.inner.lock().await
    }

    /// Drop the entry for a camera if its session has finished. A live
    /// replacement registered in the meantime is left untouched.
    pub async fn remove_finished(&self, camera_id: Uuid) {
        let mut sessions = self.inner.lock().await;
        if sessions
            .get(&camera_id)
            .map_or(false, SessionHandle::is_cancelled)
        {
            sessions.remove(&camera_id);
        }
    }

    /// Cancel the session for a camera. Returns whether one was live.
    pub async fn cancel(&self, camera_id: Uuid) -> bool {
        let sessions = self.inner.lock().await;
        match sessions.get(&camera_id) {
            Some(handle) if !handle.is_cancelled() => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn cancel_all(&self) {
        let sessions = self.inner.lock().await;
        for handle in sessions.values() {
            handle.cancel.cancel();
        }
    }

    /// Cameras with a live (non-cancelled) session.
    pub async fn active(&self) -> Vec<Uuid> {
        let sessions = self.inner.lock().await;
        sessions
            .iter()
            .filter(|(_, handle)| !handle.is_cancelled())
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Owns every camera session. Subscribing to a camera reuses the live
/// session when one exists and starts one otherwise; a camera never has two
/// concurrent readers on its source.
pub struct StreamSupervisor {
    sessions: Arc<SessionMap>,
    cameras: Arc<dyn CameraDirectory>,
    resolver: Arc<SourceResolver>,
    detector: Arc<dyn Detector>,
    dispatcher: Arc<NotificationDispatcher>,
    opener: Arc<dyn SourceOpener>,
    session_config: SessionConfig,
}

impl StreamSupervisor {
    pub fn new(
        config: &Config,
        cameras: CamerasRepository,
        resolver: Arc<SourceResolver>,
        detector: Arc<dyn Detector>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        let session_config = SessionConfig {
            stride: config.detection.stride.max(1),
            monitored: config.detection.monitored_species.iter().cloned().collect(),
            confidence_threshold: config.detection.confidence_threshold,
            jpeg_quality: config.stream.jpeg_quality,
            frame_interval: Duration::from_millis(1000 / u64::from(config.stream.frame_rate.max(1))),
            poll_interval: Duration::from_millis(20),
            idle_grace: Duration::from_secs(config.stream.idle_grace_secs),
            cooldown: Duration::from_secs(config.notifications.cooldown_secs),
        };

        Self {
            sessions: Arc::new(SessionMap::default()),
            cameras: Arc::new(cameras),
            resolver,
            detector,
            dispatcher,
            opener: Arc::new(GstSourceOpener {
                frame_rate: config.stream.frame_rate,
                open_timeout: Duration::from_secs(config.stream.open_timeout_secs),
                stall_backoff: Duration::from_secs(config.stream.stall_backoff_secs),
            }),
            session_config,
        }
    }

    /// Attach a subscriber to the camera's frame stream, starting a session
    /// if none is live. A placeholder handle claims the camera under the
    /// registry lock before the slow resolve/open work, so concurrent
    /// subscribes share one source without the lock spanning the open —
    /// other cameras keep starting and `active` stays responsive.
    pub async fn subscribe(&self, camera_id: Uuid) -> Result<broadcast::Receiver<Bytes>> {
        let (handle, frames_rx) = {
            let mut sessions = self.sessions.lock().await;

            if let Some(existing) = sessions.get(&camera_id) {
                if !existing.is_cancelled() {
                    return Ok(existing.subscribe());
                }
                sessions.remove(&camera_id);
            }

            let (frames_tx, frames_rx) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
            let handle = SessionHandle {
                camera_id,
                frames: frames_tx,
                cancel: CancellationToken::new(),
            };
            sessions.insert(camera_id, handle.clone());
            (handle, frames_rx)
        };

        match self.start_session(&handle).await {
            Ok(()) => Ok(frames_rx),
            Err(e) => {
                // Release the claim; late co-subscribers see their stream end
                handle.cancel.cancel();
                self.sessions.remove_finished(camera_id).await;
                Err(e)
            }
        }
    }

    async fn start_session(&self, handle: &SessionHandle) -> Result<()> {
        let camera_id = handle.camera_id;
        let camera = self
            .cameras
            .get(camera_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Camera not found: {}", camera_id)))?;

        let resolved = self.resolver.resolve(&camera.url).await?;

        let opener = Arc::clone(&self.opener);
        let source = tokio::task::spawn_blocking(move || opener.open(&resolved))
            .await
            .map_err(|e| Error::Internal(format!("Source open task failed: {}", e)))??;

        info!("Starting session for camera {} ({})", camera_id, camera.name);

        let detector = Arc::clone(&self.detector);
        let dispatcher = Arc::clone(&self.dispatcher);
        let session_config = self.session_config.clone();
        let registry = Arc::clone(&self.sessions);
        let frames_tx = handle.frames.clone();
        let cancel = handle.cancel.clone();
        tokio::spawn(async move {
            run_loop(
                camera_id,
                source,
                detector,
                dispatcher,
                session_config,
                frames_tx,
                cancel.clone(),
            )
            .await;
            // Mark finished before unregistering so a racing subscribe never
            // hands out a receiver on a dead session
            cancel.cancel();
            registry.remove_finished(camera_id).await;
        });

        Ok(())
    }

    /// Stop the session for a camera, if any. Used when a camera's source
    /// URL changes or an operator forces a restream restart.
    pub async fn invalidate(&self, camera_id: Uuid) -> bool {
        let cancelled = self.sessions.cancel(camera_id).await;
        if cancelled {
            info!("Session invalidated for camera {}", camera_id);
        } else {
            warn!("No live session to invalidate for camera {}", camera_id);
        }
        cancelled
    }

    pub async fn active_cameras(&self) -> Vec<Uuid> {
        self.sessions.active().await
    }

    pub async fn shutdown(&self) {
        info!("Cancelling all camera sessions");
        self.sessions.cancel_all().await;
    }
}
