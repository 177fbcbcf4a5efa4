use crate::db::repositories::{CamerasRepository, FarmsRepository, NotificationsRepository, UserTokensRepository};
use crate::db::models::Notification;
use crate::error::Error;
use crate::push::{PushData, PushMessage, PushSender};
use crate::snapshot::SnapshotStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const UNKNOWN: &str = "unknown";

/// Per-camera cooldown window. Owned by the camera's session so independent
/// cameras never share throttle state.
pub struct CooldownGate {
    cooldown: Duration,
    last_notified_at: Option<Instant>,
}

impl CooldownGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_notified_at: None,
        }
    }

    /// True when enough time has passed since the last armed notification.
    pub fn is_open(&self, now: Instant) -> bool {
        match self.last_notified_at {
            None => true,
            Some(last) => now.duration_since(last) >= self.cooldown,
        }
    }

    /// Record a dispatched notification. The stored timestamp never moves
    /// backwards.
    pub fn arm(&mut self, now: Instant) {
        match self.last_notified_at {
            Some(last) if last > now => (),
            _ => self.last_notified_at = Some(now),
        }
    }
}

/// Farm and camera display names attached to a push payload.
#[derive(Debug, Clone, Default)]
pub struct NotificationContext {
    pub farm_name: Option<String>,
    pub camera_name: Option<String>,
}

/// Resolves who should receive notifications for a camera
/// (camera -> farm -> owning user -> registered tokens).
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    async fn tokens_for_camera(&self, camera_id: Uuid) -> Result<Vec<String>>;
    async fn context_for_camera(&self, camera_id: Uuid) -> Result<NotificationContext>;
}

/// Persistence collaborator for notification records.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn create(
        &self,
        camera_id: Uuid,
        message: &str,
        timestamp: DateTime<Utc>,
        image_url: Option<&str>,
    ) -> Result<()>;
}

/// Database-backed recipient resolution.
pub struct DbRecipientResolver {
    cameras: CamerasRepository,
    farms: FarmsRepository,
    tokens: UserTokensRepository,
}

impl DbRecipientResolver {
    pub fn new(
        cameras: CamerasRepository,
        farms: FarmsRepository,
        tokens: UserTokensRepository,
    ) -> Self {
        Self {
            cameras,
            farms,
            tokens,
        }
    }
}

#[async_trait]
impl RecipientResolver for DbRecipientResolver {
    async fn tokens_for_camera(&self, camera_id: Uuid) -> Result<Vec<String>> {
        let Some(camera) = self.cameras.get_by_id(&camera_id).await? else {
            warn!("Camera not found: {}", camera_id);
            return Ok(Vec::new());
        };
        let Some(farm) = self.farms.get_by_id(&camera.farm_id).await? else {
            warn!("Farm not found: {}", camera.farm_id);
            return Ok(Vec::new());
        };
        self.tokens.get_by_user(&farm.user_id).await
    }

    async fn context_for_camera(&self, camera_id: Uuid) -> Result<NotificationContext> {
        let Some(camera) = self.cameras.get_by_id(&camera_id).await? else {
            return Ok(NotificationContext::default());
        };
        let farm = self.farms.get_by_id(&camera.farm_id).await?;
        Ok(NotificationContext {
            farm_name: farm.map(|f| f.name),
            camera_name: Some(camera.name),
        })
    }
}

/// Database-backed notification record persistence.
pub struct DbNotificationSink {
    notifications: NotificationsRepository,
}

impl DbNotificationSink {
    pub fn new(notifications: NotificationsRepository) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl NotificationSink for DbNotificationSink {
    async fn create(
        &self,
        camera_id: Uuid,
        message: &str,
        timestamp: DateTime<Utc>,
        image_url: Option<&str>,
    ) -> Result<()> {
        let record = Notification::new(camera_id, message, timestamp, image_url.map(String::from));
        self.notifications.create(&record).await?;
        Ok(())
    }
}

/// Builds and delivers one notification per throttle-eligible detection
/// burst: snapshot, push payloads per recipient token, persisted record.
pub struct NotificationDispatcher {
    snapshots: SnapshotStore,
    recipients: Arc<dyn RecipientResolver>,
    sink: Arc<dyn NotificationSink>,
    push: Arc<dyn PushSender>,
    title: String,
    display_names: HashMap<String, String>,
    push_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        snapshots: SnapshotStore,
        recipients: Arc<dyn RecipientResolver>,
        sink: Arc<dyn NotificationSink>,
        push: Arc<dyn PushSender>,
        title: String,
        display_names: HashMap<String, String>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            snapshots,
            recipients,
            sink,
            push,
            title,
            display_names,
            push_timeout,
        }
    }

    /// Deliver one notification burst. Push sends are fire-and-forget with
    /// their own timeout; only record persistence failures propagate, so the
    /// caller re-arms its cooldown gate exactly when a record exists.
    pub async fn dispatch(
        &self,
        camera_id: Uuid,
        labels: &[String],
        annotated_jpeg: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let animals = self.distinct_display_labels(labels);
        let body = animals.join(", ");

        // Snapshot first; a failed write degrades to a notification without
        // an image instead of suppressing the whole burst
        let image_url = match self.snapshots.write(camera_id, now, annotated_jpeg).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Snapshot persistence failed for camera {}: {}", camera_id, e);
                None
            }
        };

        let context = self
            .recipients
            .context_for_camera(camera_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Recipient context lookup failed for camera {}: {}", camera_id, e);
                NotificationContext::default()
            });

        let tokens = match self.recipients.tokens_for_camera(camera_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Token resolution failed for camera {}: {}", camera_id, e);
                Vec::new()
            }
        };
        if tokens.is_empty() {
            debug!("No push tokens registered for camera {}", camera_id);
        }

        for token in tokens {
            let message = PushMessage {
                to: token,
                sound: "default".to_string(),
                title: self.title.clone(),
                body: body.clone(),
                data: PushData {
                    image_url: image_url.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    farmland: context.farm_name.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    camera: context.camera_name.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    animal: if body.is_empty() { UNKNOWN.to_string() } else { body.clone() },
                },
            };
            let push = Arc::clone(&self.push);
            let timeout = self.push_timeout;
            // A hung push backend must never stall the frame loop
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, push.send(&message)).await {
                    Ok(Ok(())) => debug!("Push dispatched to {}", message.to),
                    Ok(Err(e)) => {
                        error!("{}", Error::Dispatch(format!("Push to {} failed: {}", message.to, e)))
                    }
                    Err(_) => error!(
                        "{}",
                        Error::Dispatch(format!("Push to {} timed out after {:?}", message.to, timeout))
                    ),
                }
            });
        }

        let message = format!("{}: {}", self.title, body);
        self.sink
            .create(camera_id, &message, now, image_url.as_deref())
            .await?;

        info!("Notification recorded for camera {} ({})", camera_id, body);
        Ok(())
    }

    /// Distinct detected labels, mapped through the display-name table,
    /// order-insensitive.
    fn distinct_display_labels(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .map(|label| {
                self.display_names
                    .get(label)
                    .cloned()
                    .unwrap_or_else(|| label.clone())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotConfig;
    use std::sync::Mutex;

    struct FakeRecipients {
        tokens: Vec<String>,
    }

    #[async_trait]
    impl RecipientResolver for FakeRecipients {
        async fn tokens_for_camera(&self, _camera_id: Uuid) -> Result<Vec<String>> {
            Ok(self.tokens.clone())
        }

        async fn context_for_camera(&self, _camera_id: Uuid) -> Result<NotificationContext> {
            Ok(NotificationContext {
                farm_name: Some("East pasture".to_string()),
                camera_name: Some("Gate cam".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        created: Mutex<Vec<(Uuid, String, Option<String>)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn create(
            &self,
            camera_id: Uuid,
            message: &str,
            _timestamp: DateTime<Utc>,
            image_url: Option<&str>,
        ) -> Result<()> {
            self.created.lock().unwrap().push((
                camera_id,
                message.to_string(),
                image_url.map(String::from),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPush {
        sent: Mutex<Vec<PushMessage>>,
    }

    #[async_trait]
    impl PushSender for RecordingPush {
        async fn send(&self, message: &PushMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct HangingPush;

    #[async_trait]
    impl PushSender for HangingPush {
        async fn send(&self, _message: &PushMessage) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn dispatcher(
        dir: &std::path::Path,
        recipients: Arc<dyn RecipientResolver>,
        sink: Arc<dyn NotificationSink>,
        push: Arc<dyn PushSender>,
    ) -> NotificationDispatcher {
        let snapshots = SnapshotStore::new(&SnapshotConfig {
            storage_path: dir.to_path_buf(),
            public_base_url: "http://localhost/snapshots".to_string(),
        })
        .unwrap();
        NotificationDispatcher::new(
            snapshots,
            recipients,
            sink,
            push,
            "Animal detected".to_string(),
            HashMap::new(),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn gate_suppresses_within_cooldown() {
        let mut gate = CooldownGate::new(Duration::from_secs(120));
        let t0 = Instant::now();

        assert!(gate.is_open(t0));
        gate.arm(t0);
        // t=60: inside the window
        assert!(!gate.is_open(t0 + Duration::from_secs(60)));
        // t=130: window has elapsed
        assert!(gate.is_open(t0 + Duration::from_secs(130)));
    }

    #[test]
    fn gate_timestamp_is_monotonic() {
        let mut gate = CooldownGate::new(Duration::from_secs(10));
        let t0 = Instant::now();
        gate.arm(t0 + Duration::from_secs(5));
        gate.arm(t0);
        assert!(!gate.is_open(t0 + Duration::from_secs(14)));
        assert!(gate.is_open(t0 + Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn dispatch_sends_to_every_token_and_records_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let push = Arc::new(RecordingPush::default());
        let d = dispatcher(
            dir.path(),
            Arc::new(FakeRecipients {
                tokens: vec!["token-a".to_string(), "token-b".to_string()],
            }),
            sink.clone(),
            push.clone(),
        );

        let camera_id = Uuid::new_v4();
        let labels = vec!["cow".to_string(), "cow".to_string(), "sheep".to_string()];
        d.dispatch(camera_id, &labels, b"\xff\xd8jpeg\xff\xd9", Utc::now())
            .await
            .unwrap();

        // Push sends are spawned; give them a moment to land
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = push.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        // Burst labels are deduplicated and order-insensitive
        assert_eq!(sent[0].body, "cow, sheep");
        assert_eq!(sent[0].data.animal, "cow, sheep");
        assert_eq!(sent[0].data.farmland, "East pasture");
        assert_eq!(sent[0].data.camera, "Gate cam");
        assert!(sent[0].data.image_url.ends_with(".jpg"));

        let created = sink.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, camera_id);
        assert!(created[0].1.contains("cow, sheep"));
        assert!(created[0].2.is_some());
    }

    #[tokio::test]
    async fn display_names_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let push = Arc::new(RecordingPush::default());
        let mut d = dispatcher(
            dir.path(),
            Arc::new(FakeRecipients {
                tokens: vec!["token-a".to_string()],
            }),
            sink,
            push.clone(),
        );
        d.display_names = [("cow".to_string(), "үхэр".to_string())].into_iter().collect();

        d.dispatch(
            Uuid::new_v4(),
            &["cow".to_string()],
            b"\xff\xd8jpeg\xff\xd9",
            Utc::now(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(push.sent.lock().unwrap()[0].body, "үхэр");
    }

    #[tokio::test]
    async fn hung_push_backend_does_not_block_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(
            dir.path(),
            Arc::new(FakeRecipients {
                tokens: vec!["token-a".to_string()],
            }),
            sink.clone(),
            Arc::new(HangingPush),
        );

        let started = Instant::now();
        d.dispatch(
            Uuid::new_v4(),
            &["horse".to_string()],
            b"\xff\xd8jpeg\xff\xd9",
            Utc::now(),
        )
        .await
        .unwrap();

        // The record exists and dispatch returned without waiting out the hang
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sink.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_tokens_still_creates_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let push = Arc::new(RecordingPush::default());
        let d = dispatcher(
            dir.path(),
            Arc::new(FakeRecipients { tokens: vec![] }),
            sink.clone(),
            push.clone(),
        );

        d.dispatch(
            Uuid::new_v4(),
            &["bird".to_string()],
            b"\xff\xd8jpeg\xff\xd9",
            Utc::now(),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(push.sent.lock().unwrap().is_empty());
        assert_eq!(sink.created.lock().unwrap().len(), 1);
    }
}
