use super::annotate::{annotate, encode_jpeg};
use super::detector::{filter_monitored, Detector};
use super::frame::Detection;
use super::notifier::{CooldownGate, NotificationDispatcher};
use super::reader::{FrameSource, ReadPoll};
use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-session pacing and detection settings, derived from the application
/// config at session start.
#[derive(Clone)]
pub struct SessionConfig {
    /// Run the detector on every Nth frame (>= 1)
    pub stride: u64,
    pub monitored: HashSet<String>,
    pub confidence_threshold: f32,
    pub jpeg_quality: u8,
    /// Target delay between emitted frames
    pub frame_interval: Duration,
    /// Delay before re-polling a source that had nothing ready
    pub poll_interval: Duration,
    /// How long a session with zero subscribers keeps running
    pub idle_grace: Duration,
    /// Minimum gap between notifications for this camera
    pub cooldown: Duration,
}

/// Handle to a running camera session. Cloned per subscriber; the loop
/// itself owns the frame source.
#[derive(Clone)]
pub struct SessionHandle {
    pub camera_id: Uuid,
    pub frames: broadcast::Sender<Bytes>,
    pub cancel: CancellationToken,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.frames.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Drive one camera: read, detect on a stride, annotate, encode, notify
/// under cooldown, and fan encoded frames out to subscribers.
///
/// Runs until the source closes, the handle is cancelled, or nobody has
/// been watching for longer than the idle grace period.
pub async fn run_loop(
    camera_id: Uuid,
    mut source: Box<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    dispatcher: Arc<NotificationDispatcher>,
    config: SessionConfig,
    frames_tx: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let stride = config.stride.max(1);
    let mut gate = CooldownGate::new(config.cooldown);
    let mut frame_count: u64 = 0;
    let mut last_detections: Vec<Detection> = Vec::new();
    let mut idle_since: Option<Instant> = None;

    info!("Session started for camera {}", camera_id);

    loop {
        if cancel.is_cancelled() {
            info!("Session cancelled for camera {}", camera_id);
            break;
        }

        // Tear down when nobody has been watching for the grace period
        if frames_tx.receiver_count() == 0 {
            let since = *idle_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= config.idle_grace {
                info!("Session idle past grace period for camera {}", camera_id);
                break;
            }
        } else {
            idle_since = None;
        }

        let poll = match source.poll_frame() {
            Ok(poll) => poll,
            Err(e) => {
                error!("Read failure on camera {}: {}", camera_id, e);
                break;
            }
        };

        let frame = match poll {
            ReadPoll::Closed => {
                info!("Source closed for camera {}", camera_id);
                break;
            }
            ReadPoll::Pending => {
                tokio::select! {
                    _ = cancel.cancelled() => continue,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }
            ReadPoll::Frame(frame) => frame,
        };

        frame_count += 1;
        let mut detector_ran = false;
        if (frame_count - 1) % stride == 0 {
            match detector.detect(&frame) {
                Ok(detections) => {
                    last_detections =
                        filter_monitored(detections, &config.monitored, config.confidence_threshold);
                    detector_ran = true;
                }
                // A failed inference keeps the stream alive; boxes go stale
                Err(e) => warn!("Detector failure on camera {}: {}", camera_id, e),
            }
        }

        let annotated = annotate(&frame, &last_detections);
        let jpeg = match encode_jpeg(&annotated, config.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("Frame encode failed on camera {}: {}", camera_id, e);
                tokio::time::sleep(config.frame_interval).await;
                continue;
            }
        };

        if detector_ran && !last_detections.is_empty() && gate.is_open(Instant::now()) {
            // The gate arms on the attempt itself: a failed record write is
            // logged once per cooldown window, never retried per frame
            gate.arm(Instant::now());
            let labels: Vec<String> = last_detections.iter().map(|d| d.label.clone()).collect();
            if let Err(e) = dispatcher
                .dispatch(camera_id, &labels, &jpeg, Utc::now())
                .await
            {
                error!("Notification dispatch failed for camera {}: {}", camera_id, e);
            }
        }

        // Send fails only when every receiver is gone; idle teardown handles that
        if let Err(e) = frames_tx.send(Bytes::from(jpeg)) {
            debug!("No subscribers for camera {} frame: {}", camera_id, e);
        }

        tokio::select! {
            _ = cancel.cancelled() => (),
            _ = tokio::time::sleep(config.frame_interval) => (),
        }
    }

    source.close();
    info!("Session ended for camera {}", camera_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotConfig;
    use crate::pipeline::frame::{BoundingBox, Frame};
    use crate::pipeline::notifier::{NotificationContext, NotificationSink, RecipientResolver};
    use crate::push::{PushMessage, PushSender};
    use crate::snapshot::SnapshotStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn rgb_frame() -> Frame {
        Frame::new(16, 16, vec![40; 16 * 16 * 3])
    }

    /// Emits a fixed number of frames, then reports closed.
    struct ScriptedSource {
        frames_left: u32,
        closed: bool,
    }

    impl ScriptedSource {
        fn new(frames: u32) -> Self {
            Self {
                frames_left: frames,
                closed: false,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn poll_frame(&mut self) -> Result<ReadPoll> {
            if self.frames_left == 0 {
                return Ok(ReadPoll::Closed);
            }
            self.frames_left -= 1;
            Ok(ReadPoll::Frame(rgb_frame()))
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    /// Never produces a frame; used to verify cancellation.
    struct PendingSource {
        closed: Arc<Mutex<bool>>,
    }

    impl FrameSource for PendingSource {
        fn poll_frame(&mut self) -> Result<ReadPoll> {
            Ok(ReadPoll::Pending)
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct AlwaysCow;

    impl Detector for AlwaysCow {
        fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(vec![Detection::new(
                "cow",
                0.9,
                BoundingBox {
                    x1: 1.0,
                    y1: 1.0,
                    x2: 8.0,
                    y2: 8.0,
                },
            )])
        }
    }

    struct NoRecipients;

    #[async_trait]
    impl RecipientResolver for NoRecipients {
        async fn tokens_for_camera(&self, _camera_id: Uuid) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn context_for_camera(&self, _camera_id: Uuid) -> Result<NotificationContext> {
            Ok(NotificationContext::default())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        created: Mutex<u32>,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn create(
            &self,
            _camera_id: Uuid,
            _message: &str,
            _timestamp: DateTime<Utc>,
            _image_url: Option<&str>,
        ) -> Result<()> {
            *self.created.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingSink {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn create(
            &self,
            _camera_id: Uuid,
            _message: &str,
            _timestamp: DateTime<Utc>,
            _image_url: Option<&str>,
        ) -> Result<()> {
            *self.attempts.lock().unwrap() += 1;
            Err(crate::error::Error::Database("connection refused".to_string()).into())
        }
    }

    struct NoopPush;

    #[async_trait]
    impl PushSender for NoopPush {
        async fn send(&self, _message: &PushMessage) -> Result<()> {
            Ok(())
        }
    }

    fn test_dispatcher(
        dir: &std::path::Path,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<NotificationDispatcher> {
        let snapshots = SnapshotStore::new(&SnapshotConfig {
            storage_path: dir.to_path_buf(),
            public_base_url: "http://localhost/snapshots".to_string(),
        })
        .unwrap();
        Arc::new(NotificationDispatcher::new(
            snapshots,
            Arc::new(NoRecipients),
            sink,
            Arc::new(NoopPush),
            "Animal detected".to_string(),
            HashMap::new(),
            Duration::from_millis(100),
        ))
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            stride: 1,
            monitored: ["cow", "sheep"].iter().map(|s| s.to_string()).collect(),
            confidence_threshold: 0.25,
            jpeg_quality: 80,
            frame_interval: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            idle_grace: Duration::from_secs(30),
            cooldown: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn frames_reach_subscribers_until_source_closes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let (tx, mut rx) = broadcast::channel(16);

        run_loop(
            Uuid::new_v4(),
            Box::new(ScriptedSource::new(3)),
            Arc::new(crate::pipeline::NullDetector),
            test_dispatcher(dir.path(), sink),
            fast_config(),
            tx,
            CancellationToken::new(),
        )
        .await;

        let mut received = 0;
        while let Ok(jpeg) = rx.try_recv() {
            // JPEG SOI marker
            assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn cancellation_stops_a_pending_source_and_closes_it() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let closed = Arc::new(Mutex::new(false));
        let (tx, _rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_loop(
            Uuid::new_v4(),
            Box::new(PendingSource {
                closed: closed.clone(),
            }),
            Arc::new(crate::pipeline::NullDetector),
            test_dispatcher(dir.path(), sink),
            fast_config(),
            tx,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop did not stop after cancellation")
            .unwrap();
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn repeated_detections_notify_once_within_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let (tx, _rx) = broadcast::channel(64);

        // Ten consecutive frames all containing a cow, cooldown far larger
        // than the run; only the first eligible frame may notify
        run_loop(
            Uuid::new_v4(),
            Box::new(ScriptedSource::new(10)),
            Arc::new(AlwaysCow),
            test_dispatcher(dir.path(), sink.clone()),
            fast_config(),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(*sink.created.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn record_write_failure_does_not_retrigger_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FailingSink::default());
        let (tx, _rx) = broadcast::channel(64);

        // A cow in every frame and a failing record store: the cooldown
        // still limits the burst to a single attempt
        run_loop(
            Uuid::new_v4(),
            Box::new(ScriptedSource::new(10)),
            Arc::new(AlwaysCow),
            test_dispatcher(dir.path(), sink.clone()),
            fast_config(),
            tx,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(*sink.attempts.lock().unwrap(), 1);
        // One snapshot per attempt, not one per frame
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn stride_skips_detector_but_not_frames() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let (tx, mut rx) = broadcast::channel(64);
        let mut config = fast_config();
        config.stride = 4;

        run_loop(
            Uuid::new_v4(),
            Box::new(ScriptedSource::new(8)),
            Arc::new(AlwaysCow),
            test_dispatcher(dir.path(), sink),
            config,
            tx,
            CancellationToken::new(),
        )
        .await;

        // Every frame is still emitted regardless of detector stride
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 8);
    }

    #[tokio::test]
    async fn idle_session_tears_down_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let (tx, rx) = broadcast::channel(16);
        let mut config = fast_config();
        config.idle_grace = Duration::from_millis(30);
        drop(rx);

        let task = tokio::spawn(run_loop(
            Uuid::new_v4(),
            Box::new(PendingSource {
                closed: Arc::new(Mutex::new(false)),
            }),
            Arc::new(crate::pipeline::NullDetector),
            test_dispatcher(dir.path(), sink),
            config,
            tx,
            CancellationToken::new(),
        ));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("idle session did not tear down")
            .unwrap();
    }
}
