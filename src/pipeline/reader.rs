use super::frame::Frame;
use crate::error::Error;
use anyhow::Result;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// What a camera source string points at. Finite file sources loop on
/// end-of-stream; live sources stall and recover instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Device,
    Live,
}

impl SourceKind {
    pub fn classify(source: &str) -> SourceKind {
        if source.starts_with("/dev/video") {
            SourceKind::Device
        } else if source.starts_with("file://") || !source.contains("://") {
            SourceKind::File
        } else {
            SourceKind::Live
        }
    }
}

/// Outcome of one non-blocking read attempt.
pub enum ReadPoll {
    /// A fresh frame is available
    Frame(Frame),
    /// No frame ready yet (prerolling, stalled backoff, or between frames)
    Pending,
    /// The source is closed; no more frames will ever arrive
    Closed,
}

/// Anything the session loop can pull frames from. The production
/// implementation is [`FrameReader`]; tests use scripted sources.
pub trait FrameSource: Send {
    fn poll_frame(&mut self) -> Result<ReadPoll>;
    fn close(&mut self);
}

/// Opens a resolved URI as a frame source. Seam between the supervisor and
/// the concrete media backend; blocking, run it off the async threads.
pub trait SourceOpener: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;
}

/// Production opener backed by [`FrameReader`].
pub struct GstSourceOpener {
    pub frame_rate: u32,
    pub open_timeout: Duration,
    pub stall_backoff: Duration,
}

impl SourceOpener for GstSourceOpener {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let reader = FrameReader::open(uri, self.frame_rate, self.open_timeout, self.stall_backoff)?;
        Ok(Box::new(reader))
    }
}

#[derive(Debug)]
enum ReaderState {
    Opening,
    Streaming,
    Stalled { since: Instant },
    Closed,
}

/// Owns an open media source and pulls RGB frames from it.
///
/// State machine: `Opening -> Streaming -> Stalled -> Closed`. The appsink
/// holds at most one buffer and drops older ones, trading completeness for
/// recency. Polling never blocks; pacing comes from the session loop.
pub struct FrameReader {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    kind: SourceKind,
    state: ReaderState,
    stall_backoff: Duration,
    uri: String,
}

impl FrameReader {
    /// Open a resolved source URI. Failure to reach a playable state within
    /// the timeout is fatal (`Error::SourceOpen`); there is no retry here.
    pub fn open(
        source: &str,
        frame_rate: u32,
        open_timeout: Duration,
        stall_backoff: Duration,
    ) -> Result<Self> {
        let kind = SourceKind::classify(source);
        let pipeline_str = match kind {
            SourceKind::Device => format!(
                "v4l2src device={} ! videoconvert ! videorate ! video/x-raw,format=RGB,framerate={}/1 ! appsink name=sink",
                source, frame_rate
            ),
            SourceKind::File | SourceKind::Live => {
                let uri = if source.contains("://") {
                    source.to_string()
                } else {
                    format!("file://{}", source)
                };
                format!(
                    "uridecodebin uri={} ! videoconvert ! videorate ! video/x-raw,format=RGB,framerate={}/1 ! appsink name=sink",
                    uri, frame_rate
                )
            }
        };
        debug!("Opening source pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| Error::SourceOpen(format!("Failed to build pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::SourceOpen("Parsed element is not a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| Error::SourceOpen("Missing appsink element".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::SourceOpen("sink element is not an appsink".to_string()))?;

        // Depth-1 input buffer: always prefer the freshest frame over lag
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(true);

        let mut reader = Self {
            pipeline,
            appsink,
            kind,
            state: ReaderState::Opening,
            stall_backoff,
            uri: source.to_string(),
        };

        reader
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| {
                reader.release();
                Error::SourceOpen(format!("Failed to start pipeline for {}: {}", source, e))
            })?;

        // Wait for preroll, bounded; a bus error during preroll is fatal
        let (res, _, _) = reader
            .pipeline
            .state(gst::ClockTime::from_seconds(open_timeout.as_secs()));
        if res.is_err() {
            let detail = reader
                .drain_bus()
                .error
                .unwrap_or_else(|| "state change failed".to_string());
            reader.release();
            return Err(Error::SourceOpen(format!("Cannot open {}: {}", source, detail)).into());
        }

        info!("Source opened: {} ({:?})", source, kind);
        reader.state = ReaderState::Streaming;
        Ok(reader)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReaderState::Closed)
    }

    fn release(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
        self.state = ReaderState::Closed;
    }

    fn drain_bus(&self) -> BusEvents {
        let mut events = BusEvents::default();
        if let Some(bus) = self.pipeline.bus() {
            while let Some(msg) = bus.pop() {
                match msg.view() {
                    gst::MessageView::Eos(..) => events.eos = true,
                    gst::MessageView::Error(err) => {
                        events.error = Some(format!("{} ({:?})", err.error(), err.debug()));
                    }
                    _ => (),
                }
            }
        }
        events
    }

    fn pull(&mut self) -> Option<Frame> {
        let sample = self.appsink.try_pull_sample(gst::ClockTime::ZERO)?;
        let caps = sample.caps()?;
        let video_info = gst_video::VideoInfo::from_caps(caps).ok()?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;

        let width = video_info.width() as usize;
        let height = video_info.height() as usize;
        let stride = video_info
            .stride()
            .first()
            .map(|s| *s as usize)
            .unwrap_or(width * 3);

        let mut frame = Frame::new(
            video_info.width(),
            video_info.height(),
            packed_rgb(map.as_slice(), width, height, stride),
        );
        frame.pts_ms = buffer.pts().map(|pts| pts.mseconds());
        Some(frame)
    }

    /// Seek a finite source back to its start for looping playback.
    fn rewind(&mut self) -> bool {
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::ZERO,
            )
            .is_ok()
    }
}

#[derive(Default)]
struct BusEvents {
    eos: bool,
    error: Option<String>,
}

/// What the reader does in response to drained bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusAction {
    /// Nothing notable; keep reading
    Read,
    /// Finite source finished; seek to start and read again
    RewindAndRead,
    /// Transient trouble; enter the stalled state
    Stall,
    /// Unrecoverable; release the pipeline
    Close,
}

fn bus_action(kind: SourceKind, events: &BusEvents) -> BusAction {
    if events.error.is_some() {
        return match kind {
            // Live and device sources are assumed eventually recoverable
            SourceKind::Device | SourceKind::Live => BusAction::Stall,
            SourceKind::File => BusAction::Close,
        };
    }
    if events.eos {
        return match kind {
            SourceKind::File => BusAction::RewindAndRead,
            SourceKind::Device | SourceKind::Live => BusAction::Stall,
        };
    }
    BusAction::Read
}

/// Copy mapped pixel rows into a packed RGB buffer, dropping any per-row
/// alignment padding the decoder added.
fn packed_rgb(src: &[u8], width: usize, height: usize, stride: usize) -> Vec<u8> {
    let row_bytes = width * 3;
    if stride == row_bytes && src.len() == row_bytes * height {
        return src.to_vec();
    }
    let mut data = Vec::with_capacity(row_bytes * height);
    for row in src.chunks(stride).take(height) {
        data.extend_from_slice(&row[..row_bytes.min(row.len())]);
    }
    data
}

impl FrameSource for FrameReader {
    fn poll_frame(&mut self) -> Result<ReadPoll> {
        match self.state {
            ReaderState::Closed => return Ok(ReadPoll::Closed),
            ReaderState::Opening => return Ok(ReadPoll::Pending),
            _ => (),
        }

        let events = self.drain_bus();
        match bus_action(self.kind, &events) {
            BusAction::Close => {
                warn!(
                    "Unrecoverable source error on {}: {}",
                    self.uri,
                    events.error.unwrap_or_default()
                );
                self.release();
                return Ok(ReadPoll::Closed);
            }
            BusAction::Stall => {
                match events.error {
                    Some(detail) => {
                        warn!("Source error on {} (entering stall): {}", self.uri, detail)
                    }
                    None => warn!("Unexpected end of stream on {} (entering stall)", self.uri),
                }
                self.state = ReaderState::Stalled {
                    since: Instant::now(),
                };
                return Ok(ReadPoll::Pending);
            }
            BusAction::RewindAndRead => {
                debug!("End of file on {}, rewinding", self.uri);
                if !self.rewind() {
                    warn!("Rewind failed on {}", self.uri);
                    self.release();
                    return Ok(ReadPoll::Closed);
                }
                return match self.pull() {
                    Some(frame) => Ok(ReadPoll::Frame(frame)),
                    None => Ok(ReadPoll::Pending),
                };
            }
            BusAction::Read => (),
        }

        match self.state {
            ReaderState::Streaming => match self.pull() {
                Some(frame) => Ok(ReadPoll::Frame(frame)),
                None => Ok(ReadPoll::Pending),
            },
            ReaderState::Stalled { since } => {
                if since.elapsed() < self.stall_backoff {
                    return Ok(ReadPoll::Pending);
                }
                // One probe read per backoff interval, retrying indefinitely
                match self.pull() {
                    Some(frame) => {
                        info!("Source {} recovered from stall", self.uri);
                        self.state = ReaderState::Streaming;
                        Ok(ReadPoll::Frame(frame))
                    }
                    None => {
                        warn!("Source {} still stalled, retrying in {:?}", self.uri, self.stall_backoff);
                        self.state = ReaderState::Stalled {
                            since: Instant::now(),
                        };
                        Ok(ReadPoll::Pending)
                    }
                }
            }
            ReaderState::Opening | ReaderState::Closed => Ok(ReadPoll::Pending),
        }
    }

    fn close(&mut self) {
        if !self.is_closed() {
            info!("Closing source {}", self.uri);
            self.release();
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.close();
    }
}
