pub mod annotate;
pub mod detector;
pub mod frame;
pub mod notifier;
pub mod reader;
pub mod session;
pub mod supervisor;

pub use detector::{Detector, NullDetector};
pub use frame::{BoundingBox, Detection, Frame};
pub use notifier::NotificationDispatcher;
pub use reader::{FrameReader, FrameSource, GstSourceOpener, ReadPoll, SourceOpener};
pub use session::{SessionConfig, SessionHandle};
pub use supervisor::{CameraDirectory, StreamSupervisor};
