use serde::{Deserialize, Serialize};

/// A single decoded video frame in packed RGB.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24, row-major, width * height * 3 bytes
    pub data: Vec<u8>,
    /// Presentation timestamp in milliseconds, when the source provides one
    pub pts_ms: Option<u64>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            data,
            pts_ms: None,
        }
    }
}

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One detector hit on a frame. Transient: aggregated into a notification,
/// never persisted individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: &str, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.to_string(),
            confidence,
            bbox,
        }
    }
}
