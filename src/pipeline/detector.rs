use super::frame::{Detection, Frame};
use anyhow::Result;
use std::collections::HashSet;

/// Object detection capability. Synchronous and side-effect free; any
/// implementation mapping a frame to labeled boxes is substitutable, which
/// keeps the pipeline testable with scripted fakes.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Default wiring point when no model is attached: detects nothing.
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Keep only detections that are notification-eligible: label in the
/// monitored-species set and confidence at or above the floor.
pub fn filter_monitored(
    detections: Vec<Detection>,
    monitored: &HashSet<String>,
    confidence_threshold: f32,
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= confidence_threshold && monitored.contains(&d.label))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::BoundingBox;

    fn bbox() -> BoundingBox {
        BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 10.0,
            y2: 10.0,
        }
    }

    fn monitored() -> HashSet<String> {
        ["cow", "sheep"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unmonitored_labels_are_discarded() {
        let detections = vec![
            Detection::new("cow", 0.9, bbox()),
            Detection::new("person", 0.95, bbox()),
            Detection::new("sheep", 0.8, bbox()),
        ];

        let kept = filter_monitored(detections, &monitored(), 0.25);
        let labels: Vec<_> = kept.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["cow", "sheep"]);
    }

    #[test]
    fn low_confidence_is_discarded() {
        let detections = vec![
            Detection::new("cow", 0.1, bbox()),
            Detection::new("cow", 0.5, bbox()),
        ];

        let kept = filter_monitored(detections, &monitored(), 0.25);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.5);
    }

    #[test]
    fn null_detector_detects_nothing() {
        let frame = Frame::new(2, 2, vec![0; 12]);
        assert!(NullDetector.detect(&frame).unwrap().is_empty());
    }
}
