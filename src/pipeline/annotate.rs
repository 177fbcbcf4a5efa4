use super::frame::{Detection, Frame};
use crate::error::Error;
use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};

const BOX_COLOR: (u8, u8, u8) = (0, 255, 0);
const TEXT_COLOR: (u8, u8, u8) = (255, 255, 255);
const TEXT_BG_COLOR: (u8, u8, u8) = (0, 0, 0);
const BOX_THICKNESS: usize = 2;
const GLYPH_W: usize = 8;
const GLYPH_H: usize = 12;

/// Caption drawn next to a detection box.
pub fn caption(detection: &Detection) -> String {
    format!("{} {:.2}", detection.label, detection.confidence)
}

/// Draw bounding boxes and captions onto a copy of the frame. The input
/// frame is never mutated; with zero detections the copy is pixel-identical.
pub fn annotate(frame: &Frame, detections: &[Detection]) -> Frame {
    let mut annotated = frame.clone();
    let width = frame.width as usize;
    let height = frame.height as usize;

    for detection in detections {
        let x1 = clamp(detection.bbox.x1, width);
        let y1 = clamp(detection.bbox.y1, height);
        let x2 = clamp(detection.bbox.x2, width);
        let y2 = clamp(detection.bbox.y2, height);
        if x1 >= x2 || y1 >= y2 {
            continue;
        }

        draw_rect(&mut annotated.data, width, x1, y1, x2, y2);
        draw_caption(
            &mut annotated.data,
            width,
            height,
            &caption(detection),
            x1,
            y1,
            y2,
        );
    }

    annotated
}

/// Encode a frame as JPEG at the given quality.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .write_image(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| Error::Encode(format!("JPEG encoding failed: {}", e)))?;
    Ok(buf)
}

fn clamp(v: f32, max: usize) -> usize {
    (v.max(0.0) as usize).min(max.saturating_sub(1))
}

fn draw_rect(data: &mut [u8], width: usize, x1: usize, y1: usize, x2: usize, y2: usize) {
    for y in y1..=(y1 + BOX_THICKNESS).min(y2) {
        for x in x1..=x2 {
            set_pixel(data, x, y, width, BOX_COLOR);
        }
    }
    for y in y2.saturating_sub(BOX_THICKNESS).max(y1)..=y2 {
        for x in x1..=x2 {
            set_pixel(data, x, y, width, BOX_COLOR);
        }
    }
    for y in y1..=y2 {
        for x in x1..=(x1 + BOX_THICKNESS).min(x2) {
            set_pixel(data, x, y, width, BOX_COLOR);
        }
        for x in x2.saturating_sub(BOX_THICKNESS).max(x1)..=x2 {
            set_pixel(data, x, y, width, BOX_COLOR);
        }
    }
}

fn draw_caption(
    data: &mut [u8],
    width: usize,
    height: usize,
    text: &str,
    x1: usize,
    y1: usize,
    y2: usize,
) {
    // Above the box when there is room, otherwise just inside the top edge
    let label_y = if y1 > GLYPH_H + 3 {
        y1 - GLYPH_H - 3
    } else {
        (y2 + 5).min(height.saturating_sub(GLYPH_H))
    };
    let label_x = x1;

    let text_width = text.chars().count() * GLYPH_W;
    for ty in label_y.saturating_sub(2)..=(label_y + GLYPH_H + 2).min(height.saturating_sub(1)) {
        for tx in label_x.saturating_sub(2)..=(label_x + text_width + 2).min(width.saturating_sub(1)) {
            set_pixel(data, tx, ty, width, TEXT_BG_COLOR);
        }
    }

    let mut x = label_x;
    for ch in text.chars() {
        if let Some(pattern) = glyph(ch) {
            for (row, bits) in pattern.iter().enumerate() {
                if label_y + row >= height {
                    break;
                }
                for col in 0..GLYPH_W {
                    if x + col >= width {
                        break;
                    }
                    if (bits >> (7 - col)) & 1 == 1 {
                        set_pixel(data, x + col, label_y + row, width, TEXT_COLOR);
                    }
                }
            }
        }
        x += GLYPH_W;
        if x >= width {
            break;
        }
    }
}

fn set_pixel(data: &mut [u8], x: usize, y: usize, width: usize, color: (u8, u8, u8)) {
    let idx = (y * width + x) * 3;
    if idx + 2 < data.len() {
        data[idx] = color.0;
        data[idx + 1] = color.1;
        data[idx + 2] = color.2;
    }
}

/// 8x12 bitmap glyphs for caption text. Unknown characters render as a gap.
fn glyph(ch: char) -> Option<[u8; 12]> {
    let pattern = match ch {
        'a' => [0x00, 0x00, 0x00, 0x3C, 0x02, 0x3E, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'b' => [0x00, 0x40, 0x40, 0x5C, 0x62, 0x42, 0x42, 0x42, 0x62, 0x5C, 0x00, 0x00],
        'c' => [0x00, 0x00, 0x00, 0x3C, 0x42, 0x40, 0x40, 0x40, 0x42, 0x3C, 0x00, 0x00],
        'd' => [0x00, 0x02, 0x02, 0x3A, 0x46, 0x42, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'e' => [0x00, 0x00, 0x00, 0x3C, 0x42, 0x7E, 0x40, 0x40, 0x42, 0x3C, 0x00, 0x00],
        'f' => [0x00, 0x0C, 0x10, 0x7C, 0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x00, 0x00],
        'g' => [0x00, 0x00, 0x00, 0x3A, 0x46, 0x42, 0x46, 0x3A, 0x02, 0x3C, 0x00, 0x00],
        'h' => [0x00, 0x40, 0x40, 0x5C, 0x62, 0x42, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'i' => [0x00, 0x08, 0x00, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        'k' => [0x00, 0x40, 0x40, 0x44, 0x48, 0x70, 0x48, 0x44, 0x42, 0x41, 0x00, 0x00],
        'l' => [0x00, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        'm' => [0x00, 0x00, 0x00, 0x76, 0x49, 0x49, 0x49, 0x49, 0x49, 0x49, 0x00, 0x00],
        'n' => [0x00, 0x00, 0x00, 0x5C, 0x62, 0x42, 0x42, 0x42, 0x42, 0x42, 0x00, 0x00],
        'o' => [0x00, 0x00, 0x00, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        'p' => [0x00, 0x00, 0x00, 0x5C, 0x62, 0x42, 0x62, 0x5C, 0x40, 0x40, 0x00, 0x00],
        'r' => [0x00, 0x00, 0x00, 0x5C, 0x62, 0x40, 0x40, 0x40, 0x40, 0x40, 0x00, 0x00],
        's' => [0x00, 0x00, 0x00, 0x3E, 0x40, 0x3C, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        't' => [0x00, 0x10, 0x10, 0x7C, 0x10, 0x10, 0x10, 0x10, 0x10, 0x0C, 0x00, 0x00],
        'u' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x42, 0x42, 0x46, 0x3A, 0x00, 0x00],
        'v' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x24, 0x24, 0x18, 0x18, 0x00, 0x00],
        'w' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x5A, 0x66, 0x42, 0x42, 0x00, 0x00],
        'x' => [0x00, 0x00, 0x00, 0x42, 0x24, 0x18, 0x18, 0x24, 0x42, 0x42, 0x00, 0x00],
        'y' => [0x00, 0x00, 0x00, 0x42, 0x42, 0x42, 0x26, 0x1A, 0x02, 0x3C, 0x00, 0x00],
        'z' => [0x00, 0x00, 0x00, 0x7E, 0x04, 0x08, 0x10, 0x20, 0x40, 0x7E, 0x00, 0x00],
        '0' => [0x00, 0x3C, 0x42, 0x46, 0x4A, 0x52, 0x62, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '1' => [0x00, 0x08, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08, 0x08, 0x3E, 0x00, 0x00],
        '2' => [0x00, 0x3C, 0x42, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x7E, 0x00, 0x00],
        '3' => [0x00, 0x3C, 0x42, 0x02, 0x1C, 0x02, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        '4' => [0x00, 0x04, 0x0C, 0x14, 0x24, 0x44, 0x7E, 0x04, 0x04, 0x04, 0x00, 0x00],
        '5' => [0x00, 0x7E, 0x40, 0x40, 0x7C, 0x02, 0x02, 0x02, 0x42, 0x3C, 0x00, 0x00],
        '6' => [0x00, 0x1C, 0x20, 0x40, 0x7C, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '7' => [0x00, 0x7E, 0x02, 0x04, 0x08, 0x08, 0x10, 0x10, 0x20, 0x20, 0x00, 0x00],
        '8' => [0x00, 0x3C, 0x42, 0x42, 0x3C, 0x42, 0x42, 0x42, 0x42, 0x3C, 0x00, 0x00],
        '9' => [0x00, 0x3C, 0x42, 0x42, 0x42, 0x3E, 0x02, 0x04, 0x08, 0x70, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x00, 0x00],
        ' ' => [0x00; 12],
        _ => return None,
    };
    Some(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::BoundingBox;

    fn test_frame(width: u32, height: u32) -> Frame {
        // Mid-grey so box and caption pixels always differ from the base
        let data = vec![128u8; (width * height * 3) as usize];
        Frame::new(width, height, data)
    }

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(
            "cow",
            0.87,
            BoundingBox { x1, y1, x2, y2 },
        )
    }

    #[test]
    fn caption_is_label_and_two_decimals() {
        assert_eq!(caption(&detection(0.0, 0.0, 1.0, 1.0)), "cow 0.87");
        let d = Detection::new(
            "sheep",
            0.5,
            BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 1.0,
                y2: 1.0,
            },
        );
        assert_eq!(caption(&d), "sheep 0.50");
    }

    #[test]
    fn zero_detections_encode_byte_identical() {
        let frame = test_frame(64, 48);
        let annotated = annotate(&frame, &[]);

        assert_eq!(frame.data, annotated.data);
        assert_eq!(
            encode_jpeg(&frame, 80).unwrap(),
            encode_jpeg(&annotated, 80).unwrap()
        );
    }

    #[test]
    fn annotation_does_not_mutate_the_source_frame() {
        let frame = test_frame(64, 48);
        let before = frame.data.clone();
        let _ = annotate(&frame, &[detection(5.0, 20.0, 40.0, 40.0)]);
        assert_eq!(frame.data, before);
    }

    #[test]
    fn annotation_changes_pixels_inside_the_box_edges() {
        let frame = test_frame(64, 48);
        let annotated = annotate(&frame, &[detection(5.0, 20.0, 40.0, 40.0)]);
        assert_ne!(frame.data, annotated.data);

        // Top-left corner of the box is painted in the box color
        let idx = (20 * 64 + 5) * 3;
        assert_eq!(&annotated.data[idx..idx + 3], &[0, 255, 0]);
    }

    #[test]
    fn out_of_bounds_boxes_are_clamped_without_panic() {
        let frame = test_frame(32, 32);
        let detections = vec![
            detection(-10.0, -10.0, 100.0, 100.0),
            detection(40.0, 40.0, 50.0, 50.0),
            detection(10.0, 10.0, 5.0, 5.0),
        ];
        let annotated = annotate(&frame, &detections);
        assert_eq!(annotated.data.len(), frame.data.len());
    }

    #[test]
    fn encode_rejects_mismatched_buffer() {
        let frame = Frame {
            width: 64,
            height: 48,
            data: vec![0u8; 10],
            pts_ms: None,
        };
        assert!(encode_jpeg(&frame, 80).is_err());
    }
}
