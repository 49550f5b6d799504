//! Overlay rendering: live frame background plus detection annotations.
//!
//! Rendering is deterministic — the same frame and state always produce the
//! same pixels. Bounding boxes are drawn in the coordinate space of the frame
//! at capture time; if the live frame has since changed size the boxes are
//! not rescaled. That is the sole accepted staleness artifact.

use anyhow::{anyhow, Result};
use frame_source::{Frame, FrameFormat};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, Rgba, RgbaImage};

use crate::annotator::state::{Detection, PipelineState};

const BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const LABEL_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const BACKING_COLOR: Rgba<u8> = Rgba([0, 0, 0, 180]);
const STATUS_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_ADVANCE: i32 = 6;

/// Draws the latest accepted detections over the current live frame.
pub(crate) struct OverlayRenderer;

impl OverlayRenderer {
    /// Repaint: clear to the live frame, then overlay boxes, labels, the
    /// flagged banner, and the error indicator from `state`.
    pub(crate) fn render(&self, frame: &Frame, state: &PipelineState) -> Result<RgbaImage> {
        let rgba = match frame.format {
            FrameFormat::Bgr8 => bgr_to_rgba(&frame.data),
        };
        let mut image = RgbaImage::from_vec(frame.width, frame.height, rgba)
            .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

        if let Some(result) = &state.latest_result {
            for detection in &result.detections {
                draw_detection(&mut image, detection);
            }
            if result.flagged {
                draw_banner(&mut image, "FLAGGED", 2, 2, LABEL_COLOR);
            }
        }

        if let Some(kind) = &state.last_error {
            let text = format!("ERR {kind}");
            let y = (frame.height as i32 - 12).max(0);
            draw_banner(&mut image, &text, 2, y, STATUS_COLOR);
        }

        Ok(image)
    }
}

/// Label text for one detection: class name plus confidence as a percentage
/// with one decimal place.
pub(crate) fn label_for(detection: &Detection) -> String {
    format!("{} {:.1}%", detection.class, detection.confidence * 100.0)
}

fn draw_detection(image: &mut RgbaImage, detection: &Detection) {
    let max_x = image.width().saturating_sub(1) as f32;
    let max_y = image.height().saturating_sub(1) as f32;
    let left = detection.bbox[0].clamp(0.0, max_x).round() as i32;
    let top = detection.bbox[1].clamp(0.0, max_y).round() as i32;
    let right = detection.bbox[2].clamp(0.0, max_x).round() as i32;
    let bottom = detection.bbox[3].clamp(0.0, max_y).round() as i32;

    draw_rectangle(image, left, top, right, bottom, BOX_COLOR, BOX_THICKNESS);

    // Label sits just inside the top-left corner of the box.
    let text = label_for(detection);
    draw_banner(image, &text, left + 4, top + 16, LABEL_COLOR);
}

/// Text on a filled backing strip so it stays readable over video content.
fn draw_banner(image: &mut RgbaImage, text: &str, x: i32, y: i32, color: Rgba<u8>) {
    let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
    fill_rect(image, x - 2, y - 2, x + text_width, y + 8, BACKING_COLOR);
    draw_label(image, x, y, text, color);
}

fn draw_rectangle(
    image: &mut RgbaImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgba<u8>,
    thickness: i32,
) {
    for t in 0..thickness {
        draw_border(image, left + t, top + t, right - t, bottom - t, color);
    }
}

fn draw_border(image: &mut RgbaImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));
    if left > right || top > bottom {
        return;
    }

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(image: &mut RgbaImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_label(image: &mut RgbaImage, mut x: i32, y: i32, text: &str, color: Rgba<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            *image.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// Encode a rendered overlay as JPEG for the preview surface.
pub(crate) fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn bgr_to_rgba(input: &[u8]) -> Vec<u8> {
    let pixels = input.len() / 3;
    let mut output = Vec::with_capacity(pixels * 4);
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
        output.push(255);
    }
    output
}

/// 5x7 bitmap glyphs. Class labels are arbitrary service strings, so the
/// full alphabet is covered; anything else renders as a blank advance.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'B' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'D' => Some([
            0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'F' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000,
        ]),
        'G' => Some([
            0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111,
        ]),
        'H' => Some([
            0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'I' => Some([
            0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        'J' => Some([
            0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100,
        ]),
        'K' => Some([
            0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001,
        ]),
        'L' => Some([
            0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'M' => Some([
            0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'P' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000,
        ]),
        'Q' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        'T' => Some([
            0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        'U' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'V' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100,
        ]),
        'W' => Some([
            0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001,
        ]),
        'X' => Some([
            0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b01010, 0b10001,
        ]),
        'Y' => Some([
            0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100,
        ]),
        'Z' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        '%' => Some([
            0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000,
        ]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        ':' => Some([0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0]),
        '-' => Some([0, 0, 0, 0b01110, 0, 0, 0]),
        '_' => Some([0, 0, 0, 0, 0, 0, 0b11111]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}
