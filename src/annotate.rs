use std::io::Cursor;

use image::{ImageError, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::tracking::TrackedObject;

const LINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const CENTROID_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

/// Draws the counting line and every tracked object onto `frame`.
pub fn draw_overlay<'a>(
    frame: &mut RgbImage,
    line_y: f32,
    objects: impl IntoIterator<Item = &'a TrackedObject>,
) {
    let (width, height) = frame.dimensions();
    draw_line_segment_mut(frame, (0.0, line_y), (width as f32, line_y), LINE_COLOR);

    for obj in objects {
        if let Some((x, y, w, h)) = obj.bbox.clip(width, height) {
            let rect = Rect::at(x as i32, y as i32).of_size(w, h);
            draw_hollow_rect_mut(frame, rect, BOX_COLOR);
        }
        draw_filled_circle_mut(
            frame,
            (obj.centroid.x as i32, obj.centroid.y as i32),
            3,
            CENTROID_COLOR,
        );
    }
}

pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>, ImageError> {
    let mut bytes = Vec::new();
    frame.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    Ok(bytes)
}
