use crate::{labels::ClassLabels, postprocess::Detection};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use std::{fs, path::Path};
use thiserror::Error;

const MASK_ALPHA: f32 = 0.5;
const BOX_THICKNESS: u32 = 2;
const CAPTION_SCALE: f32 = 16.0;
const CAPTION_PADDING: u32 = 2;
const CAPTION_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

#[derive(Error, Debug)]
pub enum FontError {
    #[error("Failed to read font: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid font file {0}")]
    Invalid(String),
}

pub fn load_font(path: &Path) -> Result<FontVec, FontError> {
    let data = fs::read(path)?;
    FontVec::try_from_vec(data).map_err(|_| FontError::Invalid(path.display().to_string()))
}

/// Draws masks, boxes and, when a font is available, `label confidence`
/// captions onto a copy of `image`.
pub fn render_detections(
    image: &RgbImage,
    detections: &[Detection],
    labels: &ClassLabels,
    font: Option<&FontVec>,
) -> RgbImage {
    let mut canvas = image.clone();

    for detection in detections {
        let (_, color) = labels.describe(detection.class_id);
        if let Some(mask) = &detection.mask {
            for (x, y, pixel) in mask.pixels.enumerate_pixels() {
                if pixel.0[0] == 0 {
                    continue;
                }
                if let Some(target) = canvas.get_pixel_mut_checked(mask.left + x, mask.top + y) {
                    *target = blend(*target, color, MASK_ALPHA);
                }
            }
        }
    }

    for detection in detections {
        let (name, color) = labels.describe(detection.class_id);
        let Some(rect) = rect_from_detection(detection, canvas.width(), canvas.height()) else {
            continue;
        };

        for inset in 0..BOX_THICKNESS {
            if rect.width() <= 2 * inset || rect.height() <= 2 * inset {
                break;
            }
            let inner = Rect::at(rect.left() + inset as i32, rect.top() + inset as i32)
                .of_size(rect.width() - 2 * inset, rect.height() - 2 * inset);
            draw_hollow_rect_mut(&mut canvas, inner, color);
        }

        if let Some(font) = font {
            let caption = format!("{} {:.2}", name, detection.confidence);
            draw_caption(&mut canvas, &rect, &caption, color, font);
        }
    }

    canvas
}

fn draw_caption(canvas: &mut RgbImage, rect: &Rect, caption: &str, color: Rgb<u8>, font: &FontVec) {
    let scale = PxScale::from(CAPTION_SCALE);
    let (text_w, text_h) = text_size(scale, font, caption);
    let box_w = text_w + 2 * CAPTION_PADDING;
    let box_h = text_h + 2 * CAPTION_PADDING;

    // Above the box when there is room, otherwise just inside its top edge.
    let top = if rect.top() >= box_h as i32 {
        rect.top() - box_h as i32
    } else {
        rect.top()
    };

    draw_filled_rect_mut(canvas, Rect::at(rect.left(), top).of_size(box_w, box_h), color);
    draw_text_mut(
        canvas,
        CAPTION_COLOR,
        rect.left() + CAPTION_PADDING as i32,
        top + CAPTION_PADDING as i32,
        scale,
        font,
        caption,
    );
}

fn blend(base: Rgb<u8>, overlay: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    let mix = |b: u8, o: u8| ((b as f32) * (1. - alpha) + (o as f32) * alpha).round() as u8;
    Rgb([
        mix(base.0[0], overlay.0[0]),
        mix(base.0[1], overlay.0[1]),
        mix(base.0[2], overlay.0[2]),
    ])
}

fn rect_from_detection(detection: &Detection, img_w: u32, img_h: u32) -> Option<Rect> {
    if img_w == 0 || img_h == 0 {
        return None;
    }
    let max_x = (img_w - 1) as f32;
    let max_y = (img_h - 1) as f32;
    let bbox = &detection.bbox;

    let x1 = bbox.x1.clamp(0., max_x).round();
    let y1 = bbox.y1.clamp(0., max_y).round();
    let x2 = bbox.x2.clamp(0., max_x).round();
    let y2 = bbox.y2.clamp(0., max_y).round();

    let width = (x2 - x1).max(1.) as u32;
    let height = (y2 - y1).max(1.) as u32;

    Some(Rect::at(x1 as i32, y1 as i32).of_size(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        labels::ColorLabel,
        postprocess::{BoundingBox, Mask},
    };
    use image::{GrayImage, Luma};

    fn labels() -> ClassLabels {
        ClassLabels::new(vec![ColorLabel {
            label: "tumor".to_string(),
            red: 255,
            green: 0,
            blue: 0,
        }])
    }

    fn detection(mask: Option<Mask>) -> Detection {
        Detection {
            class_id: 0,
            confidence: 0.9,
            bbox: BoundingBox {
                x1: 10.,
                y1: 10.,
                x2: 30.,
                y2: 30.,
            },
            mask,
        }
    }

    #[test]
    fn test_render_draws_box_outline() {
        let image = RgbImage::from_pixel(50, 40, Rgb([0, 0, 0]));

        let rendered = render_detections(&image, &[detection(None)], &labels(), None);

        assert_eq!(rendered.dimensions(), (50, 40));
        assert_eq!(rendered.get_pixel(10, 10), &Rgb([255, 0, 0]));
        assert_eq!(rendered.get_pixel(11, 20), &Rgb([255, 0, 0]));
        assert_eq!(rendered.get_pixel(20, 20), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_render_blends_mask() {
        let image = RgbImage::from_pixel(50, 40, Rgb([0, 0, 200]));
        let mut pixels = GrayImage::new(20, 20);
        pixels.put_pixel(10, 10, Luma([255]));
        let mask = Mask {
            left: 10,
            top: 10,
            pixels,
        };

        let rendered = render_detections(&image, &[detection(Some(mask))], &labels(), None);

        assert_eq!(rendered.get_pixel(20, 20), &Rgb([128, 0, 100]));
        assert_eq!(rendered.get_pixel(21, 21), &Rgb([0, 0, 200]));
    }

    #[test]
    fn test_render_without_detections_is_identity() {
        let image = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));

        let rendered = render_detections(&image, &[], &labels(), None);

        assert_eq!(rendered, image);
    }

    #[test]
    fn test_blend() {
        assert_eq!(blend(Rgb([0, 100, 255]), Rgb([255, 100, 0]), 0.5), Rgb([128, 100, 128]));
    }
}
