use std::io::Cursor;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::error::VisualizeError;
use crate::gradcam::Heatmap;

/// Blend weight of the photograph in [`overlay`].
pub const IMAGE_WEIGHT: f32 = 0.6;
/// Blend weight of the colourised heatmap in [`overlay`].
pub const HEAT_WEIGHT: f32 = 0.4;

pub const ORIGINAL_TITLE: &str = "Original Retina Image";

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT: Rgb<u8> = Rgb([0, 0, 0]);

fn jet_channels(v: f32) -> [f32; 3] {
    let v = v.clamp(0.0, 1.0);
    let ramp = |offset: f32| (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
    [ramp(3.0), ramp(2.0), ramp(1.0)]
}

/// JET colour ramp: dark blue at 0, green at 0.5, dark red at 1.
pub fn jet(v: f32) -> Rgb<u8> {
    let [r, g, b] = jet_channels(v);
    Rgb([
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    ])
}

pub fn colorize(heatmap: &Heatmap) -> RgbImage {
    let (h, w) = heatmap.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| jet(heatmap.get(x as usize, y as usize)))
}

/// `alpha_image * base + alpha_heat * jet(heatmap)`, per pixel.
pub fn overlay(
    base: &RgbImage,
    heatmap: &Heatmap,
    alpha_image: f32,
    alpha_heat: f32,
) -> Result<RgbImage, VisualizeError> {
    let (h, w) = heatmap.dim();
    if base.dimensions() != (w as u32, h as u32) {
        return Err(VisualizeError::SizeMismatch {
            heatmap: (h, w),
            image: base.dimensions(),
        });
    }

    let mut out = base.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let heat = jet_channels(heatmap.get(x as usize, y as usize));
        for c in 0..3 {
            let v = alpha_image * px[c] as f32 + alpha_heat * heat[c] * 255.0;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

pub fn load_font(path: &Path) -> Result<FontVec, VisualizeError> {
    let bytes = std::fs::read(path)?;
    FontVec::try_from_vec(bytes).map_err(|e| VisualizeError::Font(format!("{:?}: {e}", path)))
}

/// Place `left` and `right` next to each other. With a font, a title band is
/// drawn above each panel.
pub fn side_by_side(
    left: &RgbImage,
    right: &RgbImage,
    titles: Option<(&FontVec, [&str; 2])>,
) -> RgbImage {
    let panel_h = left.height().max(right.height());
    let band = if titles.is_some() {
        (panel_h / 10).max(16)
    } else {
        0
    };
    let mut canvas = RgbImage::from_pixel(left.width() + right.width(), panel_h + band, BACKGROUND);
    image::imageops::replace(&mut canvas, left, 0, band as i64);
    image::imageops::replace(&mut canvas, right, left.width() as i64, band as i64);

    if let Some((font, [left_title, right_title])) = titles {
        let canvas_w = canvas.width();
        draw_filled_rect_mut(&mut canvas, Rect::at(0, 0).of_size(canvas_w, band), BACKGROUND);
        let scale = PxScale::from(band as f32 * 0.7);
        for (title, x0, width) in [
            (left_title, 0, left.width()),
            (right_title, left.width(), right.width()),
        ] {
            let (tw, th) = text_size(scale, font, title);
            let x = x0 as i32 + (width as i32 - tw as i32).max(0) / 2;
            let y = (band as i32 - th as i32).max(0) / 2;
            draw_text_mut(&mut canvas, TEXT, x, y, scale, font, title);
        }
    }
    canvas
}

/// Original next to its Grad-CAM overlay for `label`.
pub fn render_gradcam(
    original: &RgbImage,
    heatmap: &Heatmap,
    label: &str,
    font: Option<&FontVec>,
) -> Result<RgbImage, VisualizeError> {
    let blended = overlay(original, heatmap, IMAGE_WEIGHT, HEAT_WEIGHT)?;
    let right_title = format!("Grad-CAM: {label}");
    Ok(side_by_side(
        original,
        &blended,
        font.map(|f| (f, [ORIGINAL_TITLE, right_title.as_str()])),
    ))
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, VisualizeError> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(image.clone()).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}
