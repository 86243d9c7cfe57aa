//! Document image normalization.
//!
//! Crops a raw capture down to the document itself. Live captures are cropped
//! to the on-screen guide rectangle the user aligned the card with; uploads
//! have no guide, so they are cropped toward the ID-1 card aspect ratio.
//! The source image is never mutated.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use thiserror::Error;

/// ID-1 card aspect ratio (85.60 × 53.98 mm).
pub const ID_CARD_ASPECT: f32 = 1.586;
/// Relative aspect deviation tolerated before an upload is cropped.
const ASPECT_TOLERANCE: f32 = 0.20;
/// Margin trimmed from every side of an upload to drop card edges.
const UPLOAD_EDGE_TRIM: f32 = 0.05;
/// Default guide margin on every side of the live preview.
const GUIDE_MARGIN: f32 = 0.08;

const OCR_CONTRAST: f32 = 1.3;
const OCR_LONG_EDGE: u32 = 1500;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("degenerate image dimensions: {width}x{height}")]
    Degenerate { width: u32, height: u32 },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Capture guide rectangle, as fractions of the preview container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuideRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl Default for GuideRect {
    fn default() -> Self {
        Self {
            left: GUIDE_MARGIN,
            top: GUIDE_MARGIN,
            width: 1.0 - 2.0 * GUIDE_MARGIN,
            height: 1.0 - 2.0 * GUIDE_MARGIN,
        }
    }
}

/// Size of the container the live frame is displayed in with "cover" scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayGeometry {
    pub container_width: f32,
    pub container_height: f32,
}

/// Decode an uploaded or captured image from bytes.
pub fn load_image(bytes: &[u8]) -> Result<DynamicImage, NormalizeError> {
    let image = image::load_from_memory(bytes)?;
    ensure_non_degenerate(&image)?;
    Ok(image)
}

fn ensure_non_degenerate(image: &DynamicImage) -> Result<(u32, u32), NormalizeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(NormalizeError::Degenerate { width, height });
    }
    Ok((width, height))
}

/// Crop a live frame to what the user saw inside the guide rectangle.
///
/// With `display` set, the frame is assumed to be shown with "cover" scaling
/// (scaled up until it fills the container, overflow cropped equally on both
/// sides), and that scaling is undone before mapping the guide to pixels.
/// Without it the guide maps directly onto the frame.
pub fn crop_to_guide(
    frame: &DynamicImage,
    guide: &GuideRect,
    display: Option<DisplayGeometry>,
) -> Result<DynamicImage, NormalizeError> {
    let (fw, fh) = ensure_non_degenerate(frame)?;
    let (fw_f, fh_f) = (fw as f32, fh as f32);

    let (cw, ch) = match display {
        Some(d) if d.container_width > 0.0 && d.container_height > 0.0 => {
            (d.container_width, d.container_height)
        }
        _ => (fw_f, fh_f),
    };

    let scale = (cw / fw_f).max(ch / fh_f);
    let offset_x = (cw - fw_f * scale) / 2.0;
    let offset_y = (ch - fh_f * scale) / 2.0;

    let x0 = ((guide.left * cw - offset_x) / scale).clamp(0.0, fw_f);
    let y0 = ((guide.top * ch - offset_y) / scale).clamp(0.0, fh_f);
    let x1 = (((guide.left + guide.width) * cw - offset_x) / scale).clamp(0.0, fw_f);
    let y1 = (((guide.top + guide.height) * ch - offset_y) / scale).clamp(0.0, fh_f);

    let (x, y) = (x0.round() as u32, y0.round() as u32);
    let width = (x1.round() as u32).saturating_sub(x);
    let height = (y1.round() as u32).saturating_sub(y);
    if width == 0 || height == 0 {
        return Err(NormalizeError::Degenerate { width, height });
    }

    tracing::debug!(x, y, width, height, "cropped live frame to guide");
    Ok(frame.crop_imm(x, y, width, height))
}

/// Crop an uploaded document photo toward the ID-1 aspect ratio.
///
/// The aspect crop is only applied when the source deviates from the card
/// ratio by more than 20%; the 5% edge trim is always applied.
pub fn crop_upload(image: &DynamicImage) -> Result<DynamicImage, NormalizeError> {
    let (w, h) = ensure_non_degenerate(image)?;
    let (wf, hf) = (w as f32, h as f32);
    let aspect = wf / hf;

    let (mut cw, mut ch) = (wf, hf);
    if (aspect / ID_CARD_ASPECT - 1.0).abs() > ASPECT_TOLERANCE {
        if aspect > ID_CARD_ASPECT {
            cw = hf * ID_CARD_ASPECT;
        } else {
            ch = wf / ID_CARD_ASPECT;
        }
    }

    let trim_x = cw * UPLOAD_EDGE_TRIM;
    let trim_y = ch * UPLOAD_EDGE_TRIM;
    let x = ((wf - cw) / 2.0 + trim_x).round() as u32;
    let y = ((hf - ch) / 2.0 + trim_y).round() as u32;
    let width = ((cw - 2.0 * trim_x).round() as u32).min(w.saturating_sub(x));
    let height = ((ch - 2.0 * trim_y).round() as u32).min(h.saturating_sub(y));
    if width == 0 || height == 0 {
        return Err(NormalizeError::Degenerate { width, height });
    }

    tracing::debug!(src_w = w, src_h = h, x, y, width, height, "cropped upload");
    Ok(image.crop_imm(x, y, width, height))
}

/// Prepare a document image for local OCR: grayscale, mild contrast
/// stretch, long edge upscaled to 1500 px.
pub fn preprocess_for_ocr(image: &DynamicImage) -> DynamicImage {
    let gray = image.to_luma8();
    let (w, h) = gray.dimensions();

    let mut stretched = GrayImage::new(w, h);
    for (x, y, Luma([p])) in gray.enumerate_pixels() {
        let v = (*p as f32 - 128.0) * OCR_CONTRAST + 128.0;
        stretched.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
    }

    let long_edge = w.max(h);
    let out = DynamicImage::ImageLuma8(stretched);
    if long_edge == 0 || long_edge >= OCR_LONG_EDGE {
        return out;
    }
    let factor = OCR_LONG_EDGE as f32 / long_edge as f32;
    let nw = (w as f32 * factor).round() as u32;
    let nh = (h as f32 * factor).round() as u32;
    out.resize_exact(nw, nh, FilterType::CatmullRom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
    }

    #[test]
    fn guide_without_display_maps_directly() {
        let frame = blank(1000, 500);
        let out = crop_to_guide(&frame, &GuideRect::default(), None).unwrap();
        assert_eq!(out.dimensions(), (840, 420));
    }

    #[test]
    fn guide_undoes_cover_scaling() {
        // 1000x500 frame shown in a 500x500 container: scale 1.0, 250 px
        // cropped off each side horizontally.
        let frame = blank(1000, 500);
        let display = DisplayGeometry {
            container_width: 500.0,
            container_height: 500.0,
        };
        let out = crop_to_guide(&frame, &GuideRect::default(), Some(display)).unwrap();
        assert_eq!(out.dimensions(), (420, 420));
    }

    #[test]
    fn guide_rejects_degenerate_frame() {
        let frame = blank(0, 10);
        let err = crop_to_guide(&frame, &GuideRect::default(), None).unwrap_err();
        assert!(matches!(err, NormalizeError::Degenerate { width: 0, .. }));
    }

    #[test]
    fn upload_near_card_ratio_only_trims_edges() {
        // 1600x1000 is within 20% of 1.586
        let out = crop_upload(&blank(1600, 1000)).unwrap();
        assert_eq!(out.dimensions(), (1440, 900));
    }

    #[test]
    fn upload_portrait_is_cropped_to_card_ratio() {
        let out = crop_upload(&blank(1000, 1500)).unwrap();
        let (w, h) = out.dimensions();
        let aspect = w as f32 / h as f32;
        assert!((aspect - ID_CARD_ASPECT).abs() < 0.02, "aspect = {aspect}");
        assert_eq!(w, 900);
    }

    #[test]
    fn upload_does_not_mutate_source() {
        let src = blank(1000, 1500);
        let _ = crop_upload(&src).unwrap();
        assert_eq!(src.dimensions(), (1000, 1500));
    }

    #[test]
    fn ocr_preprocess_upscales_and_grays() {
        let out = preprocess_for_ocr(&blank(750, 470));
        assert_eq!(out.dimensions(), (1500, 940));
        assert!(matches!(out, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn ocr_preprocess_stretches_contrast() {
        let mut img = GrayImage::new(2000, 10);
        img.put_pixel(0, 0, Luma([178]));
        let out = preprocess_for_ocr(&DynamicImage::ImageLuma8(img)).to_luma8();
        // 128 + 50 * 1.3 = 193
        assert_eq!(out.get_pixel(0, 0).0[0], 193);
        assert_eq!(out.get_pixel(1, 0).0[0], 0);
    }

    #[test]
    fn load_image_rejects_garbage() {
        assert!(matches!(
            load_image(b"not an image"),
            Err(NormalizeError::Decode(_))
        ));
    }
}
