//! Pixel conversion to BGR, preview box drawing and snapshot export.

use facegate_core::{BoundingBox, Frame};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPEG decode failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("MJPEG frame is {actual_w}x{actual_h}, negotiated {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// Convert packed YUYV (4:2:2) to BGR using BT.601 studio-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected {
        return Err(ConvertError::InvalidLength {
            format: "YUYV",
            expected,
            actual: yuyv.len(),
        });
    }

    let mut bgr = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        bgr.extend_from_slice(&yuv_to_bgr(y0, u, v));
        bgr.extend_from_slice(&yuv_to_bgr(y1, u, v));
    }
    Ok(bgr)
}

fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    let r = clamp(298 * c + 409 * e);
    let g = clamp(298 * c - 100 * d - 208 * e);
    let b = clamp(298 * c + 516 * d);
    [b, g, r]
}

/// Replicate an 8-bit grayscale buffer into three BGR channels.
pub fn grey_to_bgr(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = width as usize * height as usize;
    if gray.len() < pixels {
        return Err(ConvertError::InvalidLength {
            format: "GREY",
            expected: pixels,
            actual: gray.len(),
        });
    }
    Ok(gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect())
}

/// Decode one MJPEG frame to BGR.
pub fn mjpeg_to_bgr(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let rgb = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)?.to_rgb8();
    if rgb.width() != width || rgb.height() != height {
        return Err(ConvertError::SizeMismatch {
            width,
            height,
            actual_w: rgb.width(),
            actual_h: rgb.height(),
        });
    }
    Ok(rgb.pixels().flat_map(|p| [p[2], p[1], p[0]]).collect())
}

/// Draw a rectangle outline of the given BGR colour, clipped to the frame.
pub fn draw_box(frame: &mut Frame, bbox: &BoundingBox, color: [u8; 3], thickness: u32) {
    let (w, h) = (frame.width, frame.height);
    let x2 = bbox.x2.min(w);
    let y2 = bbox.y2.min(h);
    if bbox.x1 >= x2 || bbox.y1 >= y2 {
        return;
    }

    let mut put = |x: u32, y: u32| {
        let idx = (y as usize * w as usize + x as usize) * 3;
        frame.data[idx..idx + 3].copy_from_slice(&color);
    };

    for t in 0..thickness {
        let top = bbox.y1 + t;
        let bottom = y2.saturating_sub(1 + t);
        let left = bbox.x1 + t;
        let right = x2.saturating_sub(1 + t);
        if top > bottom || left > right {
            break;
        }
        for x in left..=right {
            put(x, top);
            put(x, bottom);
        }
        for y in top..=bottom {
            put(left, y);
            put(right, y);
        }
    }
}

/// Write the frame as an image file; the format follows the extension.
pub fn save_snapshot(frame: &Frame, path: &Path) -> Result<(), image::ImageError> {
    frame.to_rgb_image().save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_black_and_white() {
        // [Y0=16 (black), U=128, Y1=235 (white), V=128]
        let bgr = yuyv_to_bgr(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(bgr, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_chroma_goes_to_right_channels() {
        // Strong V (red difference) with neutral U: R must dominate, B stay low.
        let bgr = yuyv_to_bgr(&[82, 90, 82, 240], 2, 1).unwrap();
        let (b, g, r) = (bgr[0], bgr[1], bgr[2]);
        assert!(r > 200, "r = {r}");
        assert!(g < 60, "g = {g}");
        assert!(b < 80, "b = {b}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_bgr(&[100, 128], 2, 1),
            Err(ConvertError::InvalidLength { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn test_yuyv_output_size() {
        let yuyv: Vec<u8> = (0..16).collect();
        let bgr = yuyv_to_bgr(&yuyv, 4, 2).unwrap();
        assert_eq!(bgr.len(), 4 * 2 * 3);
    }

    #[test]
    fn test_grey_to_bgr() {
        assert_eq!(grey_to_bgr(&[7, 200], 2, 1).unwrap(), vec![7, 7, 7, 200, 200, 200]);
        assert!(grey_to_bgr(&[7], 2, 1).is_err());
    }

    #[test]
    fn test_mjpeg_round_trip_dimensions() {
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([10, 200, 30]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let bgr = mjpeg_to_bgr(&jpeg, 8, 4).unwrap();
        assert_eq!(bgr.len(), 8 * 4 * 3);
        // Green dominates in channel 1 after lossy decode.
        assert!(bgr[1] > 150);
        assert!(matches!(
            mjpeg_to_bgr(&jpeg, 16, 16),
            Err(ConvertError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_draw_box_outline_only() {
        let mut frame = Frame::from_bgr(vec![0u8; 10 * 10 * 3], 10, 10).unwrap();
        let bbox = BoundingBox { x1: 2, y1: 2, x2: 8, y2: 8 };
        draw_box(&mut frame, &bbox, [1, 2, 3], 1);
        let px = |x: usize, y: usize| &frame.data[(y * 10 + x) * 3..(y * 10 + x) * 3 + 3];
        assert_eq!(px(2, 2), [1, 2, 3]);
        assert_eq!(px(7, 7), [1, 2, 3]);
        assert_eq!(px(5, 2), [1, 2, 3]);
        assert_eq!(px(5, 5), [0, 0, 0]);
        assert_eq!(px(1, 1), [0, 0, 0]);
    }

    #[test]
    fn test_draw_box_clips_to_frame() {
        let mut frame = Frame::from_bgr(vec![0u8; 4 * 4 * 3], 4, 4).unwrap();
        let bbox = BoundingBox { x1: 1, y1: 1, x2: 40, y2: 40 };
        draw_box(&mut frame, &bbox, [9, 9, 9], 3);
        assert_eq!(&frame.data[(3 * 4 + 3) * 3..(3 * 4 + 3) * 3 + 3], [9, 9, 9]);
    }
}
