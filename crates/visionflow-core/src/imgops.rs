//! Bitmap helpers shared by the re-framing modules: crops, affine warps,
//! exact quarter rotations, and mask utilities.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, Rgba};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;

use crate::transform::IDENTITY_2X3;

/// Crops `[x, y, w, h]` out of the image, preserving the channel layout.
/// The rectangle must already be clamped to the frame.
pub fn crop(src: &DynamicImage, x: u32, y: u32, w: u32, h: u32) -> DynamicImage {
    match src {
        DynamicImage::ImageLuma8(b) => {
            DynamicImage::ImageLuma8(imageops::crop_imm(b, x, y, w, h).to_image())
        }
        DynamicImage::ImageRgba8(b) => {
            DynamicImage::ImageRgba8(imageops::crop_imm(b, x, y, w, h).to_image())
        }
        other => {
            let rgb = other.to_rgb8();
            DynamicImage::ImageRgb8(imageops::crop_imm(&rgb, x, y, w, h).to_image())
        }
    }
}

/// Warps through the forward map `current -> new` (2×3) into a canvas of
/// `out_w` × `out_h`, bilinear, `fill` outside the source. Returns `None`
/// for a non-invertible matrix so callers can fall back to pass-through.
pub fn warp_affine(
    src: &DynamicImage,
    m: [f64; 6],
    out_w: u32,
    out_h: u32,
    fill: u8,
) -> Option<DynamicImage> {
    if out_w == 0 || out_h == 0 {
        return None;
    }
    let projection = Projection::from_matrix([
        m[0] as f32,
        m[1] as f32,
        m[2] as f32,
        m[3] as f32,
        m[4] as f32,
        m[5] as f32,
        0.0,
        0.0,
        1.0,
    ])?;

    let out = match src {
        DynamicImage::ImageLuma8(b) => {
            let mut canvas = image::ImageBuffer::from_pixel(out_w, out_h, Luma([fill]));
            warp_into(b, &projection, Interpolation::Bilinear, Luma([fill]), &mut canvas);
            DynamicImage::ImageLuma8(canvas)
        }
        DynamicImage::ImageRgba8(b) => {
            let px = Rgba([fill, fill, fill, 255]);
            let mut canvas = image::ImageBuffer::from_pixel(out_w, out_h, px);
            warp_into(b, &projection, Interpolation::Bilinear, px, &mut canvas);
            DynamicImage::ImageRgba8(canvas)
        }
        other => {
            let rgb = other.to_rgb8();
            let px = Rgb([fill, fill, fill]);
            let mut canvas = image::ImageBuffer::from_pixel(out_w, out_h, px);
            warp_into(&rgb, &projection, Interpolation::Bilinear, px, &mut canvas);
            DynamicImage::ImageRgb8(canvas)
        }
    };
    Some(out)
}

/// Exact horizontal / vertical flip together with its affine.
pub fn flip(src: &DynamicImage, vertical: bool) -> (DynamicImage, [f64; 6]) {
    let (w, h) = (src.width() as f64, src.height() as f64);
    if vertical {
        (src.flipv(), [1.0, 0.0, 0.0, 0.0, -1.0, h - 1.0])
    } else {
        (src.fliph(), [-1.0, 0.0, w - 1.0, 0.0, 1.0, 0.0])
    }
}

/// The affine for an exact counter-clockwise quarter rotation, plus the new
/// frame size. `k` is in multiples of 90 degrees.
pub fn quarter_rotation_affine(k: i64, w: u32, h: u32) -> ([f64; 6], u32, u32) {
    let (wf, hf) = (w as f64, h as f64);
    match k.rem_euclid(4) {
        1 => ([0.0, 1.0, 0.0, -1.0, 0.0, wf - 1.0], h, w),
        2 => ([-1.0, 0.0, wf - 1.0, 0.0, -1.0, hf - 1.0], w, h),
        3 => ([0.0, -1.0, hf - 1.0, 1.0, 0.0, 0.0], h, w),
        _ => (IDENTITY_2X3, w, h),
    }
}

/// Rotates the bitmap by an exact counter-clockwise quarter turn.
pub fn rotate_quarter(src: &DynamicImage, k: i64) -> DynamicImage {
    // image's rotate* are clockwise, so CCW 90 is rotate270.
    match k.rem_euclid(4) {
        1 => src.rotate270(),
        2 => src.rotate180(),
        3 => src.rotate90(),
        _ => src.clone(),
    }
}

/// The 2×3 of a rotation by `angle_deg` (counter-clockwise in image
/// coordinates) about `(cx, cy)` at unit scale.
pub fn rotation_about(cx: f64, cy: f64, angle_deg: f64) -> [f64; 6] {
    let theta = angle_deg.to_radians();
    let alpha = theta.cos();
    let beta = theta.sin();
    [
        alpha,
        beta,
        (1.0 - alpha) * cx - beta * cy,
        -beta,
        alpha,
        beta * cx + (1.0 - alpha) * cy,
    ]
}

/// Coordinates of every non-zero pixel in raster order.
pub fn find_nonzero(mask: &GrayImage) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    for (x, y, px) in mask.enumerate_pixels() {
        if px[0] != 0 {
            out.push((x, y));
        }
    }
    out
}

/// Nearest-neighbour resize, the only filter that keeps a mask binary.
pub fn resize_mask(mask: &GrayImage, w: u32, h: u32) -> GrayImage {
    if mask.width() == w && mask.height() == h {
        mask.clone()
    } else {
        imageops::resize(mask, w, h, FilterType::Nearest)
    }
}

/// Minimum-area rotated rectangle over a point set:
/// `(cx, cy, w, h, angle_rad)` with the angle along the first edge.
pub fn min_area_rotated_rect(points: &[(u32, u32)]) -> Option<(f64, f64, f64, f64, f64)> {
    if points.is_empty() {
        return None;
    }
    let pts: Vec<Point<i32>> = points
        .iter()
        .map(|&(x, y)| Point::new(x as i32, y as i32))
        .collect();
    let corners = min_area_rect(&pts);

    let c: Vec<(f64, f64)> = corners
        .iter()
        .map(|p| (p.x as f64, p.y as f64))
        .collect();
    let cx = (c[0].0 + c[1].0 + c[2].0 + c[3].0) / 4.0;
    let cy = (c[0].1 + c[1].1 + c[2].1 + c[3].1) / 4.0;
    let (e0x, e0y) = (c[1].0 - c[0].0, c[1].1 - c[0].1);
    let (e1x, e1y) = (c[2].0 - c[1].0, c[2].1 - c[1].1);
    let w = (e0x * e0x + e0y * e0y).sqrt();
    let h = (e1x * e1x + e1y * e1y).sqrt();
    let angle = e0y.atan2(e0x);
    Some((cx, cy, w, h, angle))
}

/// Normalises 1- and 4-channel images to 3-channel before encoding.
pub fn ensure_rgb8(src: &DynamicImage) -> image::RgbImage {
    src.to_rgb8()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::apply_2x3;
    use image::RgbImage;

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([x as u8, y as u8, 7])
        }))
    }

    #[test]
    fn quarter_rotation_matches_affine() {
        let img = gradient(4, 3);
        for k in 0..4 {
            let (m, nw, nh) = quarter_rotation_affine(k, 4, 3);
            let rotated = rotate_quarter(&img, k);
            assert_eq!((rotated.width(), rotated.height()), (nw, nh));
            // every source pixel lands where the affine says it does
            for y in 0..3u32 {
                for x in 0..4u32 {
                    let (nx, ny) = apply_2x3(m, x as f64, y as f64);
                    assert_eq!(
                        rotated.to_rgb8().get_pixel(nx as u32, ny as u32),
                        img.to_rgb8().get_pixel(x, y)
                    );
                }
            }
        }
    }

    #[test]
    fn flip_twice_is_identity() {
        let img = gradient(5, 4);
        let (once, _) = flip(&img, false);
        let (twice, _) = flip(&once, false);
        assert_eq!(img.to_rgb8().as_raw(), twice.to_rgb8().as_raw());
    }

    #[test]
    fn warp_translation_moves_content() {
        let img = gradient(6, 6);
        let out = warp_affine(&img, [1.0, 0.0, -2.0, 0.0, 1.0, -1.0], 4, 5, 0).unwrap();
        assert_eq!(out.to_rgb8().get_pixel(0, 0), img.to_rgb8().get_pixel(2, 1));
    }

    #[test]
    fn min_area_rect_of_axis_block() {
        let pts: Vec<(u32, u32)> = (0..4).flat_map(|y| (0..10).map(move |x| (x, y))).collect();
        let (_, _, w, h, _) = min_area_rotated_rect(&pts).unwrap();
        let (long, short) = if w >= h { (w, h) } else { (h, w) };
        assert!((long - 9.0).abs() < 1e-6);
        assert!((short - 3.0).abs() < 1e-6);
    }
}
