//! Run-length mask codec.
//!
//! Masks travel through result lists as row-major boolean RLE: the first
//! run is always a zero-run, and runs alternate value from there. Any
//! non-zero source pixel counts as one.

use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaskRle {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub runs: Vec<u32>,
}

impl MaskRle {
    /// Encodes a bitmap. Multi-channel inputs are collapsed to luma first;
    /// binarisation is `pixel != 0`.
    pub fn encode(mask: &DynamicImage) -> MaskRle {
        let gray = match mask {
            DynamicImage::ImageLuma8(g) => g.clone(),
            other => other.to_luma8(),
        };
        Self::encode_gray(&gray)
    }

    pub fn encode_gray(mask: &GrayImage) -> MaskRle {
        let width = mask.width();
        let height = mask.height();
        if width == 0 || height == 0 {
            return MaskRle::default();
        }

        let mut runs = Vec::new();
        let mut current = 0u8;
        let mut count = 0u32;
        for px in mask.as_raw() {
            let bit = u8::from(*px != 0);
            if bit == current {
                count += 1;
            } else {
                runs.push(count);
                current = bit;
                count = 1;
            }
        }
        runs.push(count);

        MaskRle { width, height, runs }
    }

    /// Rebuilds the bitmap: one-runs become 255, zero-runs 0, clipped to
    /// `width * height` pixels. Zero-length runs only flip the value.
    pub fn decode(&self) -> Option<GrayImage> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        let total = self.width as usize * self.height as usize;
        let mut buf = vec![0u8; total];

        let mut idx = 0usize;
        let mut value = 0u8;
        for &count in &self.runs {
            if idx >= total {
                break;
            }
            let count = count as usize;
            if count == 0 {
                value ^= 1;
                continue;
            }
            let write = count.min(total - idx);
            if value == 1 {
                buf[idx..idx + write].fill(0xFF);
            }
            idx += write;
            value ^= 1;
        }

        GrayImage::from_raw(self.width, self.height, buf)
    }

    /// Non-zero pixel count: the sum of the odd-indexed (one-value) runs.
    pub fn area(&self) -> f64 {
        self.runs
            .iter()
            .skip(1)
            .step_by(2)
            .map(|&c| c as u64)
            .sum::<u64>() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}
