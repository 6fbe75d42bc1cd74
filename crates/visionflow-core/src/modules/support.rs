//! Helpers shared by module implementations: entry/image pairing keys and
//! lookup tables.

use std::collections::HashMap;

use crate::channel::{ModuleImage, ResultEntry};
use crate::transform::TransformationState;

/// Pairing key for a result entry or image: index, origin index, and the
/// transform fingerprint (identity states print as `T:null`).
pub fn pair_key(state: Option<&TransformationState>, index: i64, origin_index: i64) -> String {
    let sig = state
        .and_then(|s| s.signature())
        .unwrap_or_else(|| "T:null".to_string());
    format!("idx:{index}|org:{origin_index}|{sig}")
}

/// Lookup tables from an image list: by list position they were built
/// with, by origin index, and by transform signature.
pub struct ImageLookup<'a> {
    pub images: &'a [ModuleImage],
    by_origin: HashMap<i64, usize>,
    by_signature: HashMap<String, usize>,
}

impl<'a> ImageLookup<'a> {
    pub fn new(images: &'a [ModuleImage]) -> Self {
        let mut by_origin = HashMap::new();
        let mut by_signature = HashMap::new();
        for (i, im) in images.iter().enumerate() {
            by_origin.insert(im.original_index, i);
            if let Some(sig) = im.state.signature() {
                by_signature.insert(sig, i);
            }
        }
        ImageLookup {
            images,
            by_origin,
            by_signature,
        }
    }

    /// Resolves the image an entry refers to: a valid `index` first, then
    /// `origin_index`, then the transform signature.
    pub fn find(&self, entry: &ResultEntry) -> Option<usize> {
        let idx = entry.index;
        if idx >= 0 && (idx as usize) < self.images.len() {
            return Some(idx as usize);
        }
        if let Some(&i) = self.by_origin.get(&entry.origin_index) {
            return Some(i);
        }
        entry
            .transform_signature()
            .and_then(|sig| self.by_signature.get(&sig).copied())
    }

    pub fn by_origin(&self, origin_index: i64) -> Option<usize> {
        self.by_origin.get(&origin_index).copied()
    }

    pub fn by_signature(&self, sig: &str) -> Option<usize> {
        self.by_signature.get(sig).copied()
    }
}

/// Corners of a rotated box `[cx, cy, w, h, angle_rad]`, in drawing order.
pub fn rotated_corners(cx: f64, cy: f64, w: f64, h: f64, angle: f64) -> [(f64, f64); 4] {
    let (hw, hh) = (w.abs() / 2.0, h.abs() / 2.0);
    let (sin, cos) = angle.sin_cos();
    let offsets = [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)];
    offsets.map(|(dx, dy)| (cx + cos * dx - sin * dy, cy + sin * dx + cos * dy))
}

/// Corners of a detection bbox (rotated or axis-aligned) mapped through an
/// affine.
pub fn projected_corners(det: &crate::channel::Detection, m: [f64; 6]) -> Option<[(f64, f64); 4]> {
    use crate::transform::apply_2x3;
    if det.bbox.len() < 4 {
        return None;
    }
    let corners = if let Some(angle) = det.rotation_angle() {
        rotated_corners(det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3], angle)
    } else {
        let (x, y, w, h) = (det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3]);
        [(x, y), (x + w, y), (x + w, y + h), (x, y + h)]
    };
    Some(corners.map(|(x, y)| apply_2x3(m, x, y)))
}

/// AABB of a corner set as integer `(x, y, w, h)` with floor/ceil rounding.
pub fn corners_aabb(corners: &[(f64, f64); 4]) -> (i64, i64, i64, i64) {
    let mut min_x = corners[0].0;
    let mut min_y = corners[0].1;
    let mut max_x = corners[0].0;
    let mut max_y = corners[0].1;
    for &(x, y) in &corners[1..] {
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    (
        min_x.floor() as i64,
        min_y.floor() as i64,
        ((max_x - min_x).ceil() as i64).max(1),
        ((max_y - min_y).ceil() as i64).max(1),
    )
}

/// The inverse map of an entry's transform, identity when it has none.
pub fn entry_inverse(entry: &ResultEntry) -> [f64; 6] {
    entry
        .transform
        .as_ref()
        .map(|t| t.current_to_original())
        .unwrap_or(crate::transform::IDENTITY_2X3)
}

/// Replaces filesystem-hostile characters (`<>:"/\|?*` and spaces) so a
/// user-supplied name is usable as a file name.
pub fn safe_file_name(name: &str) -> String {
    if name.is_empty() {
        return "Unknown".to_string();
    }
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | ' ' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_file_name_replaces_reserved_chars() {
        assert_eq!(safe_file_name("a b/c:d"), "a_b_c_d");
        assert_eq!(safe_file_name(""), "Unknown");
    }
}
