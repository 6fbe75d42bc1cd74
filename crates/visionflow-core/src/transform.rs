//! Geometric state of an image inside a graph run.
//!
//! Every image carries the 2×3 affine map `original -> current`. Modules
//! that re-frame an image (crop, flip, rotate, sliding window) derive a
//! child state by composing their own `current -> new` map onto it, so the
//! terminal emitter can always invert back to original coordinates.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::json_util;

pub const IDENTITY_2X3: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformationState {
    pub original_width: i64,
    pub original_height: i64,
    /// `[x, y, w, h]` when the pipeline carries an authored crop region.
    pub crop_box: Option<[i64; 4]>,
    /// `original -> current`; `None` means identity (this is an original).
    pub affine_2x3: Option<[f64; 6]>,
    pub output_size: Option<[i64; 2]>,
}

impl TransformationState {
    pub fn new(original_width: i64, original_height: i64) -> Self {
        TransformationState {
            original_width,
            original_height,
            ..Default::default()
        }
    }

    /// Identity state: the image is an original.
    pub fn is_identity(&self) -> bool {
        self.affine_2x3.is_none()
    }

    pub fn affine(&self) -> [f64; 6] {
        self.affine_2x3.unwrap_or(IDENTITY_2X3)
    }

    /// Composes `current -> new` onto this state: the child's matrix is
    /// `currentToNew · originalToCurrent`, the original size and crop box
    /// are preserved, and the output size is the new frame size.
    pub fn derive_child(
        &self,
        current_to_new: [f64; 6],
        new_width: i64,
        new_height: i64,
    ) -> TransformationState {
        let composed = to_2x3(mul_3x3(to_3x3(current_to_new), to_3x3(self.affine())));
        TransformationState {
            original_width: self.original_width,
            original_height: self.original_height,
            crop_box: self.crop_box,
            affine_2x3: Some(composed),
            output_size: Some([new_width, new_height]),
        }
    }

    /// `current -> original`, the inverse of the carried map.
    pub fn current_to_original(&self) -> [f64; 6] {
        inverse_2x3(self.affine())
    }

    /// Compact fingerprint of the affine, used to pair result entries with
    /// the image that produced them. Identity states have no signature.
    pub fn signature(&self) -> Option<String> {
        self.affine_2x3.map(|a| {
            format!(
                "T:{:.4},{:.4},{:.2},{:.4},{:.4},{:.2}",
                a[0], a[1], a[2], a[3], a[4], a[5]
            )
        })
    }

    /// Tolerant read: malformed fields are treated as absent.
    pub fn from_value(v: &Value) -> TransformationState {
        let mut st = TransformationState::default();
        let Some(obj) = v.as_object() else {
            return st;
        };
        st.original_width = obj
            .get("original_width")
            .and_then(json_util::as_i64)
            .unwrap_or(0);
        st.original_height = obj
            .get("original_height")
            .and_then(json_util::as_i64)
            .unwrap_or(0);
        if let Some(arr) = obj.get("crop_box").and_then(Value::as_array) {
            if arr.len() >= 4 {
                let vals: Vec<i64> =
                    arr.iter().take(4).filter_map(json_util::as_i64).collect();
                if vals.len() == 4 {
                    st.crop_box = Some([vals[0], vals[1], vals[2], vals[3]]);
                }
            }
        }
        if let Some(arr) = obj.get("affine_2x3").and_then(Value::as_array) {
            if arr.len() >= 6 {
                let vals: Vec<f64> =
                    arr.iter().take(6).filter_map(json_util::as_f64).collect();
                if vals.len() == 6 {
                    st.affine_2x3 =
                        Some([vals[0], vals[1], vals[2], vals[3], vals[4], vals[5]]);
                }
            }
        }
        if let Some(arr) = obj.get("output_size").and_then(Value::as_array) {
            if arr.len() >= 2 {
                match (json_util::as_i64(&arr[0]), json_util::as_i64(&arr[1])) {
                    (Some(w), Some(h)) => st.output_size = Some([w, h]),
                    _ => {}
                }
            }
        }
        st
    }
}

impl Serialize for TransformationState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = 2;
        fields += usize::from(self.crop_box.is_some());
        fields += usize::from(self.affine_2x3.is_some());
        fields += usize::from(self.output_size.is_some());

        let mut s = serializer.serialize_struct("TransformationState", fields)?;
        s.serialize_field("original_width", &self.original_width)?;
        s.serialize_field("original_height", &self.original_height)?;
        if let Some(cb) = &self.crop_box {
            s.serialize_field("crop_box", cb)?;
        }
        if let Some(a) = &self.affine_2x3 {
            s.serialize_field("affine_2x3", a)?;
        }
        if let Some(os) = &self.output_size {
            s.serialize_field("output_size", os)?;
        }
        s.end()
    }
}

impl<'de> Deserialize<'de> for TransformationState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Ok(TransformationState::from_value(&v))
    }
}

pub fn to_3x3(a: [f64; 6]) -> [f64; 9] {
    [a[0], a[1], a[2], a[3], a[4], a[5], 0.0, 0.0, 1.0]
}

pub fn to_2x3(a: [f64; 9]) -> [f64; 6] {
    [a[0], a[1], a[2], a[3], a[4], a[5]]
}

pub fn mul_3x3(a: [f64; 9], b: [f64; 9]) -> [f64; 9] {
    let mut c = [0.0; 9];
    for r in 0..3 {
        for col in 0..3 {
            c[r * 3 + col] = a[r * 3] * b[col]
                + a[r * 3 + 1] * b[3 + col]
                + a[r * 3 + 2] * b[6 + col];
        }
    }
    c
}

/// Inverse of a 2×3 affine. Near-singular matrices (|det| < 1e-12) return
/// identity; modules guard against ever producing one.
pub fn inverse_2x3(m: [f64; 6]) -> [f64; 6] {
    let (a, b, tx, c, d, ty) = (m[0], m[1], m[2], m[3], m[4], m[5]);
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return IDENTITY_2X3;
    }
    let inv = 1.0 / det;
    let (ia, ib, ic, id) = (d * inv, -b * inv, -c * inv, a * inv);
    [ia, ib, -(ia * tx + ib * ty), ic, id, -(ic * tx + id * ty)]
}

pub fn apply_2x3(m: [f64; 6], x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Axis-aligned `[x, y, w, h]` box mapped through `m` and re-boxed to the
/// AABB of its four transformed corners. Width and height floor at 1.
pub fn transform_aabb(m: [f64; 6], x: f64, y: f64, w: f64, h: f64) -> [f64; 4] {
    let corners = [
        apply_2x3(m, x, y),
        apply_2x3(m, x + w, y),
        apply_2x3(m, x + w, y + h),
        apply_2x3(m, x, y + h),
    ];
    let mut min_x = corners[0].0;
    let mut min_y = corners[0].1;
    let mut max_x = corners[0].0;
    let mut max_y = corners[0].1;
    for &(px, py) in &corners[1..] {
        min_x = min_x.min(px);
        min_y = min_y.min(py);
        max_x = max_x.max(px);
        max_y = max_y.max(py);
    }
    [min_x, min_y, (max_x - min_x).max(1.0), (max_y - min_y).max(1.0)]
}

/// Wraps an angle into `[-pi, pi)`.
pub fn wrap_angle(a: f64) -> f64 {
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut x = (a + std::f64::consts::PI) % two_pi;
    if x < 0.0 {
        x += two_pi;
    }
    x - std::f64::consts::PI
}
