//! Wire types flowing between graph nodes: images with geometric state,
//! result entries, detections, and scalar port values.

use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mask::MaskRle;
use crate::transform::TransformationState;

/// Sentinel for "no rotation angle set".
pub const UNSET_ANGLE: f64 = -100.0;

/// An image inside a graph run: the current bitmap, the bitmap that entered
/// the graph (shared between all children of one input), and the affine
/// state connecting them.
#[derive(Debug, Clone)]
pub struct ModuleImage {
    pub image: DynamicImage,
    pub original: Arc<DynamicImage>,
    pub state: TransformationState,
    pub original_index: i64,
}

impl ModuleImage {
    /// Wraps a graph input: identity state, the image is its own original.
    pub fn root(image: DynamicImage, original_index: i64) -> Self {
        let state =
            TransformationState::new(image.width() as i64, image.height() as i64);
        let original = Arc::new(image.clone());
        ModuleImage {
            image,
            original,
            state,
            original_index,
        }
    }

    /// Wraps a graph input that is already shared, avoiding a second copy
    /// of the original bitmap.
    pub fn from_shared(image: Arc<DynamicImage>, original_index: i64) -> Self {
        let state =
            TransformationState::new(image.width() as i64, image.height() as i64);
        ModuleImage {
            image: (*image).clone(),
            original: image,
            state,
            original_index,
        }
    }

    /// Wraps a re-framed image, keeping the parent's original.
    pub fn derived(
        image: DynamicImage,
        parent: &ModuleImage,
        state: TransformationState,
    ) -> Self {
        ModuleImage {
            image,
            original: Arc::clone(&parent.original),
            state,
            original_index: parent.original_index,
        }
    }

    /// Parent state, healed to the current frame size when the input never
    /// carried one (a bare image injected straight into the graph).
    pub fn effective_state(&self) -> TransformationState {
        if self.state.original_width > 0 && self.state.original_height > 0 {
            self.state.clone()
        } else {
            TransformationState::new(self.image.width() as i64, self.image.height() as i64)
        }
    }

    /// Per-image signature used to check that two lanes describe the same
    /// image list.
    pub fn lane_signature(&self) -> String {
        let t = serde_json::to_value(&self.state)
            .map(|v| v.to_string())
            .unwrap_or_default();
        format!("module|{}|{}", self.original_index, t)
    }
}

/// One detection, in the current-image coordinate frame of its entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub category_id: i64,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub area: f64,
    /// `[x, y, w, h]` axis-aligned or `[cx, cy, w, h, angle_rad]` rotated.
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub with_bbox: bool,
    #[serde(default)]
    pub with_mask: bool,
    #[serde(default)]
    pub with_angle: bool,
    #[serde(default = "unset_angle")]
    pub angle: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_rle: Option<MaskRle>,
}

fn unset_angle() -> f64 {
    UNSET_ANGLE
}

impl Default for Detection {
    fn default() -> Self {
        Detection {
            category_id: 0,
            category_name: String::new(),
            score: 0.0,
            area: 0.0,
            bbox: Vec::new(),
            with_bbox: false,
            with_mask: false,
            with_angle: false,
            angle: UNSET_ANGLE,
            mask_rle: None,
        }
    }
}

impl Detection {
    /// Rotated when the bbox has 5 elements, or the angle flag carries a
    /// real value.
    pub fn is_rotated(&self) -> bool {
        self.bbox.len() >= 5 || (self.with_angle && self.angle > -99.0)
    }

    /// The rotation angle, preferring the 5th bbox element.
    pub fn rotation_angle(&self) -> Option<f64> {
        if self.bbox.len() >= 5 {
            return Some(self.bbox[4]);
        }
        if self.with_angle && self.angle > -99.0 {
            return Some(self.angle);
        }
        None
    }
}

/// Grid placement metadata attached by the sliding-window tiler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidingMeta {
    pub grid_x: i64,
    pub grid_y: i64,
    pub grid_size: [i64; 2],
    pub win_size: [i64; 2],
    pub slice_index: [i64; 2],
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

/// One element of a result list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    #[serde(rename = "type", default = "local_type")]
    pub entry_type: String,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub origin_index: i64,
    /// `None` serialises as null: the entry is already in original space.
    #[serde(default)]
    pub transform: Option<TransformationState>,
    #[serde(default)]
    pub sample_results: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliding_meta: Option<SlidingMeta>,
}

fn local_type() -> String {
    "local".to_string()
}

impl ResultEntry {
    pub fn local(
        index: i64,
        origin_index: i64,
        transform: Option<TransformationState>,
        sample_results: Vec<Detection>,
    ) -> Self {
        ResultEntry {
            entry_type: local_type(),
            index,
            origin_index,
            transform,
            sample_results,
            filename: None,
            filepath: None,
            originating_module: None,
            sliding_meta: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.entry_type == "local"
    }

    /// Signature of the carried transform, when it has one.
    pub fn transform_signature(&self) -> Option<String> {
        self.transform.as_ref().and_then(|t| t.signature())
    }
}

/// A `(images, results, templates)` triple. Templates stay opaque JSON.
#[derive(Debug, Clone, Default)]
pub struct ModuleChannel {
    pub images: Vec<ModuleImage>,
    pub results: Vec<ResultEntry>,
    pub templates: Vec<Value>,
}

impl ModuleChannel {
    pub fn new(
        images: Vec<ModuleImage>,
        results: Vec<ResultEntry>,
        templates: Vec<Value>,
    ) -> Self {
        ModuleChannel {
            images,
            results,
            templates,
        }
    }
}

/// Scalar port value. A single discriminator covers every scalar kind; the
/// executor normalises outgoing values to the declared port type.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Json(Value),
}

impl ScalarValue {
    pub fn coerce_bool(&self) -> bool {
        match self {
            ScalarValue::Bool(b) => *b,
            ScalarValue::Int(i) => *i != 0,
            ScalarValue::Str(s) => s == "true" || s == "1",
            ScalarValue::Json(v) => match v {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
                Value::String(s) => s == "true" || s == "1",
                _ => false,
            },
        }
    }

    pub fn coerce_i64(&self) -> i64 {
        match self {
            ScalarValue::Bool(b) => i64::from(*b),
            ScalarValue::Int(i) => *i,
            ScalarValue::Str(s) => s.trim().parse().unwrap_or(0),
            ScalarValue::Json(v) => crate::json_util::as_i64(v).unwrap_or(0),
        }
    }

    pub fn coerce_string(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Str(s) => s.clone(),
            ScalarValue::Json(v) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ScalarValue::Bool(b) => Value::Bool(*b),
            ScalarValue::Int(i) => Value::from(*i),
            ScalarValue::Str(s) => Value::from(s.clone()),
            ScalarValue::Json(v) => v.clone(),
        }
    }
}
