//! `model/*` nodes: fetch a shared handle from the model pool, run the
//! backend per image, and convert raw detections into result entries.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value};

use crate::backend::{ModelHandle, RawDetection};
use crate::channel::{Detection, ResultEntry, UNSET_ANGLE};
use crate::context::{keys, ExecutionContext};
use crate::json_util;
use crate::mask::MaskRle;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};
use crate::pool::ModelPool;

/// Inference parameters forwarded verbatim from node properties.
const PARAM_KEYS: [&str; 7] = [
    "threshold",
    "iou_threshold",
    "top_k",
    "return_polygon",
    "epsilon",
    "batch_size",
    "with_mask",
];

pub struct ModelModule {
    seed: NodeSeed,
    model_path: String,
    device_id: i64,
    /// cls/ocr force a full-frame bbox onto degenerate detections.
    full_frame_fallback: bool,
    handle: Option<Arc<dyn ModelHandle>>,
}

pub fn create_det(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ModelModule::new(seed, false))
}

pub fn create_cls(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ModelModule::new(seed, true))
}

pub fn create_ocr(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ModelModule::new(seed, true))
}

impl ModelModule {
    fn new(seed: NodeSeed, full_frame_fallback: bool) -> Self {
        let model_path = json_util::read_string(&seed.properties, "model_path", "");
        let device_id = json_util::read_i64(&seed.properties, "device_id", 0);
        ModelModule {
            seed,
            model_path,
            device_id,
            full_frame_fallback,
            handle: None,
        }
    }

    fn ensure_loaded(&mut self, ctx: &ExecutionContext) -> anyhow::Result<Arc<dyn ModelHandle>> {
        if let Some(handle) = &self.handle {
            return Ok(Arc::clone(handle));
        }
        let device_id = ctx.get_int(keys::DEVICE_ID, self.device_id);
        let handle = ModelPool::global()
            .get(&self.model_path, device_id)
            .with_context(|| format!("model node {}", self.seed.node_id))?;
        self.handle = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Keeps each property's JSON type; strings that spell a bool or a
    /// number are promoted so hand-edited graphs behave like typed ones.
    fn infer_params(&self) -> Value {
        let mut params = Map::new();
        let Some(props) = self.seed.properties.as_object() else {
            return Value::Null;
        };
        for key in PARAM_KEYS {
            let Some(v) = props.get(key) else { continue };
            let normalised = match v {
                Value::Null => continue,
                Value::String(s) => match s.as_str() {
                    "true" | "True" | "TRUE" => Value::Bool(true),
                    "false" | "False" | "FALSE" => Value::Bool(false),
                    other => match other.trim().parse::<f64>() {
                        Ok(n) => Value::from(n),
                        Err(_) => v.clone(),
                    },
                },
                other => other.clone(),
            };
            params.insert(key.to_string(), normalised);
        }
        if params.is_empty() {
            Value::Null
        } else {
            Value::Object(params)
        }
    }
}

fn convert_raw(raw: RawDetection) -> Detection {
    let with_mask = raw.mask.as_ref().is_some_and(|m| m.width() > 0);
    let mask_rle = if with_mask {
        raw.mask.as_ref().map(MaskRle::encode_gray)
    } else {
        None
    };
    Detection {
        category_id: raw.category_id,
        category_name: raw.category_name,
        score: raw.score,
        area: raw.area,
        bbox: raw.bbox,
        with_bbox: raw.with_bbox,
        with_mask,
        with_angle: raw.with_angle,
        angle: if raw.with_angle { raw.angle } else { UNSET_ANGLE },
        mask_rle,
    }
}

/// Any detection without a usable bbox gets the whole frame. Keeps
/// classification and OCR outputs addressable by downstream croppers.
fn force_full_frame_bbox(images: &[crate::channel::ModuleImage], results: &mut [ResultEntry]) {
    for (entry, image) in results.iter_mut().zip(images) {
        let iw = image.image.width().max(1) as f64;
        let ih = image.image.height().max(1) as f64;
        for det in &mut entry.sample_results {
            let valid_dims = det.bbox.len() >= 4
                && det.bbox[2].abs() > 0.0
                && det.bbox[3].abs() > 0.0;
            if !det.with_bbox || !valid_dims {
                det.bbox = vec![0.0, 0.0, iw, ih];
                det.with_bbox = true;
                det.with_angle = false;
                det.angle = UNSET_ANGLE;
            }
        }
    }
}

impl Module for ModelModule {
    fn load_model(&mut self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        self.ensure_loaded(ctx).map(|_| ())
    }

    fn process(
        &mut self,
        input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let handle = self.ensure_loaded(ctx)?;
        let params = self.infer_params();

        let mut images = Vec::new();
        let mut results = Vec::new();
        let mut out_index = 0i64;
        for wrap in input.images {
            if wrap.image.width() == 0 || wrap.image.height() == 0 {
                continue;
            }
            let raw = handle
                .infer(&wrap.image, &params)
                .with_context(|| format!("inference failed on node {}", self.seed.node_id))?;

            let entry = ResultEntry::local(
                out_index,
                wrap.original_index,
                Some(wrap.state.clone()),
                raw.into_iter().map(convert_raw).collect(),
            );
            images.push(wrap);
            results.push(entry);
            out_index += 1;
        }

        if self.full_frame_fallback {
            force_full_frame_bbox(&images, &mut results);
        }

        Ok(ModuleOutput::main(images, results))
    }
}
