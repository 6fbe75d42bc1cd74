#![allow(dead_code)]

//! Shared test fixtures: a fake inference backend and graph-JSON builders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use image::{DynamicImage, Rgb, RgbImage};
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use visionflow_core::backend::{self, InferBackend, ModelHandle, RawDetection};
use visionflow_core::channel::UNSET_ANGLE;

/// Backend whose models replay a canned detection list per inference.
pub struct FakeBackend {
    models: Mutex<HashMap<String, Vec<RawDetection>>>,
}

struct FakeHandle {
    detections: Vec<RawDetection>,
}

impl ModelHandle for FakeHandle {
    fn infer(&self, _image: &DynamicImage, _params: &Value) -> anyhow::Result<Vec<RawDetection>> {
        Ok(self.detections.clone())
    }

    fn info(&self) -> Value {
        json!({ "fake": true })
    }
}

impl InferBackend for FakeBackend {
    fn load_model(&self, model_path: &str, _device_id: i64) -> anyhow::Result<Arc<dyn ModelHandle>> {
        let models = self.models.lock().unwrap();
        // "*" accepts any model path that exists on disk, for package
        // tests whose unpacked files get random names.
        let detections = models
            .get(model_path)
            .or_else(|| {
                models
                    .get("*")
                    .filter(|_| std::path::Path::new(model_path).exists())
            })
            .ok_or_else(|| anyhow::anyhow!("model file not found: {model_path}"))?
            .clone();
        Ok(Arc::new(FakeHandle { detections }))
    }
}

static FAKE: Lazy<Arc<FakeBackend>> = Lazy::new(|| {
    Arc::new(FakeBackend {
        models: Mutex::new(HashMap::new()),
    })
});

/// Registers the given `(model_path, detections)` pairs with the shared
/// fake backend. Entries accumulate: tests run in parallel within one
/// binary, so use unique model paths per test.
pub fn install_backend(models: &[(&str, Vec<RawDetection>)]) {
    {
        let mut map = FAKE.models.lock().unwrap();
        for (path, dets) in models {
            map.insert(path.to_string(), dets.clone());
        }
    }
    backend::set_backend(Arc::clone(&*FAKE) as Arc<dyn InferBackend>);
}

pub fn raw_det(name: &str, score: f64, bbox: &[f64]) -> RawDetection {
    let with_angle = bbox.len() >= 5;
    RawDetection {
        category_id: 0,
        category_name: name.to_string(),
        score,
        area: 0.0,
        bbox: bbox.to_vec(),
        with_bbox: true,
        with_angle,
        angle: if with_angle { bbox[4] } else { UNSET_ANGLE },
        mask: None,
    }
}

pub fn rgb_image(w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 31])
    }))
}

pub fn in_port(name: &str, kind: &str, link: Option<i64>) -> Value {
    match link {
        Some(link) => json!({ "name": name, "type": kind, "link": link }),
        None => json!({ "name": name, "type": kind }),
    }
}

pub fn out_port(name: &str, kind: &str, links: &[i64]) -> Value {
    json!({ "name": name, "type": kind, "links": links })
}

pub fn node(
    id: i64,
    node_type: &str,
    order: i64,
    properties: Value,
    inputs: Vec<Value>,
    outputs: Vec<Value>,
) -> Value {
    json!({
        "id": id,
        "type": node_type,
        "title": format!("{node_type}#{id}"),
        "order": order,
        "properties": properties,
        "inputs": inputs,
        "outputs": outputs,
    })
}
