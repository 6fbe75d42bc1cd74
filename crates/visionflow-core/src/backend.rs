//! The inference backend seam.
//!
//! The engine never loads or runs models itself; it talks to whatever
//! backend the host registered. The surface is deliberately small: load a
//! model, run one image, describe the handle. Everything crossing it is
//! UTF-8; if a backend needs another text encoding, the conversion lives
//! inside that backend, not in the engine.

use std::sync::{Arc, RwLock};

use image::{DynamicImage, GrayImage};
use once_cell::sync::Lazy;
use serde_json::Value;

/// One detection as the backend reports it: bitmap mask, current-frame
/// coordinates. Model modules convert the mask to RLE before it enters a
/// result list.
#[derive(Debug, Clone, Default)]
pub struct RawDetection {
    pub category_id: i64,
    pub category_name: String,
    pub score: f64,
    pub area: f64,
    pub bbox: Vec<f64>,
    pub with_bbox: bool,
    pub with_angle: bool,
    pub angle: f64,
    pub mask: Option<GrayImage>,
}

/// A loaded model. Documented thread-safe for inference; the engine adds no
/// synchronisation on top.
pub trait ModelHandle: Send + Sync {
    /// Runs one image. Recognised `params` keys: `threshold`,
    /// `iou_threshold`, `top_k`, `return_polygon`, `epsilon`,
    /// `batch_size`, `with_mask`.
    fn infer(&self, image: &DynamicImage, params: &Value) -> anyhow::Result<Vec<RawDetection>>;

    fn info(&self) -> Value {
        Value::Null
    }
}

pub trait InferBackend: Send + Sync {
    fn load_model(
        &self,
        model_path: &str,
        device_id: i64,
    ) -> anyhow::Result<Arc<dyn ModelHandle>>;

    /// Global release of every backend-side model.
    fn free_all(&self) {}
}

static BACKEND: Lazy<RwLock<Option<Arc<dyn InferBackend>>>> =
    Lazy::new(|| RwLock::new(None));

/// Registers the process-wide backend, replacing any previous one.
pub fn set_backend(backend: Arc<dyn InferBackend>) {
    *BACKEND.write().expect("backend slot poisoned") = Some(backend);
}

pub fn backend() -> Option<Arc<dyn InferBackend>> {
    BACKEND.read().expect("backend slot poisoned").clone()
}
