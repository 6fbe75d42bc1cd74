//! One-shot facade: load a pipeline (bare JSON or packaged archive), then
//! run images through it.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use serde_json::Value;
use tempfile::TempDir;
use tracing::info;

use crate::context::{keys, ExecutionContext};
use crate::error::Error;
use crate::executor::{GraphExecutor, LoadReport};
use crate::package;
use crate::pool::ModelPool;

pub struct PipelineModel {
    nodes: Vec<Value>,
    root: Value,
    report: LoadReport,
    loaded: bool,
    /// Clears the model pool on drop. Once models were pre-loaded there
    /// may be backend resources to release even if some nodes failed.
    owns_models: bool,
    device_id: i64,
    /// Unpacked package contents; models read from here, so the directory
    /// must outlive them. Released first on drop.
    unpack_dir: Option<TempDir>,
}

impl PipelineModel {
    /// Loads a pipeline file and pre-loads its models. The file may be a
    /// bare graph JSON or a pipeline package (sniffed by magic).
    pub fn load_file(path: &Path, device_id: i64) -> Result<PipelineModel, Error> {
        if package::is_package_file(path) {
            let unpacked = package::unpack_to_temp(path)?;
            Self::load_root(unpacked.pipeline_root, device_id, Some(unpacked.dir))
        } else {
            let text = fs::read_to_string(path)?;
            let root: Value = serde_json::from_str(&text)
                .map_err(|e| Error::Graph(format!("pipeline file is not valid JSON: {e}")))?;
            Self::load_root(root, device_id, None)
        }
    }

    /// Loads from an already-parsed graph root.
    pub fn load_root(
        root: Value,
        device_id: i64,
        unpack_dir: Option<TempDir>,
    ) -> Result<PipelineModel, Error> {
        if !root.is_object() {
            return Err(Error::Graph("graph root is not an object".to_string()));
        }
        let nodes: Vec<Value> = root
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Graph("graph is missing the nodes array".to_string()))?
            .iter()
            .filter(|n| n.is_object())
            .cloned()
            .collect();

        let executor = GraphExecutor::new(&nodes);
        let mut ctx = ExecutionContext::new();
        ctx.set_int(keys::DEVICE_ID, device_id);
        let mut report = executor.load_models(&mut ctx);
        if !report.is_ok() {
            // surface the first failing node directly
            let failure = report.first_failure_message().map(str::to_string);
            if let Some(msg) = failure {
                report.message = msg;
            }
        }
        info!(code = report.code, models = report.models.len(), "pipeline loaded");

        Ok(PipelineModel {
            nodes,
            loaded: report.is_ok(),
            report,
            root,
            owns_models: true,
            device_id,
            unpack_dir,
        })
    }

    /// The pre-load report. `code != 0` means the graph will not run.
    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The graph root as loaded (with package paths rewritten).
    pub fn model_info(&self) -> Result<&Value, Error> {
        if !self.loaded {
            return Err(Error::NotLoaded);
        }
        Ok(&self.root)
    }

    pub fn unpack_dir(&self) -> Option<&Path> {
        self.unpack_dir.as_ref().map(TempDir::path)
    }

    /// Runs one image through the graph and returns its detections in
    /// original-image coordinates.
    pub fn infer_one(&self, image: &DynamicImage) -> Result<Vec<Value>, Error> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::ImageEmpty);
        }
        let mut batch = self.infer_batch(std::slice::from_ref(image))?;
        Ok(batch.pop().unwrap_or_default())
    }

    /// Runs a batch, one graph execution per image. Empty images yield an
    /// empty result list; earlier images keep their results if a later one
    /// fails.
    pub fn infer_batch(&self, images: &[DynamicImage]) -> Result<Vec<Vec<Value>>, Error> {
        if !self.loaded {
            return Err(Error::NotLoaded);
        }
        if images.is_empty() {
            return Err(Error::ImageEmpty);
        }

        let executor = GraphExecutor::new(&self.nodes);
        let mut merged = Vec::with_capacity(images.len());
        for image in images {
            if image.width() == 0 || image.height() == 0 {
                merged.push(Vec::new());
                continue;
            }

            let mut ctx = ExecutionContext::new();
            ctx.set_image(keys::FRONTEND_IMAGE_MAT, Arc::new(image.clone()));
            ctx.set_str(keys::FRONTEND_IMAGE_PATH, "");
            ctx.set_int(keys::DEVICE_ID, self.device_id);

            executor.run(&mut ctx)?;
            merged.push(Self::collect_payload(&ctx));
        }
        Ok(merged)
    }

    /// Flattens `frontend_json.last.by_image[*].results`.
    fn collect_payload(ctx: &ExecutionContext) -> Vec<Value> {
        let mut out = Vec::new();
        let Some(last) = ctx
            .get_json(keys::FRONTEND_JSON)
            .and_then(|v| v.get("last"))
        else {
            return out;
        };
        let Some(by_image) = last.get("by_image").and_then(Value::as_array) else {
            return out;
        };
        for item in by_image {
            match item.get("results") {
                Some(Value::Array(results)) => out.extend(results.iter().cloned()),
                Some(Value::Null) | None => {}
                Some(other) => out.push(other.clone()),
            }
        }
        out
    }

    /// Average wall-clock milliseconds per run.
    pub fn benchmark(
        &self,
        image: &DynamicImage,
        warmup: usize,
        runs: usize,
    ) -> Result<f64, Error> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::ImageEmpty);
        }
        let runs = runs.max(1);
        for _ in 0..warmup {
            self.infer_one(image)?;
        }
        let start = Instant::now();
        for _ in 0..runs {
            self.infer_one(image)?;
        }
        Ok(start.elapsed().as_secs_f64() * 1000.0 / runs as f64)
    }
}

impl Drop for PipelineModel {
    fn drop(&mut self) {
        // Order matters: the unpack directory goes first, then the model
        // handles it was backing.
        drop(self.unpack_dir.take());
        if self.owns_models {
            ModelPool::global().clear();
        }
    }
}
