//! Process-wide model pool.
//!
//! Handles are cached per `(model_path, device_id)` and shared by
//! reference; the pool never evicts on its own. `clear` is the only
//! teardown path and must not race with in-flight inference (caller
//! responsibility).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use once_cell::sync::Lazy;
use tracing::info;

use crate::backend::{self, ModelHandle};

pub struct ModelPool {
    cache: Mutex<HashMap<(String, i64), Arc<dyn ModelHandle>>>,
}

static POOL: Lazy<ModelPool> = Lazy::new(|| ModelPool {
    cache: Mutex::new(HashMap::new()),
});

impl ModelPool {
    pub fn global() -> &'static ModelPool {
        &POOL
    }

    /// Cached handle for the key, loading through the backend on a miss.
    pub fn get(&self, model_path: &str, device_id: i64) -> anyhow::Result<Arc<dyn ModelHandle>> {
        if model_path.is_empty() {
            bail!("model_path is empty");
        }
        let key = (model_path.to_string(), device_id);

        let mut cache = self.cache.lock().expect("model pool poisoned");
        if let Some(handle) = cache.get(&key) {
            return Ok(Arc::clone(handle));
        }

        let backend =
            backend::backend().context("no inference backend registered")?;
        let handle = backend
            .load_model(model_path, device_id)
            .with_context(|| format!("failed to load model: {model_path}"))?;
        info!(model_path, device_id, "model loaded into pool");
        cache.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("model pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut cache = self.cache.lock().expect("model pool poisoned");
        if !cache.is_empty() {
            info!(count = cache.len(), "clearing model pool");
        }
        cache.clear();
    }
}
