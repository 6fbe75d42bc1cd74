//! Execution context: a typed key/value bag shared across one graph run.

use std::collections::HashMap;
use std::sync::Arc;

use image::DynamicImage;
use serde_json::Value;

/// Well-known context keys.
pub mod keys {
    pub const FRONTEND_IMAGE_MAT: &str = "frontend_image_mat";
    pub const FRONTEND_IMAGE_PATH: &str = "frontend_image_path";
    pub const DEVICE_ID: &str = "device_id";
    pub const BARCODE_TEXT: &str = "barcode_text";
    pub const FACE: &str = "face";
    pub const TEMPLATES_DIR: &str = "templates_dir";
    pub const FRONTEND_JSON: &str = "frontend_json";
    pub const FRONTEND_JSON_BY_NODE: &str = "frontend_json_by_node";
}

#[derive(Debug, Clone)]
pub enum ContextValue {
    Image(Arc<DynamicImage>),
    Str(String),
    Int(i64),
    Json(Value),
}

/// Type-mismatched reads return the caller's default instead of failing, so
/// modules stay tolerant of whatever the host put in the bag.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    map: HashMap<String, ContextValue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.map.remove(key);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn set_image(&mut self, key: &str, image: Arc<DynamicImage>) {
        self.map.insert(key.to_string(), ContextValue::Image(image));
    }

    pub fn get_image(&self, key: &str) -> Option<Arc<DynamicImage>> {
        match self.map.get(key) {
            Some(ContextValue::Image(img)) => Some(Arc::clone(img)),
            _ => None,
        }
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.map
            .insert(key.to_string(), ContextValue::Str(value.into()));
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.map.get(key) {
            Some(ContextValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.map.insert(key.to_string(), ContextValue::Int(value));
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.map.get(key) {
            Some(ContextValue::Int(i)) => *i,
            _ => default,
        }
    }

    pub fn set_json(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_string(), ContextValue::Json(value));
    }

    pub fn get_json(&self, key: &str) -> Option<&Value> {
        match self.map.get(key) {
            Some(ContextValue::Json(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_type_reads_as_absent() {
        let mut ctx = ExecutionContext::new();
        ctx.set_str("k", "v");
        assert_eq!(ctx.get_int("k", 7), 7);
        assert_eq!(ctx.get_str("k").as_deref(), Some("v"));
        assert!(ctx.get_image("k").is_none());
    }
}
