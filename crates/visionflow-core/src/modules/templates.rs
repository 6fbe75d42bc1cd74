//! OCR template capture, persistence, and matching.
//!
//! Templates are opaque JSON on their own channel; the contract between
//! these modules is the `OCRResults` item list in original-frame
//! coordinates.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::context::{keys, ExecutionContext};
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};
use crate::modules::support::{corners_aabb, entry_inverse, projected_corners, safe_file_name};

/// OCR comparison normalisation: drop whitespace, merge easily-confused
/// glyphs, uppercase.
fn normalize_text(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            'l' | '1' => 'I',
            'o' | 'O' => '0',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// features/template_from_results: captures the incoming OCR detections
/// as a template, projected to original coordinates.
pub struct TemplateFromResults {
    seed: NodeSeed,
}

pub fn create_template_from_results(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(TemplateFromResults { seed })
}

impl Module for TemplateFromResults {
    fn process(
        &mut self,
        input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let product_name = json_util::read_string(props, "product_name", "");
        let mut product_id = json_util::read_string(props, "product_id", "");
        let template_name = json_util::read_string(props, "template_name", &product_name);

        if let Some(barcode) = ctx.get_str(keys::BARCODE_TEXT) {
            if !barcode.is_empty() {
                product_id = barcode;
            }
        }
        let camera_position = ctx
            .get_str(keys::FACE)
            .and_then(|f| f.chars().next())
            .map(|c| match c.to_ascii_uppercase() {
                'B' => 1,
                'C' => 2,
                'D' => 3,
                _ => 0,
            })
            .unwrap_or(0);

        let mut ocr_items = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for entry in &input.results {
            if !entry.is_local() {
                continue;
            }
            let inv = entry_inverse(entry);
            for det in &entry.sample_results {
                if det.category_name.is_empty() {
                    continue;
                }
                let Some(corners) = projected_corners(det, inv) else {
                    continue;
                };
                let (x, y, w, h) = corners_aabb(&corners);
                let key = format!(
                    "{}|{x},{y},{w},{h}",
                    normalize_text(&det.category_name)
                );
                if !seen.insert(key) {
                    continue;
                }
                ocr_items.push(json!({
                    "text": det.category_name,
                    "confidence": det.score,
                    "x": x,
                    "y": y,
                    "width": w,
                    "height": h,
                }));
            }
        }

        let base_name = if template_name.is_empty() {
            if product_name.is_empty() {
                "Template".to_string()
            } else {
                product_name.clone()
            }
        } else {
            template_name.clone()
        };

        let template = json!({
            "template_name": template_name,
            "product_name": product_name,
            "product_id": product_id,
            "camera_position": camera_position,
            "OCRResults": ocr_items,
            "template_id": safe_file_name(&base_name),
        });

        let mut out = ModuleOutput::main(input.images, input.results);
        out.templates = vec![template];
        Ok(out)
    }
}

/// features/template_save: writes `{name}.json` (and `{name}.png` of the
/// first image) under the configured templates directory.
pub struct TemplateSave {
    seed: NodeSeed,
}

pub fn create_template_save(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(TemplateSave { seed })
}

impl Module for TemplateSave {
    fn process(
        &mut self,
        input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let Some(template) = input.templates.first().filter(|t| t.is_object()) else {
            return Ok(ModuleOutput::main(input.images, Vec::new()));
        };
        let mut template = template.clone();

        let dir = ctx
            .get_str(keys::TEMPLATES_DIR)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| "templates".to_string());
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir, error = %e, "failed to create templates directory");
        }

        let mut file_name = json_util::read_string(&self.seed.properties, "file_name", "");
        if file_name.is_empty() {
            file_name = template
                .get("template_id")
                .and_then(Value::as_str)
                .unwrap_or("Template")
                .to_string();
        }
        let file_name = safe_file_name(&file_name);

        let json_path = Path::new(&dir).join(format!("{file_name}.json"));
        let png_path = Path::new(&dir).join(format!("{file_name}.png"));

        if let Some(first) = input.images.first() {
            if first.image.width() > 0 {
                match first.image.save(&png_path) {
                    Ok(()) => {
                        if let Some(obj) = template.as_object_mut() {
                            obj.insert(
                                "image_path".to_string(),
                                Value::from(format!("{file_name}.png")),
                            );
                        }
                    }
                    Err(e) => warn!(path = %png_path.display(), error = %e, "template image not saved"),
                }
            }
        }

        let text = serde_json::to_string_pretty(&template).unwrap_or_default();
        if let Err(e) = fs::write(&json_path, text) {
            warn!(path = %json_path.display(), error = %e, "template json not saved");
        }

        Ok(ModuleOutput::default())
    }
}

/// features/template_load: parses a JSON template file onto the template
/// channel.
pub struct TemplateLoad {
    seed: NodeSeed,
}

pub fn create_template_load(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(TemplateLoad { seed })
}

impl Module for TemplateLoad {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let path = json_util::read_string(&self.seed.properties, "path", "");
        let mut out = ModuleOutput::main(input.images, input.results);
        if path.is_empty() {
            return Ok(out);
        }
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(template) => out.templates = vec![template],
                Err(e) => warn!(path = %path, error = %e, "template file is not valid JSON"),
            },
            Err(e) => warn!(path = %path, error = %e, "template file unreadable"),
        }
        Ok(out)
    }
}

/// features/template_match: compares the main-lane template against the
/// golden template on extra input 0 by normalised text and centre
/// distance.
pub struct TemplateMatch {
    seed: NodeSeed,
}

pub fn create_template_match(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(TemplateMatch { seed })
}

fn ocr_items(template: &Value) -> Vec<&Map<String, Value>> {
    template
        .get("OCRResults")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn item_f64(item: &Map<String, Value>, key: &str) -> f64 {
    item.get(key).and_then(json_util::as_f64).unwrap_or(0.0)
}

fn item_center(item: &Map<String, Value>) -> (f64, f64) {
    (
        item_f64(item, "x") + item_f64(item, "width") / 2.0,
        item_f64(item, "y") + item_f64(item, "height") / 2.0,
    )
}

impl Module for TemplateMatch {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let Some(to_check) = input.templates.first().filter(|t| t.is_object()) else {
            return Ok(ModuleOutput::default());
        };
        let golden = input
            .extra
            .first()
            .and_then(|ch| ch.templates.first())
            .filter(|t| t.is_object());
        let Some(golden) = golden else {
            return Ok(ModuleOutput::default());
        };

        let props = &self.seed.properties;
        let tol_x = json_util::read_f64(props, "position_tolerance_x", 20.0);
        let tol_y = json_util::read_f64(props, "position_tolerance_y", 20.0);
        let min_confidence = json_util::read_f64(props, "min_confidence_threshold", 0.5);
        let check_position = json_util::read_bool(props, "check_position", true);
        let distance_limit = (tol_x * tol_x + tol_y * tol_y).sqrt();

        let template_items = ocr_items(golden);
        let detected_items: Vec<&Map<String, Value>> = ocr_items(to_check)
            .into_iter()
            .filter(|item| {
                item_f64(item, "confidence") >= min_confidence
                    && item_f64(item, "width") > 0.0
                    && item_f64(item, "height") > 0.0
            })
            .collect();

        let mut used = vec![false; detected_items.len()];
        let mut matched = 0usize;
        for tpl_item in &template_items {
            let tpl_text =
                normalize_text(tpl_item.get("text").and_then(Value::as_str).unwrap_or(""));
            let (tcx, tcy) = item_center(tpl_item);
            for (di, det_item) in detected_items.iter().enumerate() {
                if used[di] {
                    continue;
                }
                let det_text = normalize_text(
                    det_item.get("text").and_then(Value::as_str).unwrap_or(""),
                );
                if tpl_text != det_text {
                    continue;
                }
                if check_position {
                    let (dcx, dcy) = item_center(det_item);
                    let dist = ((tcx - dcx).powi(2) + (tcy - dcy).powi(2)).sqrt();
                    if dist > distance_limit {
                        continue;
                    }
                }
                used[di] = true;
                matched += 1;
                break;
            }
        }

        let total_template = template_items.len();
        let used_count = used.iter().filter(|u| **u).count();
        let missed = total_template - matched;
        let over = detected_items.len() - used_count;
        let ok = missed == 0 && over == 0;
        let score = if total_template > 0 {
            matched as f64 / total_template as f64
        } else {
            1.0
        };

        let detail = json!({
            "is_match": ok,
            "score": score,
            "matched": matched,
            "missed": missed,
            "over": over,
            "total_template": total_template,
            "total_detection": detected_items.len(),
        });

        let mut out = ModuleOutput::default();
        out.scalars
            .insert("ok".to_string(), crate::channel::ScalarValue::Bool(ok));
        out.scalars.insert(
            "detail".to_string(),
            crate::channel::ScalarValue::Str(detail.to_string()),
        );
        Ok(out)
    }
}
