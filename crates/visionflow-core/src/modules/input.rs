//! Source modules: they ignore their inputs and seed the graph with
//! images and synthetic results.

use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use serde_json::Value;
use tracing::warn;

use crate::channel::{Detection, ModuleImage, ResultEntry, ScalarValue, UNSET_ANGLE};
use crate::context::{keys, ExecutionContext};
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};

/// Context keys probed for a host-selected image path, most specific
/// first.
const PATH_KEYS: [&str; 4] = [
    "frontend_selected_image_path",
    "selected_image_path",
    "img_path",
    keys::FRONTEND_IMAGE_PATH,
];

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn context_path(ctx: &ExecutionContext) -> Option<String> {
    PATH_KEYS
        .iter()
        .filter_map(|k| ctx.get_str(k))
        .find(|p| !p.is_empty())
}

fn root_entry(image: &ModuleImage, index: i64) -> ResultEntry {
    ResultEntry::local(index, image.original_index, Some(image.state.clone()), Vec::new())
}

/// input/image: emits the frontend bitmap when the context carries one,
/// otherwise loads the configured file list.
pub struct ImageInput {
    seed: NodeSeed,
}

pub fn create_image(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ImageInput { seed })
}

impl ImageInput {
    fn file_list(&self, ctx: &ExecutionContext) -> Vec<String> {
        if let Some(p) = context_path(ctx) {
            return vec![p];
        }
        let mut files = Vec::new();
        let path = json_util::read_string(&self.seed.properties, "path", "");
        if !path.is_empty() {
            files.push(path);
        }
        if let Some(arr) = self
            .seed
            .properties
            .get("paths")
            .and_then(Value::as_array)
        {
            files.extend(
                arr.iter()
                    .filter_map(json_util::as_string)
                    .filter(|s| !s.is_empty()),
            );
        }
        files
    }
}

impl Module for ImageInput {
    fn process(
        &mut self,
        _input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        if let Some(mat) = ctx.get_image(keys::FRONTEND_IMAGE_MAT) {
            if mat.width() > 0 && mat.height() > 0 {
                let wrap = ModuleImage::from_shared(mat, 0);
                let mut entry = root_entry(&wrap, 0);
                entry.filename = Some("frontend_mat".to_string());
                entry.filepath = Some(String::new());

                let mut out = ModuleOutput::main(vec![wrap], vec![entry]);
                out.scalars.insert(
                    "filename".to_string(),
                    ScalarValue::Str("frontend_mat".to_string()),
                );
                return Ok(out);
            }
        }

        let mut images = Vec::new();
        let mut results = Vec::new();
        let mut index = 0i64;
        for file in self.file_list(ctx) {
            let img = match image::open(&file) {
                Ok(img) => img,
                Err(e) => {
                    warn!(path = %file, error = %e, "skipping unreadable input image");
                    continue;
                }
            };
            let wrap = ModuleImage::root(img, index);
            let mut entry = root_entry(&wrap, index);
            entry.filename = Some(file_stem(&file));
            entry.filepath = Some(file.clone());
            images.push(wrap);
            results.push(entry);
            index += 1;
        }

        let mut out = ModuleOutput::main(images, results);
        if out.images.len() == 1 {
            if let Some(name) = out.results.first().and_then(|r| r.filename.clone()) {
                if !name.is_empty() {
                    out.scalars
                        .insert("filename".to_string(), ScalarValue::Str(name));
                }
            }
        }
        Ok(out)
    }
}

/// input/frontend_image: the host-supplied image only, with a file-path
/// fallback.
pub struct FrontendImageInput {
    seed: NodeSeed,
}

pub fn create_frontend_image(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(FrontendImageInput { seed })
}

impl Module for FrontendImageInput {
    fn process(
        &mut self,
        _input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        if let Some(mat) = ctx.get_image(keys::FRONTEND_IMAGE_MAT) {
            if mat.width() > 0 && mat.height() > 0 {
                let wrap = ModuleImage::from_shared(mat, 0);
                let mut entry = root_entry(&wrap, 0);
                entry.filename = Some("frontend_mat".to_string());
                return Ok(ModuleOutput::main(vec![wrap], vec![entry]));
            }
        }

        let mut path = json_util::read_string(&self.seed.properties, "path", "");
        if path.is_empty() {
            path = ctx.get_str(keys::FRONTEND_IMAGE_PATH).unwrap_or_default();
        }
        if path.is_empty() {
            return Ok(ModuleOutput::default());
        }
        let img = match image::open(&path) {
            Ok(img) => img,
            Err(e) => {
                warn!(path = %path, error = %e, "frontend image unreadable");
                return Ok(ModuleOutput::default());
            }
        };
        let wrap = ModuleImage::root(img, 0);
        let mut entry = root_entry(&wrap, 0);
        entry.filename = Some(path);
        Ok(ModuleOutput::main(vec![wrap], vec![entry]))
    }
}

/// input/build_results: synthesises one detection from properties, on the
/// incoming image, a configured file, or a solid-colour canvas.
pub struct BuildResultsInput {
    seed: NodeSeed,
}

pub fn create_build_results(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(BuildResultsInput { seed })
}

fn parse_color(spec: &str) -> Rgb<u8> {
    let parts: Vec<u8> = spec
        .split(',')
        .filter_map(|p| p.trim().parse::<u8>().ok())
        .collect();
    if parts.len() == 3 {
        Rgb([parts[0], parts[1], parts[2]])
    } else {
        Rgb([0, 255, 0])
    }
}

impl Module for BuildResultsInput {
    fn process(
        &mut self,
        input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;

        // 1. Pick the carrier image: main input > configured path > canvas.
        let mut used: Option<ModuleImage> = input
            .images
            .into_iter()
            .next()
            .filter(|im| im.image.width() > 0 && im.image.height() > 0);

        if used.is_none() {
            let mut image_path = json_util::read_string(props, "image_path", "");
            if image_path.is_empty() {
                image_path = context_path(ctx).unwrap_or_default();
            }
            if !image_path.is_empty() {
                match image::open(&image_path) {
                    Ok(img) => used = Some(ModuleImage::root(img, 0)),
                    Err(e) => {
                        warn!(path = %image_path, error = %e, "build_results image unreadable")
                    }
                }
            }
        }

        let used = used.unwrap_or_else(|| {
            let w = json_util::read_i64(props, "default_width", 640).max(1) as u32;
            let h = json_util::read_i64(props, "default_height", 640).max(1) as u32;
            let color =
                parse_color(&json_util::read_string(props, "default_color", "0,255,0"));
            ModuleImage::root(
                DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, color)),
                0,
            )
        });

        let (w, h) = (used.image.width() as f64, used.image.height() as f64);

        // 2. Region: XYWH properties win over the XYXY corner form.
        let mut x1 = json_util::read_f64(props, "bbox_x1", 100.0);
        let mut y1 = json_util::read_f64(props, "bbox_y1", 100.0);
        let mut x2 = json_util::read_f64(props, "bbox_x2", 300.0);
        let mut y2 = json_util::read_f64(props, "bbox_y2", 300.0);
        let bx = json_util::read_opt_f64(props, "bbox_x");
        let by = json_util::read_opt_f64(props, "bbox_y");
        let bw = json_util::read_opt_f64(props, "bbox_w");
        let bh = json_util::read_opt_f64(props, "bbox_h");
        if let (Some(bx), Some(by), Some(bw), Some(bh)) = (bx, by, bw, bh) {
            x1 = bx;
            y1 = by;
            x2 = bx + bw.abs();
            y2 = by + bh.abs();
        } else {
            if x2 < x1 {
                std::mem::swap(&mut x1, &mut x2);
            }
            if y2 < y1 {
                std::mem::swap(&mut y1, &mut y2);
            }
        }
        x1 = x1.clamp(0.0, w);
        y1 = y1.clamp(0.0, h);
        x2 = x2.clamp(0.0, w);
        y2 = y2.clamp(0.0, h);

        let det = Detection {
            category_id: json_util::read_i64(props, "category_id", 0),
            category_name: json_util::read_string(props, "category_name", "sample"),
            score: json_util::read_f64(props, "score", 0.95),
            bbox: vec![x1, y1, (x2 - x1).max(1.0), (y2 - y1).max(1.0)],
            with_bbox: true,
            with_angle: false,
            angle: UNSET_ANGLE,
            ..Default::default()
        };

        let mut entry = ResultEntry::local(
            0,
            used.original_index,
            Some(used.state.clone()),
            vec![det],
        );
        entry.originating_module = Some("input/build_results".to_string());

        Ok(ModuleOutput::main(vec![used], vec![entry]))
    }
}

