//! Terminal modules: image sinks, box overlays, and the JSON emitter that
//! projects detections back to original coordinates.

use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::channel::{Detection, ModuleImage};
use crate::context::{keys, ExecutionContext};
use crate::imgops;
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};
use crate::modules::support::rotated_corners;
use crate::transform::{apply_2x3, TransformationState, IDENTITY_2X3};

/// output/save_image: writes each image as `{base}{suffix}.{format}`,
/// `base` being the aligned entry's filename or a timestamp.
pub struct SaveImage {
    seed: NodeSeed,
}

pub fn create_save_image(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(SaveImage { seed })
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

impl Module for SaveImage {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let save_dir = json_util::read_string(props, "save_path", "");
        let suffix = json_util::read_string(props, "suffix", "_out");
        let format = {
            let f = json_util::read_string(props, "format", "png");
            if f.is_empty() {
                "png".to_string()
            } else {
                f
            }
        };

        if !save_dir.is_empty() {
            if let Err(e) = fs::create_dir_all(&save_dir) {
                warn!(dir = %save_dir, error = %e, "failed to create save directory");
            }

            for (i, wrap) in input.images.iter().enumerate() {
                if wrap.image.width() == 0 {
                    continue;
                }
                let base = input
                    .results
                    .get(i)
                    .and_then(|r| r.filename.as_deref())
                    .map(file_stem)
                    .filter(|b| !b.is_empty())
                    .unwrap_or_else(|| {
                        chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
                    });
                let path: PathBuf =
                    Path::new(&save_dir).join(format!("{base}{suffix}.{format}"));

                // 1- and 4-channel images are normalised to 3-channel first.
                let rgb = imgops::ensure_rgb8(&wrap.image);
                if let Err(e) = DynamicImage::ImageRgb8(rgb).save(&path) {
                    warn!(path = %path.display(), error = %e, "image not saved");
                }
            }
        }

        Ok(ModuleOutput::passthrough(input))
    }
}

/// output/preview: pass-through; the host taps this node's public output.
pub struct Preview;

pub fn create_preview(_seed: NodeSeed) -> Box<dyn Module> {
    Box::new(Preview)
}

impl Module for Preview {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        Ok(ModuleOutput::passthrough(input))
    }
}

/// Rotated `[cx, cy, w, h, angle]` through an affine: centre maps through
/// the full transform, width/height scale by the transformed axis norms,
/// and the new angle follows the transformed x axis.
fn rbox_through(m: [f64; 6], bbox: &[f64]) -> Vec<f64> {
    let (cx, cy, w, h, angle) = (bbox[0], bbox[1], bbox[2], bbox[3], bbox[4]);
    let (ncx, ncy) = apply_2x3(m, cx, cy);

    let (sin, cos) = angle.sin_cos();
    let (ux, uy) = (cos, sin);
    let (vx, vy) = (-sin, cos);
    let tux = (m[0] * ux + m[1] * uy, m[3] * ux + m[4] * uy);
    let tvx = (m[0] * vx + m[1] * vy, m[3] * vx + m[4] * vy);
    let scale_w = (tux.0 * tux.0 + tux.1 * tux.1).sqrt();
    let scale_h = (tvx.0 * tvx.0 + tvx.1 * tvx.1).sqrt();
    let new_angle = tux.1.atan2(tux.0);

    vec![ncx, ncy, w * scale_w, h * scale_h, new_angle]
}

/// output/return_json: builds the per-original payload with all
/// coordinates re-projected to the original frame, and stores it in the
/// execution context.
pub struct ReturnJson {
    seed: NodeSeed,
}

pub fn create_return_json(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ReturnJson { seed })
}

fn projected_detection(det: &Detection, to_original: [f64; 6]) -> Value {
    let mut item = Map::new();
    item.insert("category_id".to_string(), Value::from(det.category_id));
    item.insert(
        "category_name".to_string(),
        Value::from(det.category_name.clone()),
    );
    item.insert("score".to_string(), Value::from(det.score));

    if det.bbox.len() == 5 {
        item.insert("bbox".to_string(), json!(rbox_through(to_original, &det.bbox)));
        item.insert("metadata".to_string(), json!({ "is_rotated": true }));
    } else if det.bbox.len() >= 4 {
        let (x, y, w, h) = (det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3]);
        let corners = [
            apply_2x3(to_original, x, y),
            apply_2x3(to_original, x + w, y),
            apply_2x3(to_original, x + w, y + h),
            apply_2x3(to_original, x, y + h),
        ];
        let (mut min_x, mut min_y, mut max_x, mut max_y) =
            (corners[0].0, corners[0].1, corners[0].0, corners[0].1);
        for &(px, py) in &corners[1..] {
            min_x = min_x.min(px);
            min_y = min_y.min(py);
            max_x = max_x.max(px);
            max_y = max_y.max(py);
        }
        // XYXY, snapped outward
        item.insert(
            "bbox".to_string(),
            json!([
                min_x.floor() as i64,
                min_y.floor() as i64,
                max_x.ceil() as i64,
                max_y.ceil() as i64,
            ]),
        );
        item.insert("metadata".to_string(), json!({ "is_rotated": false }));
    }

    if let Some(rle) = &det.mask_rle {
        item.insert("mask_rle".to_string(), json!(rle));
        if let Some(mask) = rle.decode() {
            let (x0, y0) = if det.bbox.len() >= 2 {
                (det.bbox[0], det.bbox[1])
            } else {
                (0.0, 0.0)
            };
            let points: Vec<Value> = imgops::find_nonzero(&mask)
                .into_iter()
                .map(|(px, py)| {
                    let (gx, gy) =
                        apply_2x3(to_original, x0 + px as f64, y0 + py as f64);
                    json!([gx, gy])
                })
                .collect();
            if !points.is_empty() {
                item.insert("poly".to_string(), json!([points]));
            }
        }
    }

    Value::Object(item)
}

impl Module for ReturnJson {
    fn process(
        &mut self,
        input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        // 1. Gather detections by entry index, origin index, and transform
        // signature; the image walk below probes in that order.
        let mut by_index: std::collections::HashMap<i64, Vec<&Detection>> = Default::default();
        let mut by_origin: std::collections::HashMap<i64, Vec<&Detection>> = Default::default();
        let mut by_signature: std::collections::HashMap<String, Vec<&Detection>> =
            Default::default();

        for entry in &input.results {
            if !entry.is_local() {
                continue;
            }
            let dets: Vec<&Detection> = entry.sample_results.iter().collect();
            if entry.index >= 0 {
                by_index.entry(entry.index).or_default().extend(dets.iter());
            }
            if entry.origin_index >= 0 {
                by_origin
                    .entry(entry.origin_index)
                    .or_default()
                    .extend(dets.iter());
            }
            if let Some(sig) = entry.transform_signature() {
                by_signature.entry(sig).or_default().extend(dets.iter());
            }
        }

        // 2. Walk the images and project everything back to the original.
        let mut by_image = Vec::new();
        for (i, wrap) in input.images.iter().enumerate() {
            let original = &wrap.original;
            let (w0, h0) = (original.width() as i64, original.height() as i64);

            let dets = by_index
                .get(&(i as i64))
                .or_else(|| by_origin.get(&wrap.original_index))
                .or_else(|| {
                    wrap.state
                        .signature()
                        .and_then(|sig| by_signature.get(&sig))
                });

            let mut results = Vec::new();
            if let Some(dets) = dets {
                let to_original = wrap.state.current_to_original();
                for det in dets {
                    results.push(projected_detection(det, to_original));
                }
            }

            by_image.push(json!({
                "origin_index": wrap.original_index,
                "original_size": [w0, h0],
                "results": results,
            }));
        }

        let payload = json!({ "by_image": by_image });

        // 3. Publish: the latest payload plus the per-node history.
        let mut frontend = ctx
            .get_json(keys::FRONTEND_JSON)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));
        let mut by_node = ctx
            .get_json(keys::FRONTEND_JSON_BY_NODE)
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| json!({}));

        by_node[self.seed.node_id.to_string()] = payload.clone();
        frontend["last"] = payload;
        frontend["by_node"] = by_node.clone();
        ctx.set_json(keys::FRONTEND_JSON_BY_NODE, by_node);
        ctx.set_json(keys::FRONTEND_JSON, frontend);

        info!(node_id = self.seed.node_id, images = input.images.len(), "payload published");
        Ok(ModuleOutput::passthrough(input))
    }
}

fn read_color(props: &Value, key: &str, default: Rgb<u8>) -> Rgb<u8> {
    let Some(arr) = props.get(key).and_then(Value::as_array) else {
        return default;
    };
    if arr.len() < 3 {
        return default;
    }
    let chan = |i: usize| {
        json_util::as_i64(&arr[i])
            .map(|v| v.clamp(0, 255) as u8)
            .unwrap_or(0)
    };
    Rgb([chan(0), chan(1), chan(2)])
}

fn draw_closed_polyline(canvas: &mut RgbImage, pts: &[(f64, f64)], color: Rgb<u8>) {
    for i in 0..pts.len() {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        draw_line_segment_mut(
            canvas,
            (a.0 as f32, a.1 as f32),
            (b.0 as f32, b.1 as f32),
            color,
        );
    }
}

fn det_corners_in(det: &Detection, inv: [f64; 6]) -> Option<Vec<(f64, f64)>> {
    if det.bbox.len() < 4 {
        return None;
    }
    let corners: Vec<(f64, f64)> = if let Some(angle) = det.rotation_angle() {
        rotated_corners(det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3], angle).to_vec()
    } else {
        let (x, y, w, h) = (det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3]);
        vec![(x, y), (x + w, y), (x + w, y + h), (x, y + h)]
    };
    Some(corners.into_iter().map(|(x, y)| apply_2x3(inv, x, y)).collect())
}

/// output/visualize: draws every entry's boxes back onto a per-origin
/// canvas (the original image, or black when `black_background`).
pub struct Visualize {
    seed: NodeSeed,
}

pub fn create_visualize(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(Visualize { seed })
}

impl Module for Visualize {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let black_bg = json_util::read_bool(props, "black_background", false);
        let display_bbox = json_util::read_bool(props, "display_bbox", true);
        let color_axis = read_color(props, "bbox_color", Rgb([0, 255, 0]));
        let color_rot = read_color(props, "bbox_color_rot", Rgb([255, 128, 0]));

        // One canvas per origin, from the largest original seen for it.
        let mut canvases: std::collections::BTreeMap<i64, RgbImage> = Default::default();
        let mut areas: std::collections::BTreeMap<i64, u64> = Default::default();
        for wrap in &input.images {
            let origin = wrap.original_index;
            let base = &wrap.original;
            if base.width() == 0 {
                continue;
            }
            let area = u64::from(base.width()) * u64::from(base.height());
            if areas.get(&origin).map_or(true, |&a| area > a) {
                areas.insert(origin, area);
                let canvas = if black_bg {
                    RgbImage::new(base.width(), base.height())
                } else {
                    base.to_rgb8()
                };
                canvases.insert(origin, canvas);
            }
        }

        if display_bbox {
            for entry in &input.results {
                let origin = entry.origin_index;
                let Some(canvas) = canvases.get_mut(&origin) else {
                    continue;
                };
                let inv = entry
                    .transform
                    .as_ref()
                    .map(|t| t.current_to_original())
                    .unwrap_or(IDENTITY_2X3);
                for det in &entry.sample_results {
                    let Some(pts) = det_corners_in(det, inv) else { continue };
                    let color = if det.is_rotated() { color_rot } else { color_axis };
                    draw_closed_polyline(canvas, &pts, color);
                }
            }
        }

        let mut out_images = Vec::new();
        for (origin, canvas) in canvases {
            let image = DynamicImage::ImageRgb8(canvas);
            let state =
                TransformationState::new(image.width() as i64, image.height() as i64);
            let original = std::sync::Arc::new(image.clone());
            out_images.push(ModuleImage {
                image,
                original,
                state,
                original_index: origin,
            });
        }

        Ok(ModuleOutput::main(out_images, input.results))
    }
}

/// output/visualize_local: draws each entry's boxes on its own
/// current-frame image.
pub struct VisualizeLocal {
    seed: NodeSeed,
}

pub fn create_visualize_local(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(VisualizeLocal { seed })
}

impl Module for VisualizeLocal {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let color = read_color(&self.seed.properties, "bbox_color", Rgb([0, 255, 0]));

        let mut out_images = Vec::new();
        for (i, wrap) in input.images.iter().enumerate() {
            if wrap.image.width() == 0 {
                continue;
            }
            let mut canvas = wrap.image.to_rgb8();
            for entry in &input.results {
                if !entry.is_local() || entry.index != i as i64 {
                    continue;
                }
                for det in &entry.sample_results {
                    if det.bbox.len() < 4 {
                        continue;
                    }
                    let (x, y, w, h) = (det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3]);
                    let pts = [(x, y), (x + w, y), (x + w, y + h), (x, y + h)];
                    draw_closed_polyline(&mut canvas, &pts, color);
                }
            }
            out_images.push(ModuleImage::derived(
                DynamicImage::ImageRgb8(canvas),
                wrap,
                wrap.state.clone(),
            ));
        }

        Ok(ModuleOutput::main(out_images, input.results))
    }
}
