//! Region-of-interest filtering and stroke sampling.

use std::collections::{BTreeMap, HashMap};

use image::GrayImage;

use crate::channel::{Detection, ModuleChannel, ResultEntry, ScalarValue, UNSET_ANGLE};
use crate::context::ExecutionContext;
use crate::imgops;
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};

/// Integer rectangle clamped into a `W`×`H` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

impl Rect {
    fn clamped(x: i64, y: i64, w: i64, h: i64, frame_w: i64, frame_h: i64) -> Option<Rect> {
        if frame_w <= 0 || frame_h <= 0 {
            return None;
        }
        let x0 = x.clamp(0, frame_w);
        let y0 = y.clamp(0, frame_h);
        let x1 = (x + w).clamp(x0, frame_w);
        let y1 = (y + h).clamp(y0, frame_h);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect {
            x: x0,
            y: y0,
            w: x1 - x0,
            h: y1 - y0,
        })
    }

    fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.w).min(other.x + other.w);
        let y1 = (self.y + self.h).min(other.y + other.h);
        if x1 <= x0 || y1 <= y0 {
            None
        } else {
            Some(Rect {
                x: x0,
                y: y0,
                w: x1 - x0,
                h: y1 - y0,
            })
        }
    }
}

/// post_process/result_filter_region: a detection is inside the ROI when
/// its bbox intersects it and, if it carries a mask, the mask has a
/// non-zero pixel within the intersection.
pub struct ResultFilterRegion {
    seed: NodeSeed,
}

pub fn create_result_filter_region(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ResultFilterRegion { seed })
}

fn mask_hits_roi(rle: &crate::mask::MaskRle, bbox_rect: &Rect, roi: &Rect) -> bool {
    let Some(patch) = rle.decode() else { return false };
    let patch = imgops::resize_mask(&patch, bbox_rect.w.max(1) as u32, bbox_rect.h.max(1) as u32);
    let Some(inter) = bbox_rect.intersect(roi) else {
        return false;
    };
    let sx0 = (inter.x - bbox_rect.x).max(0) as u32;
    let sy0 = (inter.y - bbox_rect.y).max(0) as u32;
    let sw = (inter.w as u32).min(patch.width().saturating_sub(sx0));
    let sh = (inter.h as u32).min(patch.height().saturating_sub(sy0));
    if sw == 0 || sh == 0 {
        return false;
    }
    for y in sy0..sy0 + sh {
        for x in sx0..sx0 + sw {
            if patch.get_pixel(x, y)[0] != 0 {
                return true;
            }
        }
    }
    false
}

impl Module for ResultFilterRegion {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let x = json_util::read_i64(props, "x", 0);
        let y = json_util::read_i64(props, "y", 0);
        let w = json_util::read_i64(props, "w", 100).max(1);
        let h = json_util::read_i64(props, "h", 100).max(1);

        let mut main_images = Vec::new();
        let mut main_results = Vec::new();
        let mut alt_images = Vec::new();
        let mut alt_results = Vec::new();
        let mut any_inside = false;

        for entry in &input.results {
            if !entry.is_local() {
                continue;
            }
            let img_idx = if entry.index >= 0 && (entry.index as usize) < input.images.len() {
                Some(entry.index as usize)
            } else {
                input
                    .images
                    .iter()
                    .position(|im| im.original_index == entry.origin_index)
            };
            let Some(img_idx) = img_idx else { continue };
            let image = &input.images[img_idx];
            let frame_w = image.image.width() as i64;
            let frame_h = image.image.height() as i64;
            let Some(roi) = Rect::clamped(x, y, w, h, frame_w, frame_h) else {
                continue;
            };

            let mut inside: Vec<Detection> = Vec::new();
            let mut outside: Vec<Detection> = Vec::new();

            for det in &entry.sample_results {
                if det.bbox.len() < 4 {
                    outside.push(det.clone());
                    continue;
                }
                // Rotated boxes test as their unrotated AABB.
                let (bx, by, bw, bh) = if det.bbox.len() >= 5 {
                    let bw = det.bbox[2].abs();
                    let bh = det.bbox[3].abs();
                    (det.bbox[0] - bw / 2.0, det.bbox[1] - bh / 2.0, bw, bh)
                } else {
                    (det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3])
                };

                let bbox_rect = Rect::clamped(
                    bx.floor() as i64,
                    by.floor() as i64,
                    bw.ceil() as i64,
                    bh.ceil() as i64,
                    frame_w,
                    frame_h,
                );
                let Some(bbox_rect) = bbox_rect else {
                    outside.push(det.clone());
                    continue;
                };
                if bbox_rect.intersect(&roi).is_none() {
                    outside.push(det.clone());
                    continue;
                }

                let hit = match &det.mask_rle {
                    Some(rle) => mask_hits_roi(rle, &bbox_rect, &roi),
                    None => true,
                };
                if hit {
                    inside.push(det.clone());
                } else {
                    outside.push(det.clone());
                }
            }

            if !inside.is_empty() {
                any_inside = true;
                main_images.push(image.clone());
                main_results.push(ResultEntry::local(
                    main_results.len() as i64,
                    entry.origin_index,
                    entry.transform.clone(),
                    inside,
                ));
            }
            if !outside.is_empty() {
                alt_images.push(image.clone());
                alt_results.push(ResultEntry::local(
                    alt_results.len() as i64,
                    entry.origin_index,
                    entry.transform.clone(),
                    outside,
                ));
            }
        }

        let mut out = ModuleOutput::main(main_images, main_results);
        out.scalars
            .insert("has_positive".to_string(), ScalarValue::Bool(any_inside));
        out.extra
            .push(ModuleChannel::new(alt_images, alt_results, Vec::new()));
        Ok(out)
    }
}

/// features/stroke_to_points: composites per-category stroke masks onto a
/// frame-sized canvas and samples a fixed number of evenly spaced point
/// boxes from each.
pub struct StrokeToPoints {
    seed: NodeSeed,
}

pub fn create_stroke_to_points(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(StrokeToPoints { seed })
}

impl StrokeToPoints {
    fn counts(&self) -> BTreeMap<String, i64> {
        self.seed
            .properties
            .get("counts_dict")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| json_util::as_i64(v).map(|c| (k.clone(), c)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `(x0, y0, w, h)` of a detection's mask placement on the frame.
fn mask_placement(det: &Detection, patch: &GrayImage) -> (i64, i64, i64, i64) {
    if det.bbox.len() >= 5 {
        let w = det.bbox[2].abs().round() as i64;
        let h = det.bbox[3].abs().round() as i64;
        let x0 = (det.bbox[0] - w as f64 / 2.0).round() as i64;
        let y0 = (det.bbox[1] - h as f64 / 2.0).round() as i64;
        (x0, y0, w, h)
    } else if det.bbox.len() == 4 {
        (
            det.bbox[0].round() as i64,
            det.bbox[1].round() as i64,
            det.bbox[2].abs().round() as i64,
            det.bbox[3].abs().round() as i64,
        )
    } else {
        (0, 0, patch.width() as i64, patch.height() as i64)
    }
}

impl Module for StrokeToPoints {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let counts = self.counts();
        let point_w = json_util::read_i64(&self.seed.properties, "point_width", 10).max(1);
        let point_h = json_util::read_i64(&self.seed.properties, "point_height", 10).max(1);
        if counts.is_empty() {
            return Ok(ModuleOutput::main(input.images, Vec::new()));
        }

        let mut out_results = Vec::new();
        for entry in &input.results {
            if !entry.is_local() {
                continue;
            }

            // Canvas size: the entry's output frame, the matching image,
            // then the original frame.
            let mut size = entry
                .transform
                .as_ref()
                .and_then(|t| t.output_size)
                .map(|[w, h]| (w, h));
            if size.map_or(true, |(w, h)| w <= 0 || h <= 0) {
                let idx = entry.index;
                if idx >= 0 && (idx as usize) < input.images.len() {
                    let im = &input.images[idx as usize];
                    if im.image.width() > 0 {
                        size = Some((im.image.width() as i64, im.image.height() as i64));
                    }
                }
            }
            if size.map_or(true, |(w, h)| w <= 0 || h <= 0) {
                size = entry
                    .transform
                    .as_ref()
                    .map(|t| (t.original_width, t.original_height));
            }
            let Some((frame_w, frame_h)) = size.filter(|&(w, h)| w > 0 && h > 0) else {
                continue;
            };

            // 1. OR all relevant masks onto per-category canvases.
            let mut canvas_by_cat: HashMap<&str, GrayImage> = HashMap::new();
            for det in &entry.sample_results {
                if det.category_name.is_empty() || !counts.contains_key(&det.category_name) {
                    continue;
                }
                let Some(rle) = &det.mask_rle else { continue };
                let Some(patch) = rle.decode() else { continue };

                let (x0, y0, roi_w, roi_h) = mask_placement(det, &patch);
                if roi_w <= 0 || roi_h <= 0 {
                    continue;
                }
                let patch = imgops::resize_mask(&patch, roi_w as u32, roi_h as u32);

                let ix0 = x0.max(0);
                let iy0 = y0.max(0);
                let ix1 = (x0 + patch.width() as i64).min(frame_w);
                let iy1 = (y0 + patch.height() as i64).min(frame_h);
                if ix1 <= ix0 || iy1 <= iy0 {
                    continue;
                }

                let canvas = canvas_by_cat
                    .entry(det.category_name.as_str())
                    .or_insert_with(|| GrayImage::new(frame_w as u32, frame_h as u32));
                for yy in iy0..iy1 {
                    for xx in ix0..ix1 {
                        let src = patch.get_pixel((xx - x0) as u32, (yy - y0) as u32)[0];
                        if src != 0 {
                            canvas.put_pixel(xx as u32, yy as u32, image::Luma([0xFF]));
                        }
                    }
                }
            }

            // 2. Sample evenly spaced points from each canvas.
            let mut points = Vec::new();
            for (cat, &count) in &counts {
                if count <= 0 {
                    continue;
                }
                let Some(canvas) = canvas_by_cat.get(cat.as_str()) else {
                    continue;
                };
                let pts = imgops::find_nonzero(canvas);
                if pts.is_empty() {
                    continue;
                }
                let step = ((pts.len() as i64) / count).max(1);
                for i in 0..count {
                    let (px, py) = pts[((i * step) as usize) % pts.len()];
                    let bx = (px as i64 - point_w / 2).clamp(0, frame_w - 1);
                    let by = (py as i64 - point_h / 2).clamp(0, frame_h - 1);
                    points.push(Detection {
                        category_id: 0,
                        category_name: cat.clone(),
                        score: 1.0,
                        bbox: vec![bx as f64, by as f64, point_w as f64, point_h as f64],
                        with_bbox: true,
                        with_mask: false,
                        with_angle: false,
                        angle: UNSET_ANGLE,
                        ..Default::default()
                    });
                }
            }

            let mut entry = entry.clone();
            entry.sample_results = points;
            out_results.push(entry);
        }

        Ok(ModuleOutput::main(input.images, out_results))
    }
}
