//! Re-framing feature modules. Every module here derives child
//! transformation states so detections stay projectable back to the
//! original frame.

use std::collections::{HashMap, HashSet};

use anyhow::bail;

use crate::channel::{Detection, ModuleImage, ResultEntry, UNSET_ANGLE};
use crate::context::ExecutionContext;
use crate::imgops;
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};
use crate::modules::support::{pair_key, ImageLookup};
use crate::transform::{apply_2x3, transform_aabb, wrap_angle, TransformationState};

/// pre_process/coordinate_crop: fixed-rectangle crop; results pass
/// through untouched (they stay in the parent frame until a terminal
/// coordinate map).
pub struct CoordinateCrop {
    seed: NodeSeed,
}

pub fn create_coordinate_crop(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(CoordinateCrop { seed })
}

impl Module for CoordinateCrop {
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

        let mut out_images = Vec::new();
        for wrap in &input.images {
            let iw = wrap.image.width() as i64;
            let ih = wrap.image.height() as i64;
            if iw == 0 || ih == 0 {
                continue;
            }
            let x0 = x.clamp(0, iw - 1);
            let y0 = y.clamp(0, ih - 1);
            let x1 = (x0 + w).min(iw).max(x0 + 1).min(iw);
            let y1 = (y0 + h).min(ih).max(y0 + 1).min(ih);
            let cw = (x1 - x0).max(1);
            let ch = (y1 - y0).max(1);

            let cropped =
                imgops::crop(&wrap.image, x0 as u32, y0 as u32, cw as u32, ch as u32);
            let trans = [1.0, 0.0, -(x0 as f64), 0.0, 1.0, -(y0 as f64)];
            let state = wrap.effective_state().derive_child(trans, cw, ch);
            out_images.push(ModuleImage::derived(cropped, wrap, state));
        }

        Ok(ModuleOutput::main(out_images, input.results))
    }
}

/// features/image_flip: image-only mirror; the result list is cleared.
pub struct ImageFlip {
    seed: NodeSeed,
}

pub fn create_image_flip(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ImageFlip { seed })
}

impl Module for ImageFlip {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let direction = json_util::read_string(&self.seed.properties, "direction", "horizontal");
        let vertical = direction.contains("vertical");

        let mut out_images = Vec::new();
        for wrap in &input.images {
            let (w, h) = (wrap.image.width() as i64, wrap.image.height() as i64);
            if w == 0 || h == 0 {
                continue;
            }
            let (flipped, affine) = imgops::flip(&wrap.image, vertical);
            let state = wrap.effective_state().derive_child(affine, w, h);
            out_images.push(ModuleImage::derived(flipped, wrap, state));
        }

        Ok(ModuleOutput::main(out_images, Vec::new()))
    }
}

/// features/image_generation: crops a child image out of every incoming
/// detection, axis-aligned or rotated.
pub struct ImageGeneration {
    seed: NodeSeed,
}

pub fn create_image_generation(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ImageGeneration { seed })
}

impl ImageGeneration {
    fn crop_shape(&self) -> Option<(i64, i64)> {
        let arr = self.seed.properties.get("crop_shape")?.as_array()?;
        if arr.len() >= 2 {
            match (json_util::as_i64(&arr[0]), json_util::as_i64(&arr[1])) {
                (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
                _ => None,
            }
        } else {
            None
        }
    }
}

impl Module for ImageGeneration {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let crop_expand = json_util::read_f64(props, "crop_expand", 0.0);
        let min_size = json_util::read_i64(props, "min_size", 1).max(1);
        let crop_shape = self.crop_shape();

        // Entries are matched to their parent image by the (transform,
        // index, origin) key, with a null-transform fallback.
        let mut key_to_image: HashMap<String, usize> = HashMap::new();
        for (i, wrap) in input.images.iter().enumerate() {
            if wrap.image.width() == 0 {
                continue;
            }
            key_to_image.insert(
                pair_key(Some(&wrap.state), i as i64, wrap.original_index),
                i,
            );
        }

        let mut out_images = Vec::new();
        let mut out_results = Vec::new();
        let mut out_index = 0i64;

        for entry in &input.results {
            let idx = entry.index;
            let origin = entry.origin_index;
            let key = pair_key(entry.transform.as_ref(), idx, origin);
            let parent_idx = key_to_image
                .get(&key)
                .or_else(|| key_to_image.get(&pair_key(None, idx, origin)))
                .copied();
            let Some(parent_idx) = parent_idx else { continue };
            let parent = &input.images[parent_idx];
            let src = &parent.image;
            let (iw, ih) = (src.width() as f64, src.height() as f64);
            if entry.sample_results.is_empty() {
                continue;
            }

            for det in &entry.sample_results {
                if det.bbox.len() < 4 {
                    continue;
                }
                let angle = det.rotation_angle();

                let (cropped, child_affine, cw, ch) = if let Some(angle) = angle {
                    // Rotated crop: rotate about the box centre, then shift
                    // so the centre lands mid-canvas.
                    let cx = det.bbox[0];
                    let cy = det.bbox[1];
                    let w = det.bbox[2].abs();
                    let h = det.bbox[3].abs();
                    let (w2, h2) = match crop_shape {
                        Some((cw, ch)) => (cw as f64, ch as f64),
                        None => (
                            (w + 2.0 * crop_expand).max(min_size as f64),
                            (h + 2.0 * crop_expand).max(min_size as f64),
                        ),
                    };
                    let out_w = (w2 as i64).max(min_size);
                    let out_h = (h2 as i64).max(min_size);

                    let mut m = imgops::rotation_about(cx, cy, angle.to_degrees());
                    m[2] += w2 / 2.0 - cx;
                    m[5] += h2 / 2.0 - cy;

                    let Some(warped) =
                        imgops::warp_affine(src, m, out_w as u32, out_h as u32, 0)
                    else {
                        continue;
                    };
                    (warped, m, out_w, out_h)
                } else {
                    // Axis-aligned: expand, floor the top-left, round the
                    // bottom-right, enforce the minimum size.
                    let x1 = det.bbox[0];
                    let y1 = det.bbox[1];
                    let x2 = x1 + det.bbox[2];
                    let y2 = y1 + det.bbox[3];

                    let nx1 = (x1 - crop_expand).clamp(0.0, iw).floor() as i64;
                    let ny1 = (y1 - crop_expand).clamp(0.0, ih).floor() as i64;
                    let mut nx2 = ((x2 + crop_expand).round() as i64).clamp(0, iw as i64);
                    let mut ny2 = ((y2 + crop_expand).round() as i64).clamp(0, ih as i64);
                    nx2 = nx2.max(nx1 + min_size);
                    ny2 = ny2.max(ny1 + min_size);

                    let nx1 = nx1.clamp(0, iw as i64);
                    let ny1 = ny1.clamp(0, ih as i64);
                    nx2 = nx2.min(iw as i64).max(nx1 + 1);
                    ny2 = ny2.min(ih as i64).max(ny1 + 1);
                    let cw = nx2 - nx1;
                    let ch = ny2 - ny1;
                    if cw <= 0 || ch <= 0 {
                        continue;
                    }
                    let cropped =
                        imgops::crop(src, nx1 as u32, ny1 as u32, cw as u32, ch as u32);
                    let m = [1.0, 0.0, -(nx1 as f64), 0.0, 1.0, -(ny1 as f64)];
                    (cropped, m, cw, ch)
                };

                let child_state = parent.effective_state().derive_child(child_affine, cw, ch);
                let out_entry = ResultEntry::local(
                    out_index,
                    parent.original_index,
                    Some(child_state.clone()),
                    Vec::new(),
                );
                out_images.push(ModuleImage::derived(cropped, parent, child_state));
                out_results.push(out_entry);
                out_index += 1;
            }
        }

        Ok(ModuleOutput::main(out_images, out_results))
    }
}

/// features/image_rotate_by_cls: rotates each image by the quarter turn
/// its classification label asks for, updating detections to match.
pub struct RotateByClassification {
    seed: NodeSeed,
}

pub fn create_rotate_by_cls(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(RotateByClassification { seed })
}

fn label_of(entry: &ResultEntry) -> Option<String> {
    if !entry.is_local() {
        return None;
    }
    entry
        .sample_results
        .first()
        .map(|d| d.category_name.clone())
        .filter(|l| !l.is_empty())
}

impl Module for RotateByClassification {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        if input.images.is_empty() {
            return Ok(ModuleOutput::main(Vec::new(), input.results));
        }
        let props = &self.seed.properties;
        let set90: HashSet<String> =
            json_util::read_string_list(props, "rotate90_labels").into_iter().collect();
        let set180: HashSet<String> =
            json_util::read_string_list(props, "rotate180_labels").into_iter().collect();
        let set270: HashSet<String> =
            json_util::read_string_list(props, "rotate270_labels").into_iter().collect();

        // 1. Label maps from the classification lane (extra input 0), then
        // the main lane; keyed by transform signature, index, origin.
        let mut by_sig: HashMap<String, String> = HashMap::new();
        let mut by_index: HashMap<i64, String> = HashMap::new();
        let mut by_origin: HashMap<i64, String> = HashMap::new();
        let cls_results = input.extra.first().map(|ch| ch.results.as_slice()).unwrap_or(&[]);
        for entry in cls_results.iter().chain(input.results.iter()) {
            let Some(label) = label_of(entry) else { continue };
            if let Some(sig) = entry.transform_signature() {
                by_sig.insert(sig, label.clone());
            }
            by_index.insert(entry.index, label.clone());
            by_origin.insert(entry.origin_index, label);
        }

        let lookup = ImageLookup::new(&input.images);

        // 2. Rotate each image by its label's quarter turn.
        let mut out_images = Vec::new();
        let mut affines: HashMap<usize, [f64; 6]> = HashMap::new();
        let mut states: HashMap<usize, TransformationState> = HashMap::new();
        let mut turns: HashMap<usize, i64> = HashMap::new();

        for (i, wrap) in input.images.iter().enumerate() {
            let (w, h) = (wrap.image.width(), wrap.image.height());
            if w == 0 || h == 0 {
                continue;
            }
            let label = wrap
                .state
                .signature()
                .and_then(|sig| by_sig.get(&sig))
                .or_else(|| by_index.get(&(i as i64)))
                .or_else(|| by_origin.get(&wrap.original_index));

            let quarter = match label {
                Some(l) if set90.contains(l) => 1,
                Some(l) if set180.contains(l) => 2,
                Some(l) if set270.contains(l) => 3,
                _ => 0,
            };

            let (affine, new_w, new_h) = imgops::quarter_rotation_affine(quarter, w, h);
            let rotated = imgops::rotate_quarter(&wrap.image, quarter);
            let state = wrap
                .effective_state()
                .derive_child(affine, new_w as i64, new_h as i64);

            affines.insert(i, affine);
            states.insert(i, state.clone());
            turns.insert(i, quarter);
            out_images.push(ModuleImage::derived(rotated, wrap, state));
        }

        // 3. Re-express detections in the rotated frames. The
        // classification lane itself is not forwarded.
        let mut out_results = Vec::new();
        for entry in input.results {
            if !entry.is_local() {
                out_results.push(entry);
                continue;
            }
            let idx = if entry.index >= 0 && (entry.index as usize) < input.images.len() {
                Some(entry.index as usize)
            } else {
                lookup
                    .by_origin(entry.origin_index)
                    .or_else(|| {
                        entry
                            .transform_signature()
                            .and_then(|sig| lookup.by_signature(&sig))
                    })
            };
            let Some(idx) = idx else {
                out_results.push(entry);
                continue;
            };
            let (Some(affine), Some(state), Some(quarter)) =
                (affines.get(&idx), states.get(&idx), turns.get(&idx))
            else {
                out_results.push(entry);
                continue;
            };

            let mut entry = entry;
            entry.transform = Some(state.clone());
            let rotation_rad = (*quarter as f64) * std::f64::consts::FRAC_PI_2;

            for det in &mut entry.sample_results {
                if det.bbox.len() < 4 {
                    continue;
                }
                if let Some(angle) = det.rotation_angle() {
                    let (ncx, ncy) = apply_2x3(*affine, det.bbox[0], det.bbox[1]);
                    let new_angle = wrap_angle(angle + rotation_rad);
                    let (w, h) = (det.bbox[2], det.bbox[3]);
                    det.bbox = if det.bbox.len() >= 5 {
                        vec![ncx, ncy, w, h, new_angle]
                    } else {
                        vec![ncx, ncy, w, h]
                    };
                    det.with_angle = true;
                    det.angle = new_angle;
                } else {
                    let boxed = transform_aabb(
                        *affine, det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3],
                    );
                    det.bbox = boxed.to_vec();
                    det.with_bbox = true;
                    det.with_angle = false;
                    det.angle = UNSET_ANGLE;
                }
            }
            out_results.push(entry);
        }

        Ok(ModuleOutput::main(out_images, out_results))
    }
}

/// features/result_label_merge: prefixes the second lane's category names
/// with the first lane's top label per image.
pub struct ResultLabelMerge {
    seed: NodeSeed,
}

pub fn create_result_label_merge(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ResultLabelMerge { seed })
}

fn top_label(samples: &[Detection], use_top1: bool) -> Option<String> {
    if !use_top1 {
        return samples
            .iter()
            .map(|d| d.category_name.clone())
            .find(|l| !l.is_empty());
    }
    // strictly-greater keeps the first of equal scores
    let mut best: Option<(f64, &str)> = None;
    for det in samples {
        if det.category_name.is_empty() {
            continue;
        }
        if best.is_none() || det.score > best.unwrap().0 {
            best = Some((det.score, &det.category_name));
        }
    }
    best.map(|(_, label)| label.to_string())
}

impl Module for ResultLabelMerge {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let Some(lane_b) = input.extra.into_iter().next() else {
            bail!("result_label_merge requires a second input lane (image_2/results_2)");
        };
        let images_a = input.images;
        let images_b = lane_b.images;

        if images_a.len() != images_b.len() {
            bail!(
                "label merge lanes carry different image counts: {} vs {}",
                images_a.len(),
                images_b.len()
            );
        }
        for (i, (a, b)) in images_a.iter().zip(&images_b).enumerate() {
            if a.lane_signature() != b.lane_signature() {
                bail!("label merge lanes are not the same image list, index={i}");
            }
        }

        let fixed_text = json_util::read_string(&self.seed.properties, "fixed_text", "");
        let use_top1 = json_util::read_bool(&self.seed.properties, "use_first_score_top1", true);

        let mut label_map: HashMap<i64, String> = HashMap::new();
        for entry in &input.results {
            if !entry.is_local() || entry.index < 0 {
                continue;
            }
            if let Some(label) = top_label(&entry.sample_results, use_top1) {
                label_map.insert(entry.index, label);
            }
        }

        let mut out_results = Vec::new();
        for mut entry in lane_b.results {
            if entry.is_local() {
                if let Some(prefix) = label_map.get(&entry.index) {
                    for det in &mut entry.sample_results {
                        det.category_name =
                            format!("{prefix}{fixed_text}{}", det.category_name);
                    }
                }
            }
            out_results.push(entry);
        }

        Ok(ModuleOutput::main(images_b, out_results))
    }
}
