//! Result post-processing: merging, filtering, label rewrites, and
//! rotated-box derivation.

use std::collections::{HashMap, HashSet};
use std::f64::consts::{FRAC_PI_2, PI};

use crate::channel::{
    Detection, ModuleChannel, ModuleImage, ResultEntry, ScalarValue, UNSET_ANGLE,
};
use crate::context::ExecutionContext;
use crate::imgops;
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};
use crate::modules::support::{pair_key, ImageLookup};
use crate::transform::{apply_2x3, transform_aabb, TransformationState};

fn has_positive(results: &[ResultEntry]) -> bool {
    results.iter().any(|e| !e.sample_results.is_empty())
}

/// post_process/merge_results: concatenates the main lane and every extra
/// lane into one, re-indexing images globally.
pub struct MergeResults;

pub fn create_merge_results(_seed: NodeSeed) -> Box<dyn Module> {
    Box::new(MergeResults)
}

impl Module for MergeResults {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let mut groups: Vec<(Vec<ModuleImage>, Vec<ResultEntry>)> =
            vec![(input.images, input.results)];
        for ch in input.extra {
            groups.push((ch.images, ch.results));
        }

        let mut merged_images: Vec<ModuleImage> = Vec::new();
        let mut merged_results: Vec<ResultEntry> = Vec::new();

        for (images, results) in groups {
            let base = merged_images.len() as i64;
            let mut local_to_global: HashMap<i64, i64> = HashMap::new();
            let mut added = 0i64;

            for (i, mut wrap) in images.into_iter().enumerate() {
                if wrap.image.width() == 0 {
                    continue;
                }
                let global = base + added;
                local_to_global.insert(i as i64, global);
                added += 1;
                // the merged lane re-numbers originals by global position
                wrap.original_index = global;
                merged_images.push(wrap);
            }

            for mut entry in results {
                if !entry.is_local() {
                    merged_results.push(entry);
                    continue;
                }
                if added == 1 {
                    entry.index = base;
                    entry.origin_index = base;
                } else {
                    if let Some(&g) = local_to_global.get(&entry.index) {
                        entry.index = g;
                    }
                    if let Some(&g) = local_to_global.get(&entry.origin_index) {
                        entry.origin_index = g;
                    }
                }
                merged_results.push(entry);
            }
        }

        Ok(ModuleOutput::main(merged_images, merged_results))
    }
}

/// post_process/result_filter: keeps detections whose category is in the
/// configured set; rejects flow out on extra output 0.
pub struct ResultFilter {
    seed: NodeSeed,
}

pub fn create_result_filter(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ResultFilter { seed })
}

impl Module for ResultFilter {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let keep_set: HashSet<String> =
            json_util::read_string_list(&self.seed.properties, "categories")
                .into_iter()
                .collect();

        let mut key_to_image: HashMap<String, &ModuleImage> = HashMap::new();
        for (i, wrap) in input.images.iter().enumerate() {
            if wrap.image.width() == 0 {
                continue;
            }
            key_to_image.insert(
                pair_key(Some(&wrap.state), i as i64, wrap.original_index),
                wrap,
            );
        }

        let mut main_images = Vec::new();
        let mut main_results = Vec::new();
        let mut alt_images = Vec::new();
        let mut alt_results = Vec::new();

        for entry in &input.results {
            let state = entry
                .transform
                .clone()
                .unwrap_or_else(TransformationState::default);
            let key = pair_key(Some(&state), entry.index, entry.origin_index);
            let Some(&image) = key_to_image.get(&key) else {
                continue;
            };

            let (keep, reject): (Vec<&Detection>, Vec<&Detection>) = entry
                .sample_results
                .iter()
                .partition(|d| keep_set.is_empty() || keep_set.contains(&d.category_name));

            if !keep.is_empty() {
                main_images.push(image.clone());
                main_results.push(ResultEntry::local(
                    main_results.len() as i64,
                    entry.origin_index,
                    Some(state.clone()),
                    keep.into_iter().cloned().collect(),
                ));
            }
            if !reject.is_empty() {
                alt_images.push(image.clone());
                alt_results.push(ResultEntry::local(
                    alt_results.len() as i64,
                    entry.origin_index,
                    Some(state),
                    reject.into_iter().cloned().collect(),
                ));
            }
        }

        let mut out = ModuleOutput::main(main_images, main_results);
        out.scalars.insert(
            "has_positive".to_string(),
            ScalarValue::Bool(has_positive(&out.results)),
        );
        out.extra
            .push(ModuleChannel::new(alt_images, alt_results, Vec::new()));
        Ok(out)
    }
}

/// Optional min/max band; only enabled families are tested.
#[derive(Default)]
struct Band {
    min: Option<f64>,
    max: Option<f64>,
}

impl Band {
    fn read(props: &serde_json::Value, min_key: &str, max_key: &str) -> Band {
        Band {
            min: json_util::read_opt_f64(props, min_key),
            max: json_util::read_opt_f64(props, max_key),
        }
    }

    fn contains(&self, v: f64) -> bool {
        if let Some(min) = self.min {
            if v < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if v > max {
                return false;
            }
        }
        true
    }
}

/// post_process/result_filter_advanced: four independently enabled size
/// filters; a detection survives only when every enabled test passes.
pub struct ResultFilterAdvanced {
    seed: NodeSeed,
}

pub fn create_result_filter_advanced(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(ResultFilterAdvanced { seed })
}

impl Module for ResultFilterAdvanced {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let enable_bbox_wh = json_util::read_bool(props, "enable_bbox_wh", false);
        let enable_rbox_wh = json_util::read_bool(props, "enable_rbox_wh", false);
        let enable_bbox_area = json_util::read_bool(props, "enable_bbox_area", false);
        let enable_mask_area = json_util::read_bool(props, "enable_mask_area", false);

        let bbox_w = Band::read(props, "bbox_w_min", "bbox_w_max");
        let bbox_h = Band::read(props, "bbox_h_min", "bbox_h_max");
        let rbox_w = Band::read(props, "rbox_w_min", "rbox_w_max");
        let rbox_h = Band::read(props, "rbox_h_min", "rbox_h_max");
        let bbox_area = Band::read(props, "bbox_area_min", "bbox_area_max");
        let mask_area = Band::read(props, "mask_area_min", "mask_area_max");

        let passes = |det: &Detection| -> bool {
            if det.bbox.len() < 4 {
                return false;
            }
            let rotated = det.is_rotated();
            let w = det.bbox[2].abs();
            let h = det.bbox[3].abs();
            let area = w * h;

            if !rotated && enable_bbox_wh && !(bbox_w.contains(w) && bbox_h.contains(h)) {
                return false;
            }
            if rotated && enable_rbox_wh && !(rbox_w.contains(w) && rbox_h.contains(h)) {
                return false;
            }
            if enable_bbox_area && !bbox_area.contains(area) {
                return false;
            }
            if enable_mask_area {
                let m_area = det.mask_rle.as_ref().map(|m| m.area()).unwrap_or(0.0);
                if !mask_area.contains(m_area) {
                    return false;
                }
            }
            true
        };

        let lookup = ImageLookup::new(&input.images);
        let mut main_images = Vec::new();
        let mut main_results = Vec::new();
        let mut alt_images = Vec::new();
        let mut alt_results = Vec::new();

        for entry in &input.results {
            if !entry.is_local() {
                continue;
            }
            let Some(img_idx) = lookup.find(entry) else { continue };
            let image = &input.images[img_idx];
            let state = entry
                .transform
                .clone()
                .unwrap_or_else(TransformationState::default);

            let (pass, fail): (Vec<&Detection>, Vec<&Detection>) =
                entry.sample_results.iter().partition(|&d| passes(d));

            if !pass.is_empty() {
                main_images.push(image.clone());
                main_results.push(ResultEntry::local(
                    main_results.len() as i64,
                    entry.origin_index,
                    Some(state.clone()),
                    pass.into_iter().cloned().collect(),
                ));
            }
            if !fail.is_empty() {
                alt_images.push(image.clone());
                alt_results.push(ResultEntry::local(
                    alt_results.len() as i64,
                    entry.origin_index,
                    Some(state),
                    fail.into_iter().cloned().collect(),
                ));
            }
        }

        let mut out = ModuleOutput::main(main_images, main_results);
        out.scalars.insert(
            "has_positive".to_string(),
            ScalarValue::Bool(has_positive(&out.results)),
        );
        out.extra
            .push(ModuleChannel::new(alt_images, alt_results, Vec::new()));
        Ok(out)
    }
}

/// post_process/text_replacement: substring rewrites over every category
/// name. The full mapping is applied to every name, in key order.
pub struct TextReplacement {
    seed: NodeSeed,
}

pub fn create_text_replacement(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(TextReplacement { seed })
}

impl Module for TextReplacement {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let mapping = json_util::read_string_map(&self.seed.properties, "mapping");
        if mapping.is_empty() {
            return Ok(ModuleOutput::passthrough(input));
        }

        let mut results = input.results;
        for entry in &mut results {
            if !entry.is_local() {
                continue;
            }
            for det in &mut entry.sample_results {
                let mut name = det.category_name.clone();
                for (needle, replacement) in &mapping {
                    if !needle.is_empty() {
                        name = name.replace(needle.as_str(), replacement);
                    }
                }
                det.category_name = name;
            }
        }

        Ok(ModuleOutput::main(input.images, results))
    }
}

/// Angle into `[-pi/2, pi/2)`.
fn normalize_half_pi(a: f64) -> f64 {
    (a + FRAC_PI_2).rem_euclid(PI) - FRAC_PI_2
}

/// post_process/mask_to_rbox: replaces each masked detection with the
/// minimum-area rotated rectangle of its mask. Maskless detections drop.
pub struct MaskToRBox;

pub fn create_mask_to_rbox(_seed: NodeSeed) -> Box<dyn Module> {
    Box::new(MaskToRBox)
}

impl Module for MaskToRBox {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let mut out_results = Vec::new();
        for entry in input.results {
            if !entry.is_local() {
                out_results.push(entry);
                continue;
            }
            let mut new_dets = Vec::new();
            for det in &entry.sample_results {
                let Some(rle) = &det.mask_rle else { continue };
                if det.bbox.len() < 4 {
                    continue;
                }
                let (bx, by) = (det.bbox[0], det.bbox[1]);
                let Some(mask) = rle.decode() else { continue };
                let points = imgops::find_nonzero(&mask);
                let Some((cx, cy, mut w, mut h, mut angle)) =
                    imgops::min_area_rotated_rect(&points)
                else {
                    continue;
                };

                // long side first, angle follows the long side
                if w < h {
                    std::mem::swap(&mut w, &mut h);
                    angle += FRAC_PI_2;
                }
                let angle = normalize_half_pi(angle);

                let mut det = det.clone();
                det.bbox = vec![cx + bx, cy + by, w, h, angle];
                det.with_angle = true;
                det.angle = angle;
                det.mask_rle = None;
                new_dets.push(det);
            }
            let mut entry = entry;
            entry.sample_results = new_dets;
            out_results.push(entry);
        }

        Ok(ModuleOutput::main(input.images, out_results))
    }
}

/// post_process/rbox_correction: undoes the rotation implied by each
/// entry's own transform, rotating the image about its centre and moving
/// the detections with it. Masks are dropped (their alignment is not
/// guaranteed after rotation).
pub struct RBoxCorrection {
    seed: NodeSeed,
}

pub fn create_rbox_correction(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(RBoxCorrection { seed })
}

impl Module for RBoxCorrection {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let fill = json_util::read_i64(&self.seed.properties, "fill_value", 0)
            .clamp(0, 255) as u8;

        // Reference angle per image: the first of its entries whose
        // transform carries an affine.
        let mut entries_by_index: HashMap<i64, Vec<&ResultEntry>> = HashMap::new();
        for entry in &input.results {
            if entry.is_local() && entry.index >= 0 {
                entries_by_index.entry(entry.index).or_default().push(entry);
            }
        }

        let mut out_images = Vec::new();
        let mut affines: HashMap<i64, [f64; 6]> = HashMap::new();
        let mut states: HashMap<i64, TransformationState> = HashMap::new();

        for (i, wrap) in input.images.iter().enumerate() {
            let (w, h) = (wrap.image.width(), wrap.image.height());
            if w == 0 || h == 0 {
                continue;
            }
            let ref_angle = entries_by_index
                .get(&(i as i64))
                .and_then(|entries| {
                    entries.iter().find_map(|e| {
                        e.transform
                            .as_ref()
                            .and_then(|t| t.affine_2x3)
                            .map(|a| a[3].atan2(a[0]))
                    })
                });
            let Some(ref_angle) = ref_angle else {
                out_images.push(wrap.clone());
                continue;
            };

            let affine = imgops::rotation_about(
                w as f64 / 2.0,
                h as f64 / 2.0,
                -ref_angle.to_degrees(),
            );
            let Some(rotated) = imgops::warp_affine(&wrap.image, affine, w, h, fill) else {
                out_images.push(wrap.clone());
                continue;
            };
            let state = wrap.effective_state().derive_child(affine, w as i64, h as i64);
            affines.insert(i as i64, affine);
            states.insert(i as i64, state.clone());
            out_images.push(ModuleImage::derived(rotated, wrap, state));
        }

        let mut out_results = Vec::new();
        for entry in &input.results {
            if !entry.is_local() {
                out_results.push(entry.clone());
                continue;
            }
            let idx = entry.index;
            let (Some(affine), Some(state)) = (affines.get(&idx), states.get(&idx)) else {
                out_results.push(entry.clone());
                continue;
            };

            let mut entry = entry.clone();
            entry.transform = Some(state.clone());
            for det in &mut entry.sample_results {
                if det.bbox.len() >= 4 {
                    if let Some(angle) = det.rotation_angle() {
                        let (ncx, ncy) = apply_2x3(*affine, det.bbox[0], det.bbox[1]);
                        det.bbox = vec![ncx, ncy, det.bbox[2], det.bbox[3], angle];
                        det.with_angle = true;
                        det.angle = angle;
                    } else {
                        let boxed = transform_aabb(
                            *affine, det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3],
                        );
                        det.bbox = boxed.to_vec();
                        det.with_angle = false;
                        det.angle = UNSET_ANGLE;
                    }
                }
                det.mask_rle = None;
            }
            out_results.push(entry);
        }

        Ok(ModuleOutput::main(out_images, out_results))
    }
}
