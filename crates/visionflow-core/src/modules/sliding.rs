//! Sliding-window tiling and its merge counterpart.

use std::collections::BTreeMap;

use tracing::warn;

use crate::channel::{Detection, ModuleImage, ResultEntry, SlidingMeta};
use crate::context::ExecutionContext;
use crate::imgops;
use crate::json_util;
use crate::module::{Module, ModuleInput, ModuleOutput, NodeSeed};

/// pre_process/sliding_window: tiles each image into window-sized crops.
/// The last tile of each row/column is right-aligned so tiles never leave
/// the frame.
pub struct SlidingWindow {
    seed: NodeSeed,
}

pub fn create_sliding_window(seed: NodeSeed) -> Box<dyn Module> {
    Box::new(SlidingWindow { seed })
}

fn tile_count(full: i64, small: i64, overlap: i64) -> i64 {
    if small >= full {
        return 1;
    }
    let eff = (small - overlap).max(1);
    full / eff + i64::from(full % eff > 0)
}

impl Module for SlidingWindow {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let props = &self.seed.properties;
        let min_size = json_util::read_i64(props, "min_size", 1).max(1);
        let (win_w, win_h) = json_util::read_i64_pair(props, "window_size", (640, 640));
        let (ov_x, ov_y) = json_util::read_i64_pair(props, "overlap", (0, 0));
        let win_w = win_w.max(min_size);
        let win_h = win_h.max(min_size);
        let ov_x = ov_x.max(0);
        let ov_y = ov_y.max(0);

        let mut out_images = Vec::new();
        let mut out_results = Vec::new();
        let mut out_index = 0i64;

        for wrap in &input.images {
            let w = wrap.image.width() as i64;
            let h = wrap.image.height() as i64;
            if w == 0 || h == 0 {
                continue;
            }
            let small_w = win_w.min(w);
            let small_h = win_h.min(h);
            let rows = tile_count(h, small_h, ov_y);
            let cols = tile_count(w, small_w, ov_x);

            for r in 0..rows {
                for c in 0..cols {
                    let mut start_x = c * (small_w - ov_x);
                    let mut start_y = r * (small_h - ov_y);
                    if start_x + small_w > w {
                        start_x = w - small_w;
                    }
                    if start_y + small_h > h {
                        start_y = h - small_h;
                    }
                    start_x = start_x.max(0);
                    start_y = start_y.max(0);
                    if small_w < min_size || small_h < min_size {
                        continue;
                    }

                    let cropped = imgops::crop(
                        &wrap.image,
                        start_x as u32,
                        start_y as u32,
                        small_w as u32,
                        small_h as u32,
                    );
                    let trans = [1.0, 0.0, -(start_x as f64), 0.0, 1.0, -(start_y as f64)];
                    let state = wrap.effective_state().derive_child(trans, small_w, small_h);

                    let mut entry = ResultEntry::local(
                        out_index,
                        wrap.original_index,
                        Some(state.clone()),
                        Vec::new(),
                    );
                    entry.sliding_meta = Some(SlidingMeta {
                        grid_x: c,
                        grid_y: r,
                        grid_size: [cols, rows],
                        win_size: [small_w, small_h],
                        slice_index: [r, c],
                        x: start_x,
                        y: start_y,
                        w: small_w,
                        h: small_h,
                    });

                    out_images.push(ModuleImage::derived(cropped, wrap, state));
                    out_results.push(entry);
                    out_index += 1;
                }
            }
        }

        Ok(ModuleOutput::main(out_images, out_results))
    }
}

/// pre_process/sliding_merge: collapses tile results back onto their
/// originals: inputs with an identity transform are the output images, and
/// every tile's detections concatenate under their origin index.
pub struct SlidingMerge;

pub fn create_sliding_merge(_seed: NodeSeed) -> Box<dyn Module> {
    Box::new(SlidingMerge)
}

impl Module for SlidingMerge {
    fn process(
        &mut self,
        input: ModuleInput,
        _ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput> {
        let mut originals: BTreeMap<i64, ModuleImage> = BTreeMap::new();
        for wrap in input.images {
            if wrap.image.width() == 0 {
                continue;
            }
            if wrap.state.is_identity() {
                originals.insert(wrap.original_index, wrap);
            }
        }

        let mut samples: BTreeMap<i64, Vec<Detection>> = BTreeMap::new();
        for entry in input.results {
            samples
                .entry(entry.origin_index)
                .or_default()
                .extend(entry.sample_results);
        }

        let orphaned: usize = samples
            .iter()
            .filter(|(origin, _)| !originals.contains_key(origin))
            .map(|(_, dets)| dets.len())
            .sum();
        if orphaned > 0 {
            // Contract: tiles whose original never reached this node merge
            // to nothing.
            warn!(count = orphaned, "sliding merge dropped detections with no original image");
        }

        let mut out_images = Vec::new();
        let mut out_results = Vec::new();
        for (out_idx, (origin_index, wrap)) in originals.into_iter().enumerate() {
            let merged = samples.remove(&origin_index).unwrap_or_default();
            // transform stays null: the merged entry is already expressed
            // in the original frame of its image.
            out_results.push(ResultEntry::local(out_idx as i64, origin_index, None, merged));
            out_images.push(wrap);
        }

        Ok(ModuleOutput::main(out_images, out_results))
    }
}
