//! Built-in module implementations, grouped by node-type prefix.

pub mod features;
pub mod input;
pub mod model;
pub mod output;
pub mod post;
pub mod region;
pub mod sliding;
pub mod support;
pub mod templates;

use crate::registry::ModuleRegistry;

/// Registers every built-in module under all of its aliases.
pub fn register_builtin(reg: &mut ModuleRegistry) {
    // input/*
    reg.register("input/image", input::create_image);
    reg.register("input/frontend_image", input::create_frontend_image);
    reg.register("input/build_results", input::create_build_results);

    // model/*
    reg.register("model/det", model::create_det);
    reg.register("model/rotated_bbox", model::create_det);
    reg.register("model/instance_seg", model::create_det);
    reg.register("model/semantic_seg", model::create_det);
    reg.register("model/cls", model::create_cls);
    reg.register("model/ocr", model::create_ocr);

    // re-framing features
    reg.register("features/image_generation", features::create_image_generation);
    reg.register("features/image_flip", features::create_image_flip);
    reg.register("pre_process/coordinate_crop", features::create_coordinate_crop);
    reg.register("features/coordinate_crop", features::create_coordinate_crop);
    reg.register("features/image_rotate_by_cls", features::create_rotate_by_cls);

    // sliding window
    reg.register("pre_process/sliding_window", sliding::create_sliding_window);
    reg.register("features/sliding_window", sliding::create_sliding_window);
    reg.register("pre_process/sliding_merge", sliding::create_sliding_merge);
    reg.register("features/sliding_merge", sliding::create_sliding_merge);

    // post-processing
    reg.register("post_process/merge_results", post::create_merge_results);
    reg.register("features/merge_results", post::create_merge_results);
    reg.register("post_process/result_filter", post::create_result_filter);
    reg.register("features/result_filter", post::create_result_filter);
    reg.register("post_process/result_filter_advanced", post::create_result_filter_advanced);
    reg.register("features/result_filter_advanced", post::create_result_filter_advanced);
    reg.register("post_process/text_replacement", post::create_text_replacement);
    reg.register("features/text_replacement", post::create_text_replacement);
    reg.register("post_process/mask_to_rbox", post::create_mask_to_rbox);
    reg.register("features/mask_to_rbox", post::create_mask_to_rbox);
    reg.register("post_process/rbox_correction", post::create_rbox_correction);
    reg.register("features/rbox_correction", post::create_rbox_correction);
    reg.register("post_process/result_label_merge", features::create_result_label_merge);
    reg.register("features/result_label_merge", features::create_result_label_merge);

    // region filtering & strokes
    reg.register("post_process/result_filter_region", region::create_result_filter_region);
    reg.register("features/result_filter_region", region::create_result_filter_region);
    reg.register("post_process/result_filter_region_global", region::create_result_filter_region);
    reg.register("features/result_filter_region_global", region::create_result_filter_region);
    reg.register("features/stroke_to_points", region::create_stroke_to_points);

    // templates
    reg.register("features/template_from_results", templates::create_template_from_results);
    reg.register("features/template_save", templates::create_template_save);
    reg.register("features/template_load", templates::create_template_load);
    reg.register("features/template_match", templates::create_template_match);
    reg.register("features/printed_template_match", templates::create_template_match);

    // output/*
    reg.register("output/save_image", output::create_save_image);
    reg.register("output/preview", output::create_preview);
    reg.register("output/return_json", output::create_return_json);
    reg.register("output/visualize", output::create_visualize);
    reg.register("output/visualize_local", output::create_visualize_local);
}
