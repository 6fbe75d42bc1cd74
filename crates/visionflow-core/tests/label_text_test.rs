//! Label merging across lanes and category-name text rewrites.

mod common;

use serde_json::json;

use common::rgb_image;
use visionflow_core::channel::{Detection, ModuleChannel, ModuleImage, ResultEntry};
use visionflow_core::context::ExecutionContext;
use visionflow_core::module::{Module, ModuleInput, NodeSeed};
use visionflow_core::modules::features::create_result_label_merge;
use visionflow_core::modules::post::create_text_replacement;

fn seed(props: serde_json::Value) -> NodeSeed {
    NodeSeed {
        node_id: 21,
        title: String::new(),
        properties: props,
    }
}

fn det(name: &str, score: f64) -> Detection {
    Detection {
        category_name: name.to_string(),
        score,
        bbox: vec![0.0, 0.0, 4.0, 4.0],
        with_bbox: true,
        ..Default::default()
    }
}

fn lane(image: &ModuleImage, dets: Vec<Detection>) -> (Vec<ModuleImage>, Vec<ResultEntry>) {
    let entry = ResultEntry::local(0, 0, Some(image.state.clone()), dets);
    (vec![image.clone()], vec![entry])
}

#[test]
fn label_merge_prefixes_the_second_lane() {
    let image = ModuleImage::root(rgb_image(20, 20), 0);
    let (images_a, results_a) = lane(&image, vec![det("grade_a", 0.7), det("grade_b", 0.9)]);
    let (images_b, results_b) = lane(&image, vec![det("scratch", 0.5), det("dent", 0.4)]);

    let mut module = create_result_label_merge(seed(json!({ "fixed_text": "-" })));
    let out = module
        .process(
            ModuleInput {
                images: images_a,
                results: results_a,
                extra: vec![ModuleChannel::new(images_b, results_b, Vec::new())],
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();

    // top1 by score picks grade_b
    let names: Vec<&str> = out.results[0]
        .sample_results
        .iter()
        .map(|d| d.category_name.as_str())
        .collect();
    assert_eq!(names, vec!["grade_b-scratch", "grade_b-dent"]);
}

#[test]
fn label_merge_without_top1_uses_the_first_label() {
    let image = ModuleImage::root(rgb_image(20, 20), 0);
    let (images_a, results_a) = lane(&image, vec![det("first", 0.1), det("best", 0.9)]);
    let (images_b, results_b) = lane(&image, vec![det("x", 0.5)]);

    let mut module = create_result_label_merge(seed(json!({
        "use_first_score_top1": false,
    })));
    let out = module
        .process(
            ModuleInput {
                images: images_a,
                results: results_a,
                extra: vec![ModuleChannel::new(images_b, results_b, Vec::new())],
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();
    assert_eq!(out.results[0].sample_results[0].category_name, "firstx");
}

#[test]
fn label_merge_rejects_mismatched_lanes() {
    let image_a = ModuleImage::root(rgb_image(20, 20), 0);
    let image_b = ModuleImage::root(rgb_image(30, 30), 0);
    let (images_a, results_a) = lane(&image_a, vec![det("a", 0.5)]);
    let (images_b, results_b) = lane(&image_b, vec![det("b", 0.5)]);

    let mut module = create_result_label_merge(seed(json!({})));
    let err = module
        .process(
            ModuleInput {
                images: images_a,
                results: results_a,
                extra: vec![ModuleChannel::new(images_b, results_b, Vec::new())],
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("not the same image list"));

    // and a missing second lane is an error, not a silent pass-through
    let image = ModuleImage::root(rgb_image(20, 20), 0);
    let (images, results) = lane(&image, vec![det("a", 0.5)]);
    let mut module = create_result_label_merge(seed(json!({})));
    let err = module
        .process(
            ModuleInput {
                images,
                results,
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("second input lane"));
}

#[test]
fn text_replacement_applies_the_whole_mapping() {
    let image = ModuleImage::root(rgb_image(20, 20), 0);
    let (images, results) = lane(
        &image,
        vec![det("scratch_minor", 0.5), det("dent", 0.4), det("keep", 0.3)],
    );

    let mut module = create_text_replacement(seed(json!({
        "mapping": { "scratch": "SC", "dent": "DN" },
    })));
    let out = module
        .process(
            ModuleInput {
                images,
                results,
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();

    let names: Vec<&str> = out.results[0]
        .sample_results
        .iter()
        .map(|d| d.category_name.as_str())
        .collect();
    assert_eq!(names, vec!["SC_minor", "DN", "keep"]);
}

#[test]
fn text_replacement_accepts_a_json_encoded_mapping() {
    let image = ModuleImage::root(rgb_image(20, 20), 0);
    let (images, results) = lane(&image, vec![det("ng1", 0.5)]);

    let mut module = create_text_replacement(seed(json!({
        "mapping": "{\"ng1\": \"defect\"}",
    })));
    let out = module
        .process(
            ModuleInput {
                images,
                results,
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();
    assert_eq!(out.results[0].sample_results[0].category_name, "defect");
}
