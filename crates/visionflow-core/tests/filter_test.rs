//! Filter family: category filter, advanced size bands, region filter.
//! Invariant: main + extra outputs are a disjoint union of the input.

mod common;

use image::{GrayImage, Luma};
use serde_json::json;

use common::rgb_image;
use visionflow_core::channel::{Detection, ModuleImage, ResultEntry, ScalarValue};
use visionflow_core::context::ExecutionContext;
use visionflow_core::mask::MaskRle;
use visionflow_core::module::{Module, ModuleInput, NodeSeed};
use visionflow_core::modules::post::{create_result_filter, create_result_filter_advanced};
use visionflow_core::modules::region::create_result_filter_region;

fn seed(props: serde_json::Value) -> NodeSeed {
    NodeSeed {
        node_id: 7,
        title: String::new(),
        properties: props,
    }
}

fn det(name: &str, bbox: &[f64]) -> Detection {
    Detection {
        category_name: name.to_string(),
        score: 0.9,
        bbox: bbox.to_vec(),
        with_bbox: true,
        ..Default::default()
    }
}

fn one_image_input(dets: Vec<Detection>) -> ModuleInput {
    let image = ModuleImage::root(rgb_image(100, 100), 0);
    let entry = ResultEntry::local(0, 0, Some(image.state.clone()), dets);
    ModuleInput {
        images: vec![image],
        results: vec![entry],
        ..Default::default()
    }
}

#[test]
fn category_filter_partitions_disjointly() {
    let input = one_image_input(vec![
        det("ok", &[0.0, 0.0, 5.0, 5.0]),
        det("ng", &[5.0, 0.0, 5.0, 5.0]),
        det("ok", &[0.0, 5.0, 5.0, 5.0]),
    ]);
    let mut module = create_result_filter(seed(json!({ "categories": ["ok"] })));
    let out = module.process(input, &mut ExecutionContext::new()).unwrap();

    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].sample_results.len(), 2);
    let rejected = &out.extra[0].results;
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].sample_results.len(), 1);
    assert_eq!(rejected[0].sample_results[0].category_name, "ng");
    assert_eq!(
        out.scalars.get("has_positive"),
        Some(&ScalarValue::Bool(true))
    );

    // disjoint union: counts add up
    let kept: usize = out.results.iter().map(|e| e.sample_results.len()).sum();
    let dropped: usize = rejected.iter().map(|e| e.sample_results.len()).sum();
    assert_eq!(kept + dropped, 3);
}

#[test]
fn empty_category_set_keeps_everything() {
    let input = one_image_input(vec![det("anything", &[0.0, 0.0, 5.0, 5.0])]);
    let mut module = create_result_filter(seed(json!({})));
    let out = module.process(input, &mut ExecutionContext::new()).unwrap();
    assert_eq!(out.results[0].sample_results.len(), 1);
    assert!(out.extra[0].results.is_empty());
}

#[test]
fn advanced_filter_requires_every_enabled_test() {
    let input = one_image_input(vec![
        det("small", &[0.0, 0.0, 4.0, 4.0]),
        det("tall", &[0.0, 0.0, 10.0, 40.0]),
        det("fits", &[0.0, 0.0, 12.0, 12.0]),
    ]);
    let mut module = create_result_filter_advanced(seed(json!({
        "enable_bbox_wh": true,
        "bbox_w_min": 8,
        "bbox_h_max": 20,
        "enable_bbox_area": true,
        "bbox_area_max": 200.0,
    })));
    let out = module.process(input, &mut ExecutionContext::new()).unwrap();

    let kept: Vec<&str> = out.results[0]
        .sample_results
        .iter()
        .map(|d| d.category_name.as_str())
        .collect();
    assert_eq!(kept, vec!["fits"]);
    assert_eq!(out.extra[0].results[0].sample_results.len(), 2);
}

#[test]
fn advanced_filter_mask_area_uses_the_codec() {
    let mask = GrayImage::from_fn(4, 4, |x, _| Luma([u8::from(x < 2) * 255]));
    let mut masked = det("m", &[0.0, 0.0, 4.0, 4.0]);
    masked.mask_rle = Some(MaskRle::encode_gray(&mask));
    masked.with_mask = true;

    let input = one_image_input(vec![masked]);
    let mut module = create_result_filter_advanced(seed(json!({
        "enable_mask_area": true,
        "mask_area_min": 7.9,
        "mask_area_max": 8.1,
    })));
    let out = module.process(input, &mut ExecutionContext::new()).unwrap();
    assert_eq!(out.results[0].sample_results.len(), 1);
}

#[test]
fn region_filter_intersects_bbox_and_mask() {
    // mask lives only in the lower-right quadrant of its bbox
    let mask = GrayImage::from_fn(20, 20, |x, y| {
        Luma([u8::from(x >= 10 && y >= 10) * 255])
    });
    let mut masked = det("masked", &[0.0, 0.0, 20.0, 20.0]);
    masked.mask_rle = Some(MaskRle::encode_gray(&mask));

    let input = one_image_input(vec![
        det("inside", &[2.0, 2.0, 6.0, 6.0]),
        det("outside", &[80.0, 80.0, 10.0, 10.0]),
        masked,
    ]);
    let mut module = create_result_filter_region(seed(json!({
        "x": 0, "y": 0, "w": 10, "h": 10,
    })));
    let out = module.process(input, &mut ExecutionContext::new()).unwrap();

    // bbox overlap alone is not enough when a mask is present: the masked
    // detection's pixels never enter the ROI.
    let kept: Vec<&str> = out.results[0]
        .sample_results
        .iter()
        .map(|d| d.category_name.as_str())
        .collect();
    assert_eq!(kept, vec!["inside"]);
    assert_eq!(out.extra[0].results[0].sample_results.len(), 2);
    assert_eq!(
        out.scalars.get("has_positive"),
        Some(&ScalarValue::Bool(true))
    );
}

#[test]
fn empty_sample_results_do_not_crash_filters() {
    let factories: [fn(NodeSeed) -> Box<dyn Module>; 3] = [
        create_result_filter,
        create_result_filter_advanced,
        create_result_filter_region,
    ];
    for factory in factories {
        let mut module = factory(seed(json!({})));
        let out = module
            .process(one_image_input(Vec::new()), &mut ExecutionContext::new())
            .unwrap();
        assert_eq!(
            out.scalars.get("has_positive"),
            Some(&ScalarValue::Bool(false))
        );
    }
}
