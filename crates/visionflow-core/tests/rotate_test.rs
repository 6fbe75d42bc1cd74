//! Rotation-driven modules: rotate-by-classification, mask to rotated
//! box, and rbox correction.

mod common;

use std::f64::consts::FRAC_PI_2;

use image::{GrayImage, Luma};
use serde_json::json;

use common::rgb_image;
use visionflow_core::channel::{Detection, ModuleChannel, ModuleImage, ResultEntry};
use visionflow_core::context::ExecutionContext;
use visionflow_core::mask::MaskRle;
use visionflow_core::module::{Module, ModuleInput, NodeSeed};
use visionflow_core::imgops::rotation_about;
use visionflow_core::modules::features::create_rotate_by_cls;
use visionflow_core::modules::post::{create_mask_to_rbox, create_rbox_correction};
use visionflow_core::transform::{mul_3x3, to_2x3, to_3x3};

fn seed(props: serde_json::Value) -> NodeSeed {
    NodeSeed {
        node_id: 11,
        title: String::new(),
        properties: props,
    }
}

fn cls_entry(label: &str) -> ResultEntry {
    ResultEntry::local(
        0,
        0,
        None,
        vec![Detection {
            category_name: label.to_string(),
            score: 0.99,
            bbox: vec![0.0, 0.0, 100.0, 100.0],
            with_bbox: true,
            ..Default::default()
        }],
    )
}

fn rotate_input(det_bbox: &[f64], label: &str) -> ModuleInput {
    let image = ModuleImage::root(rgb_image(100, 100), 0);
    // unlabelled detection: a labelled one on the main lane would take
    // precedence over the classification lane for the same image
    let mut det = Detection {
        score: 0.9,
        bbox: det_bbox.to_vec(),
        with_bbox: true,
        ..Default::default()
    };
    if det_bbox.len() >= 5 {
        det.with_angle = true;
        det.angle = det_bbox[4];
    }
    let entry = ResultEntry::local(0, 0, Some(image.state.clone()), vec![det]);
    ModuleInput {
        images: vec![image],
        results: vec![entry],
        extra: vec![ModuleChannel::new(Vec::new(), vec![cls_entry(label)], Vec::new())],
        ..Default::default()
    }
}

#[test]
fn rotate_180_reboxes_axis_aligned_detections() {
    let mut module = create_rotate_by_cls(seed(json!({
        "rotate180_labels": ["upside_down"],
    })));
    let out = module
        .process(rotate_input(&[10.0, 20.0, 30.0, 40.0], "upside_down"), &mut ExecutionContext::new())
        .unwrap();

    // four corners through [[-1,0,99],[0,-1,99]], then AABB
    let det = &out.results[0].sample_results[0];
    assert_eq!(det.bbox, vec![59.0, 39.0, 30.0, 40.0]);
    assert!(!det.with_angle);

    let affine = out.images[0].state.affine();
    assert_eq!(affine, [-1.0, 0.0, 99.0, 0.0, -1.0, 99.0]);
    assert_eq!(out.images[0].state.output_size, Some([100, 100]));
}

#[test]
fn rotate_90_moves_rotated_centres_and_wraps_angles() {
    let mut module = create_rotate_by_cls(seed(json!({
        "rotate90_labels": ["sideways"],
    })));
    let out = module
        .process(rotate_input(&[50.0, 50.0, 40.0, 20.0, 0.5], "sideways"), &mut ExecutionContext::new())
        .unwrap();

    let det = &out.results[0].sample_results[0];
    // (x,y) -> (y, 99 - x)
    assert!((det.bbox[0] - 50.0).abs() < 1e-9);
    assert!((det.bbox[1] - 49.0).abs() < 1e-9);
    assert!((det.bbox[2] - 40.0).abs() < 1e-9);
    assert!((det.bbox[3] - 20.0).abs() < 1e-9);
    assert!((det.bbox[4] - (0.5 + FRAC_PI_2)).abs() < 1e-9);
    assert!(det.with_angle);

    // frame dimensions swap
    assert_eq!(out.images[0].image.width(), 100);
    assert_eq!(out.images[0].state.output_size, Some([100, 100]));
}

#[test]
fn unknown_label_leaves_image_and_results_alone() {
    let mut module = create_rotate_by_cls(seed(json!({
        "rotate90_labels": ["sideways"],
    })));
    let out = module
        .process(rotate_input(&[10.0, 20.0, 30.0, 40.0], "fine"), &mut ExecutionContext::new())
        .unwrap();

    let det = &out.results[0].sample_results[0];
    assert_eq!(det.bbox, vec![10.0, 20.0, 30.0, 40.0]);
    assert!(out.images[0].state.affine_2x3.is_some()); // identity, derived
    assert_eq!(out.images[0].state.affine(), visionflow_core::transform::IDENTITY_2X3);
}

#[test]
fn mask_to_rbox_fits_the_minimum_rectangle() {
    let strip = GrayImage::from_fn(10, 4, |_, _| Luma([255]));
    let det = Detection {
        category_name: "blob".to_string(),
        bbox: vec![5.0, 7.0, 10.0, 4.0],
        with_bbox: true,
        with_mask: true,
        mask_rle: Some(MaskRle::encode_gray(&strip)),
        ..Default::default()
    };
    let maskless = Detection {
        category_name: "no_mask".to_string(),
        bbox: vec![0.0, 0.0, 3.0, 3.0],
        with_bbox: true,
        ..Default::default()
    };
    let image = ModuleImage::root(rgb_image(40, 40), 0);
    let entry = ResultEntry::local(0, 0, Some(image.state.clone()), vec![det, maskless]);

    let mut module = create_mask_to_rbox(seed(json!({})));
    let out = module
        .process(
            ModuleInput {
                images: vec![image],
                results: vec![entry],
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();

    // maskless detections drop; the masked one becomes a rotated box
    assert_eq!(out.results[0].sample_results.len(), 1);
    let rbox = &out.results[0].sample_results[0];
    assert_eq!(rbox.bbox.len(), 5);
    assert!((rbox.bbox[0] - 9.5).abs() < 1e-6);
    assert!((rbox.bbox[1] - 8.5).abs() < 1e-6);
    assert!(rbox.bbox[2] >= rbox.bbox[3]); // long side first
    assert!((rbox.bbox[2] - 9.0).abs() < 1e-6);
    assert!((rbox.bbox[3] - 3.0).abs() < 1e-6);
    assert!(rbox.bbox[4].abs() < 1e-6);
    assert!(rbox.with_angle);
    assert!(rbox.mask_rle.is_none());
}

#[test]
fn rbox_correction_undoes_the_carried_rotation() {
    let theta = 0.3f64;
    let image = rgb_image(60, 60);
    let mut wrap = ModuleImage::root(image, 0);
    wrap.state.affine_2x3 = Some([
        theta.cos(),
        -theta.sin(),
        0.0,
        theta.sin(),
        theta.cos(),
        0.0,
    ]);

    let mut det = Detection {
        category_name: "obj".to_string(),
        bbox: vec![30.0, 30.0, 10.0, 6.0, theta],
        with_bbox: true,
        with_angle: true,
        angle: theta,
        ..Default::default()
    };
    det.mask_rle = Some(MaskRle {
        width: 2,
        height: 2,
        runs: vec![0, 4],
    });
    let entry = ResultEntry::local(0, 0, Some(wrap.state.clone()), vec![det]);

    let mut module = create_rbox_correction(seed(json!({})));
    let out = module
        .process(
            ModuleInput {
                images: vec![wrap],
                results: vec![entry],
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();

    // the entry transform is re-derived through the correction affine
    let parent_affine = [
        theta.cos(),
        -theta.sin(),
        0.0,
        theta.sin(),
        theta.cos(),
        0.0,
    ];
    let correction = rotation_about(30.0, 30.0, -theta.to_degrees());
    let expected = to_2x3(mul_3x3(to_3x3(correction), to_3x3(parent_affine)));
    let affine = out.results[0].transform.as_ref().unwrap().affine();
    for (got, want) in affine.iter().zip(&expected) {
        assert!((got - want).abs() < 1e-9);
    }

    let det = &out.results[0].sample_results[0];
    assert_eq!(det.bbox.len(), 5);
    // the box centre sits on the rotation pivot, so it stays put
    assert!((det.bbox[0] - 30.0).abs() < 1e-6);
    assert!((det.bbox[1] - 30.0).abs() < 1e-6);
    assert!((det.bbox[4] - theta).abs() < 1e-9); // angle value untouched
    assert!(det.mask_rle.is_none()); // masks are not warped, they drop
}
