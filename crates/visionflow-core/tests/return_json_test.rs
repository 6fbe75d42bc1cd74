//! Terminal JSON emission: projection back to original coordinates.

mod common;

use std::sync::Arc;

use image::{GrayImage, Luma};
use serde_json::{json, Value};

use common::{in_port, install_backend, node, out_port, raw_det, rgb_image};
use visionflow_core::context::{keys, ExecutionContext};
use visionflow_core::executor::GraphExecutor;

fn run_graph(nodes: &[Value], image_w: u32, image_h: u32) -> Value {
    let exec = GraphExecutor::new(nodes);
    let mut ctx = ExecutionContext::new();
    ctx.set_image(keys::FRONTEND_IMAGE_MAT, Arc::new(rgb_image(image_w, image_h)));
    ctx.set_int(keys::DEVICE_ID, 0);
    exec.run(&mut ctx).unwrap();
    ctx.get_json(keys::FRONTEND_JSON)
        .and_then(|v| v.get("last"))
        .cloned()
        .expect("payload written")
}

fn chain(model_type: &str, model_path: &str) -> Vec<Value> {
    vec![
        node(1, "input/image", 0, json!({}), vec![], vec![
            out_port("image", "image_chan", &[1]),
            out_port("results", "result_chan", &[]),
        ]),
        node(2, model_type, 1, json!({ "model_path": model_path }), vec![
            in_port("image", "image_chan", Some(1)),
            in_port("results", "result_chan", None),
        ], vec![
            out_port("image", "image_chan", &[2]),
            out_port("results", "result_chan", &[3]),
        ]),
        node(3, "output/return_json", 2, json!({}), vec![
            in_port("image", "image_chan", Some(2)),
            in_port("results", "result_chan", Some(3)),
        ], vec![]),
    ]
}

#[test]
fn classification_payload_is_full_frame() {
    install_backend(&[(
        "fake://json/cls",
        vec![raw_det("ok", 0.97, &[0.0, 0.0, 200.0, 150.0])],
    )]);
    let payload = run_graph(&chain("model/cls", "fake://json/cls"), 200, 150);

    let by_image = payload["by_image"].as_array().unwrap();
    assert_eq!(by_image.len(), 1);
    assert_eq!(by_image[0]["origin_index"], 0);
    assert_eq!(by_image[0]["original_size"], json!([200, 150]));

    let result = &by_image[0]["results"][0];
    assert_eq!(result["category_name"], "ok");
    assert_eq!(result["score"], 0.97);
    assert_eq!(result["bbox"], json!([0, 0, 200, 150])); // XYXY
    assert_eq!(result["metadata"]["is_rotated"], false);
}

#[test]
fn rotated_payload_keeps_centre_size_angle() {
    install_backend(&[(
        "fake://json/rotated",
        vec![raw_det("rot", 0.8, &[50.0, 50.0, 40.0, 20.0, 0.5])],
    )]);
    let payload = run_graph(&chain("model/rotated_bbox", "fake://json/rotated"), 100, 100);

    let result = &payload["by_image"][0]["results"][0];
    let bbox = result["bbox"].as_array().unwrap();
    assert!((bbox[0].as_f64().unwrap() - 50.0).abs() < 1e-6);
    assert!((bbox[1].as_f64().unwrap() - 50.0).abs() < 1e-6);
    assert!((bbox[2].as_f64().unwrap() - 40.0).abs() < 1e-6);
    assert!((bbox[3].as_f64().unwrap() - 20.0).abs() < 1e-6);
    assert!((bbox[4].as_f64().unwrap() - 0.5).abs() < 1e-6);
    assert_eq!(result["metadata"]["is_rotated"], true);
}

#[test]
fn build_results_round_trips_to_xyxy() {
    let nodes = vec![
        node(1, "input/build_results", 0, json!({
            "bbox_x": 50.0, "bbox_y": 60.0, "bbox_w": 100.0, "bbox_h": 80.0,
            "category_name": "target",
        }), vec![
            in_port("image", "image_chan", None),
            in_port("results", "result_chan", None),
        ], vec![
            out_port("image", "image_chan", &[1]),
            out_port("results", "result_chan", &[2]),
        ]),
        node(2, "output/return_json", 1, json!({}), vec![
            in_port("image", "image_chan", Some(1)),
            in_port("results", "result_chan", Some(2)),
        ], vec![]),
    ];

    let exec = GraphExecutor::new(&nodes);
    let mut ctx = ExecutionContext::new();
    exec.run(&mut ctx).unwrap();
    let payload = ctx
        .get_json(keys::FRONTEND_JSON)
        .and_then(|v| v.get("last"))
        .cloned()
        .unwrap();

    let result = &payload["by_image"][0]["results"][0];
    assert_eq!(result["category_name"], "target");
    assert_eq!(result["bbox"], json!([50, 60, 150, 140]));
}

#[test]
fn detections_in_a_cropped_frame_project_back() {
    install_backend(&[(
        "fake://json/crop_det",
        vec![raw_det("obj", 0.9, &[5.0, 5.0, 10.0, 10.0])],
    )]);
    let nodes = vec![
        node(1, "input/image", 0, json!({}), vec![], vec![
            out_port("image", "image_chan", &[1]),
            out_port("results", "result_chan", &[]),
        ]),
        node(2, "features/coordinate_crop", 1, json!({
            "x": 10, "y": 20, "w": 50, "h": 50,
        }), vec![
            in_port("image", "image_chan", Some(1)),
            in_port("results", "result_chan", None),
        ], vec![
            out_port("image", "image_chan", &[2]),
            out_port("results", "result_chan", &[]),
        ]),
        node(3, "model/det", 2, json!({ "model_path": "fake://json/crop_det" }), vec![
            in_port("image", "image_chan", Some(2)),
            in_port("results", "result_chan", None),
        ], vec![
            out_port("image", "image_chan", &[3]),
            out_port("results", "result_chan", &[4]),
        ]),
        node(4, "output/return_json", 3, json!({}), vec![
            in_port("image", "image_chan", Some(3)),
            in_port("results", "result_chan", Some(4)),
        ], vec![]),
    ];

    let exec = GraphExecutor::new(&nodes);
    let mut ctx = ExecutionContext::new();
    ctx.set_image(keys::FRONTEND_IMAGE_MAT, Arc::new(rgb_image(100, 100)));
    exec.run(&mut ctx).unwrap();
    let payload = ctx
        .get_json(keys::FRONTEND_JSON)
        .and_then(|v| v.get("last"))
        .cloned()
        .unwrap();

    let entry = &payload["by_image"][0];
    // the original frame, not the crop
    assert_eq!(entry["original_size"], json!([100, 100]));
    assert_eq!(entry["results"][0]["bbox"], json!([15, 25, 25, 35]));
}

#[test]
fn sourceless_graph_publishes_an_empty_payload() {
    let nodes = vec![node(1, "output/return_json", 0, json!({}), vec![
        in_port("image", "image_chan", None),
        in_port("results", "result_chan", None),
    ], vec![])];

    let exec = GraphExecutor::new(&nodes);
    let mut ctx = ExecutionContext::new();
    exec.run(&mut ctx).unwrap();

    let payload = ctx
        .get_json(keys::FRONTEND_JSON)
        .and_then(|v| v.get("last"))
        .cloned()
        .unwrap();
    assert_eq!(payload["by_image"].as_array().unwrap().len(), 0);
}

#[test]
fn masks_are_forwarded_with_a_projected_poly() {
    let mut det = raw_det("seg", 0.9, &[3.0, 4.0, 2.0, 2.0]);
    det.mask = Some(GrayImage::from_pixel(2, 2, Luma([255])));
    install_backend(&[("fake://json/seg", vec![det])]);

    let payload = run_graph(&chain("model/instance_seg", "fake://json/seg"), 20, 20);
    let result = &payload["by_image"][0]["results"][0];

    assert_eq!(result["mask_rle"]["width"], 2);
    assert_eq!(result["mask_rle"]["runs"], json!([0, 4]));
    let poly = result["poly"][0].as_array().unwrap();
    assert_eq!(poly.len(), 4);
    assert_eq!(poly[0], json!([3.0, 4.0])); // bbox origin offset applied
}
