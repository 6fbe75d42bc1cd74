//! Sliding-window tiling and merge behaviour.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{in_port, install_backend, node, out_port, raw_det, rgb_image};
use visionflow_core::channel::ModuleImage;
use visionflow_core::context::{keys, ExecutionContext};
use visionflow_core::executor::GraphExecutor;
use visionflow_core::module::{Module, ModuleInput, NodeSeed};
use visionflow_core::modules::sliding::{create_sliding_merge, create_sliding_window};
use visionflow_core::transform::{apply_2x3, IDENTITY_2X3};

fn seed(props: serde_json::Value) -> NodeSeed {
    NodeSeed {
        node_id: 1,
        title: String::new(),
        properties: props,
    }
}

fn window_input(w: u32, h: u32) -> ModuleInput {
    ModuleInput {
        images: vec![ModuleImage::root(rgb_image(w, h), 0)],
        ..Default::default()
    }
}

#[test]
fn tiles_cover_the_frame_without_leaving_it() {
    let mut module = create_sliding_window(seed(json!({
        "window_size": [64, 64],
        "overlap": [0, 0],
    })));
    let out = module
        .process(window_input(128, 64), &mut ExecutionContext::new())
        .unwrap();

    assert_eq!(out.images.len(), 2);
    assert_eq!(out.results.len(), 2);
    let meta = out.results[1].sliding_meta.as_ref().unwrap();
    assert_eq!(meta.grid_size, [2, 1]);
    assert_eq!(meta.slice_index, [0, 1]);
    assert_eq!((meta.x, meta.y, meta.w, meta.h), (64, 0, 64, 64));

    // the second tile's state maps original (64, 0) to its own (0, 0)
    let affine = out.images[1].state.affine();
    assert_eq!(apply_2x3(affine, 64.0, 0.0), (0.0, 0.0));
}

#[test]
fn oversized_window_emits_one_identity_tile() {
    let mut module = create_sliding_window(seed(json!({
        "window_size": [512, 512],
        "overlap": [0, 0],
    })));
    let out = module
        .process(window_input(100, 80), &mut ExecutionContext::new())
        .unwrap();

    assert_eq!(out.images.len(), 1);
    assert_eq!(out.images[0].state.affine(), IDENTITY_2X3);
    assert_eq!(out.images[0].state.output_size, Some([100, 80]));
}

#[test]
fn last_tile_is_right_aligned() {
    let mut module = create_sliding_window(seed(json!({
        "window_size": [64, 64],
        "overlap": [0, 0],
    })));
    let out = module
        .process(window_input(64, 100), &mut ExecutionContext::new())
        .unwrap();

    assert_eq!(out.results.len(), 2);
    let meta = out.results[1].sliding_meta.as_ref().unwrap();
    assert_eq!(meta.y, 36); // 100 - 64, never past the frame
}

#[test]
fn merge_keeps_only_identity_inputs_as_originals() {
    let mut window = create_sliding_window(seed(json!({
        "window_size": [32, 32],
        "overlap": [0, 0],
    })));
    let tiled = window
        .process(window_input(64, 64), &mut ExecutionContext::new())
        .unwrap();
    assert_eq!(tiled.images.len(), 4);

    // original + tiles flow into merge; only the original survives
    let mut images = vec![ModuleImage::root(rgb_image(64, 64), 0)];
    images.extend(tiled.images);
    let mut results = tiled.results;
    for (i, entry) in results.iter_mut().enumerate() {
        entry.sample_results = vec![visionflow_core::channel::Detection {
            category_name: format!("d{i}"),
            bbox: vec![1.0, 1.0, 2.0, 2.0],
            with_bbox: true,
            ..Default::default()
        }];
    }

    let mut merge = create_sliding_merge(seed(json!({})));
    let merged = merge
        .process(
            ModuleInput {
                images,
                results,
                ..Default::default()
            },
            &mut ExecutionContext::new(),
        )
        .unwrap();

    assert_eq!(merged.images.len(), 1);
    assert_eq!(merged.results.len(), 1);
    assert!(merged.results[0].transform.is_none());
    assert_eq!(merged.results[0].sample_results.len(), 4);
}

#[test]
fn window_then_merge_preserves_detection_count_through_a_graph() {
    // input -> sliding_window -> det -> merge (images from input, results
    // from det) -> return_json
    install_backend(&[(
        "fake://sliding/det",
        vec![raw_det("obj", 0.8, &[4.0, 4.0, 8.0, 8.0])],
    )]);
    let nodes = vec![
        node(1, "input/image", 0, json!({}), vec![], vec![
            out_port("image", "image_chan", &[1, 10]),
            out_port("results", "result_chan", &[]),
        ]),
        node(2, "features/sliding_window", 1, json!({
            "window_size": [64, 64],
            "overlap": [0, 0],
        }), vec![
            in_port("image", "image_chan", Some(1)),
            in_port("results", "result_chan", None),
        ], vec![
            out_port("image", "image_chan", &[2]),
            out_port("results", "result_chan", &[]),
        ]),
        node(3, "model/det", 2, json!({ "model_path": "fake://sliding/det" }), vec![
            in_port("image", "image_chan", Some(2)),
            in_port("results", "result_chan", None),
        ], vec![
            out_port("image", "image_chan", &[]),
            out_port("results", "result_chan", &[3]),
        ]),
        node(4, "features/sliding_merge", 3, json!({}), vec![
            in_port("image", "image_chan", Some(10)),
            in_port("results", "result_chan", Some(3)),
        ], vec![
            out_port("image", "image_chan", &[4]),
            out_port("results", "result_chan", &[5]),
        ]),
        node(5, "output/return_json", 4, json!({}), vec![
            in_port("image", "image_chan", Some(4)),
            in_port("results", "result_chan", Some(5)),
        ], vec![]),
    ];

    let exec = GraphExecutor::new(&nodes);
    let mut ctx = ExecutionContext::new();
    ctx.set_image(keys::FRONTEND_IMAGE_MAT, Arc::new(rgb_image(128, 64)));
    ctx.set_int(keys::DEVICE_ID, 0);
    exec.run(&mut ctx).unwrap();

    let payload = ctx
        .get_json(keys::FRONTEND_JSON)
        .and_then(|v| v.get("last"))
        .cloned()
        .unwrap();
    let by_image = payload["by_image"].as_array().unwrap();
    assert_eq!(by_image.len(), 1);
    // one detection per tile, two tiles
    assert_eq!(by_image[0]["results"].as_array().unwrap().len(), 2);
}
