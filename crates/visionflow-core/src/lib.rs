//! # visionflow Core Library
//!
//! Dataflow graph executor for machine-vision inference pipelines.
//!
//! A pipeline is a JSON graph of typed nodes wired by links. Model-bearing
//! nodes are pre-loaded through a pluggable [`backend::InferBackend`], then
//! each input image is pushed through the graph node-by-node. Every image
//! carries a [`transform::TransformationState`] (the affine map from the
//! original frame to the current frame), so the terminal JSON emitter can
//! project detections back onto the original image.

pub mod backend;
pub mod channel;
pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod imgops;
pub mod json_util;
pub mod mask;
pub mod module;
pub mod modules;
pub mod package;
pub mod pool;
pub mod registry;
pub mod transform;

pub use channel::{Detection, ModuleChannel, ModuleImage, ResultEntry, ScalarValue};
pub use error::Error;
pub use graph::PipelineModel;
pub use mask::MaskRle;
pub use transform::TransformationState;
