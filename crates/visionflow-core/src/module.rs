//! The module contract: one `process` entry point per node, plus an
//! optional model pre-load hook.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::channel::{ModuleChannel, ModuleImage, ResultEntry, ScalarValue};
use crate::context::ExecutionContext;

/// What a factory receives when the executor instantiates a node.
#[derive(Debug, Clone)]
pub struct NodeSeed {
    pub node_id: i64,
    pub title: String,
    pub properties: Value,
}

/// Aggregated inputs for one node invocation. The main pair is unpacked
/// into `images` / `results` / `templates`; extra pairs arrive in order.
#[derive(Debug, Default)]
pub struct ModuleInput {
    pub images: Vec<ModuleImage>,
    pub results: Vec<ResultEntry>,
    pub templates: Vec<Value>,
    pub extra: Vec<ModuleChannel>,
    pub scalars_by_index: BTreeMap<usize, ScalarValue>,
    pub scalars_by_name: BTreeMap<String, ScalarValue>,
}

/// Everything a node hands back: the main channel, extra output pairs, and
/// named scalar outputs.
#[derive(Debug, Default)]
pub struct ModuleOutput {
    pub images: Vec<ModuleImage>,
    pub results: Vec<ResultEntry>,
    pub templates: Vec<Value>,
    pub extra: Vec<ModuleChannel>,
    pub scalars: BTreeMap<String, ScalarValue>,
}

impl ModuleOutput {
    pub fn main(images: Vec<ModuleImage>, results: Vec<ResultEntry>) -> Self {
        ModuleOutput {
            images,
            results,
            ..Default::default()
        }
    }

    pub fn passthrough(input: ModuleInput) -> Self {
        ModuleOutput {
            images: input.images,
            results: input.results,
            ..Default::default()
        }
    }
}

pub trait Module {
    /// Pre-loads the node's model. Only `model/*` nodes do anything here.
    fn load_model(&mut self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(
        &mut self,
        input: ModuleInput,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModuleOutput>;
}
