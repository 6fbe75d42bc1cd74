//! Graph executor: port routing, scalar propagation, ordered module
//! dispatch, and the model pre-load pass.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::{ModuleChannel, ModuleImage, ResultEntry, ScalarValue};
use crate::context::ExecutionContext;
use crate::error::Error;
use crate::json_util;
use crate::module::{ModuleInput, NodeSeed};
use crate::registry::{self, ModuleRegistry};

/// Input or output port of a node. `kind` is stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct PortSpec {
    pub name: String,
    pub kind: String,
    pub link: Option<i64>,
    pub links: Vec<i64>,
}

/// One node of the pipeline graph, read tolerantly from its JSON record.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: i64,
    pub node_type: String,
    pub title: String,
    pub order: i64,
    pub properties: Value,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
}

const ORDER_LAST: i64 = i64::MAX - 1;

fn parse_port(v: &Value) -> PortSpec {
    let obj = match v.as_object() {
        Some(o) => o,
        None => return PortSpec::default(),
    };
    PortSpec {
        name: obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        kind: obj
            .get("type")
            .and_then(json_util::as_string)
            .unwrap_or_default()
            .to_lowercase(),
        link: obj
            .get("link")
            .and_then(json_util::as_i64)
            .filter(|id| *id >= 0),
        links: obj
            .get("links")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(json_util::as_i64)
                    .filter(|id| *id >= 0)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

impl NodeSpec {
    pub fn from_value(v: &Value, fallback_id: i64) -> Option<NodeSpec> {
        let obj = v.as_object()?;
        let ports = |key: &str| -> Vec<PortSpec> {
            obj.get(key)
                .and_then(Value::as_array)
                .map(|arr| arr.iter().map(parse_port).collect())
                .unwrap_or_default()
        };
        Some(NodeSpec {
            id: obj.get("id").and_then(json_util::as_i64).unwrap_or(fallback_id),
            node_type: obj
                .get("type")
                .and_then(json_util::as_string)
                .unwrap_or_default(),
            title: obj
                .get("title")
                .and_then(json_util::as_string)
                .unwrap_or_default(),
            order: obj.get("order").and_then(json_util::as_i64).unwrap_or(ORDER_LAST),
            properties: obj
                .get("properties")
                .filter(|p| p.is_object())
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            inputs: ports("inputs"),
            outputs: ports("outputs"),
        })
    }
}

pub fn is_scalar_kind(kind: &str) -> bool {
    matches!(
        kind,
        "bool" | "boolean" | "int" | "integer" | "str" | "string" | "scalar"
    )
}

/// Graph-authoring convenience: when the properties carry an XYXY region
/// (`bbox_x1..bbox_y2`), synthesise the XYWH fields the modules read.
pub fn normalize_bbox_properties(props: &mut Value) {
    let Some(obj) = props.as_object() else { return };
    let corner = |key: &str| obj.get(key).and_then(json_util::as_f64);
    let (Some(x1), Some(y1), Some(x2), Some(y2)) = (
        corner("bbox_x1"),
        corner("bbox_y1"),
        corner("bbox_x2"),
        corner("bbox_y2"),
    ) else {
        return;
    };

    let synth = [
        ("bbox_x", x1.min(x2)),
        ("bbox_y", y1.min(y2)),
        ("bbox_w", (x2 - x1).abs()),
        ("bbox_h", (y2 - y1).abs()),
    ];
    let obj = props.as_object_mut().expect("checked above");
    for (key, value) in synth {
        if !obj.contains_key(key) {
            obj.insert(key.to_string(), Value::from(value));
        }
    }
}

/// Per-node pre-load outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ModelLoadStatus {
    pub node_id: i64,
    #[serde(rename = "type")]
    pub node_type: String,
    pub title: String,
    pub model_path: String,
    pub status_code: i32,
    pub status_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub code: i32,
    pub message: String,
    pub models: Vec<ModelLoadStatus>,
}

impl LoadReport {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// The first failing node's message, the way the facade surfaces it.
    pub fn first_failure_message(&self) -> Option<&str> {
        self.models
            .iter()
            .find(|m| m.status_code != 0)
            .map(|m| m.status_message.as_str())
    }
}

/// The simplified per-node view published for callers, distinct from the
/// full channel set used internally for routing.
#[derive(Debug, Default)]
pub struct NodePublicOutput {
    pub images: Vec<ModuleImage>,
    pub results: Vec<ResultEntry>,
    pub templates: Vec<Value>,
    pub scalars_by_index: BTreeMap<usize, ScalarValue>,
}

/// Full output of one executed node, kept for downstream routing.
#[derive(Debug, Default)]
struct NodeExecOutput {
    main: ModuleChannel,
    extra: Vec<ModuleChannel>,
}

pub struct GraphExecutor<'r> {
    nodes: Vec<NodeSpec>,
    registry: &'r ModuleRegistry,
}

impl GraphExecutor<'static> {
    /// Executor over the built-in module registry.
    pub fn new(nodes: &[Value]) -> Self {
        Self::with_registry(nodes, registry::builtin())
    }
}

impl<'r> GraphExecutor<'r> {
    pub fn with_registry(nodes: &[Value], registry: &'r ModuleRegistry) -> Self {
        let mut specs: Vec<NodeSpec> = nodes
            .iter()
            .enumerate()
            .filter_map(|(i, v)| NodeSpec::from_value(v, i as i64))
            .collect();
        // Stable order: `order` ascending, then id. Nodes without an order
        // run last.
        specs.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));
        GraphExecutor {
            nodes: specs,
            registry,
        }
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// linkId -> (source node id, source output port index). First writer
    /// wins, matching the declaration order of the graph.
    fn build_link_source_map(&self) -> HashMap<i64, (i64, usize)> {
        let mut map = HashMap::new();
        for node in &self.nodes {
            for (oi, port) in node.outputs.iter().enumerate() {
                for &link in &port.links {
                    map.entry(link).or_insert((node.id, oi));
                }
            }
        }
        map
    }

    /// Aggregates a node's channel input ports into pairs: ports `(2k,
    /// 2k+1)` form pair `k`, each port filling the slot matching its kind.
    fn collect_input_pairs(
        &self,
        node: &NodeSpec,
        link_to_source: &HashMap<i64, (i64, usize)>,
        exec_map: &HashMap<i64, NodeExecOutput>,
    ) -> BTreeMap<usize, ModuleChannel> {
        let mut pairs: BTreeMap<usize, ModuleChannel> = BTreeMap::new();

        for (ii, port) in node.inputs.iter().enumerate() {
            if is_scalar_kind(&port.kind) {
                continue; // injected separately
            }
            let Some(link) = port.link else { continue };
            let Some(&(src_id, src_out_idx)) = link_to_source.get(&link) else {
                continue;
            };
            let Some(src_out) = exec_map.get(&src_id) else {
                continue;
            };

            let src_pair = src_out_idx / 2;
            let picked = if src_pair == 0 {
                Some(&src_out.main)
            } else {
                src_out.extra.get(src_pair - 1)
            };
            let Some(picked) = picked else { continue };

            let slot = pairs.entry(ii / 2).or_default();
            match port.kind.as_str() {
                "image_chan" => slot.images = picked.images.clone(),
                "result_chan" => slot.results = picked.results.clone(),
                "template_chan" | "template" => slot.templates = picked.templates.clone(),
                _ => {} // unknown channel kind: ignored
            }
        }

        pairs
    }

    fn collect_scalar_inputs(
        node: &NodeSpec,
        link_to_source: &HashMap<i64, (i64, usize)>,
        public: &BTreeMap<i64, NodePublicOutput>,
    ) -> (BTreeMap<usize, ScalarValue>, BTreeMap<String, ScalarValue>) {
        let mut by_index = BTreeMap::new();
        let mut by_name = BTreeMap::new();

        for (ii, port) in node.inputs.iter().enumerate() {
            if !is_scalar_kind(&port.kind) {
                continue;
            }
            let Some(link) = port.link else { continue };
            let Some(&(src_id, src_out_idx)) = link_to_source.get(&link) else {
                continue;
            };
            let Some(value) = public
                .get(&src_id)
                .and_then(|p| p.scalars_by_index.get(&src_out_idx))
            else {
                continue;
            };

            by_index.insert(ii, value.clone());
            if !port.name.is_empty() {
                by_name.insert(port.name.clone(), value.clone());
            }
        }

        (by_index, by_name)
    }

    /// Normalises a node's scalar outputs to the declared port types and
    /// indexes them by output port.
    fn publish_scalars(
        node: &NodeSpec,
        named: &BTreeMap<String, ScalarValue>,
    ) -> BTreeMap<usize, ScalarValue> {
        let mut out = BTreeMap::new();
        for (oi, port) in node.outputs.iter().enumerate() {
            if !is_scalar_kind(&port.kind) {
                continue;
            }
            let value = named
                .get(&port.name)
                .or_else(|| named.get(&oi.to_string()))
                .cloned()
                .unwrap_or(ScalarValue::Json(Value::Null));

            let normalised = match port.kind.as_str() {
                "bool" | "boolean" => ScalarValue::Bool(value.coerce_bool()),
                "int" | "integer" => ScalarValue::Int(value.coerce_i64()),
                _ => ScalarValue::Str(value.coerce_string()),
            };
            out.insert(oi, normalised);
        }
        out
    }

    /// Executes every node in order and returns the public outputs by node
    /// id. Any module failure aborts the run.
    pub fn run(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<BTreeMap<i64, NodePublicOutput>, Error> {
        let link_to_source = self.build_link_source_map();
        let mut exec_map: HashMap<i64, NodeExecOutput> = HashMap::new();
        let mut public: BTreeMap<i64, NodePublicOutput> = BTreeMap::new();

        for node in &self.nodes {
            let Some(factory) = self.registry.get(&node.node_type) else {
                debug!(node_id = node.id, node_type = %node.node_type, "no module registered, skipping node");
                continue;
            };

            let mut props = node.properties.clone();
            normalize_bbox_properties(&mut props);

            let mut module = factory(NodeSeed {
                node_id: node.id,
                title: node.title.clone(),
                properties: props,
            });

            let mut pairs = self.collect_input_pairs(node, &link_to_source, &exec_map);
            let main = pairs.remove(&0).unwrap_or_default();
            let extra: Vec<ModuleChannel> = pairs.into_values().collect();
            let (scalars_by_index, scalars_by_name) =
                Self::collect_scalar_inputs(node, &link_to_source, &public);

            let input = ModuleInput {
                images: main.images,
                results: main.results,
                templates: main.templates,
                extra,
                scalars_by_index,
                scalars_by_name,
            };

            debug!(node_id = node.id, node_type = %node.node_type, "executing node");
            let output = module.process(input, ctx).map_err(|source| Error::Module {
                node_id: node.id,
                node_type: node.node_type.clone(),
                source,
            })?;

            let scalars_by_index = Self::publish_scalars(node, &output.scalars);
            public.insert(
                node.id,
                NodePublicOutput {
                    images: output.images.clone(),
                    results: output.results.clone(),
                    templates: output.templates.clone(),
                    scalars_by_index,
                },
            );
            exec_map.insert(
                node.id,
                NodeExecOutput {
                    main: ModuleChannel::new(output.images, output.results, output.templates),
                    extra: output.extra,
                },
            );
        }

        Ok(public)
    }

    /// Pre-load pass: instantiates every `model/*` node and loads its
    /// model. Failures are accumulated, not propagated.
    pub fn load_models(&self, ctx: &mut ExecutionContext) -> LoadReport {
        let mut models = Vec::new();
        let mut failures = 0usize;

        for node in &self.nodes {
            if !node.node_type.starts_with("model/") {
                continue;
            }
            let model_path = json_util::read_string(&node.properties, "model_path", "");
            let mut status = ModelLoadStatus {
                node_id: node.id,
                node_type: node.node_type.clone(),
                title: node.title.clone(),
                model_path,
                status_code: 0,
                status_message: "ok".to_string(),
            };

            match self.registry.get(&node.node_type) {
                None => {
                    failures += 1;
                    status.status_code = 1;
                    status.status_message = "module_not_registered".to_string();
                }
                Some(factory) => {
                    let mut module = factory(NodeSeed {
                        node_id: node.id,
                        title: node.title.clone(),
                        properties: node.properties.clone(),
                    });
                    if let Err(e) = module.load_model(ctx) {
                        warn!(node_id = node.id, node_type = %node.node_type, error = %e, "model pre-load failed");
                        failures += 1;
                        status.status_code = 1;
                        status.status_message = format!("{e:#}");
                    }
                }
            }
            models.push(status);
        }

        LoadReport {
            code: i32::from(failures > 0),
            message: if failures == 0 {
                "all models loaded".to_string()
            } else {
                format!("models loaded with {failures} error(s)")
            },
            models,
        }
    }
}
