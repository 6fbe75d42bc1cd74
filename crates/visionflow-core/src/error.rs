use thiserror::Error;

/// Error taxonomy of the public API.
///
/// Module implementations use `anyhow` internally; the executor wraps any
/// node failure into [`Error::Module`] with the node id and type attached.
#[derive(Debug, Error)]
pub enum Error {
    /// The pipeline package archive is malformed (bad magic, header
    /// mismatch, truncated body, missing pipeline.json).
    #[error("invalid pipeline package: {0}")]
    Package(String),

    /// The graph JSON is malformed (root is not an object, missing nodes).
    #[error("invalid pipeline graph: {0}")]
    Graph(String),

    /// Inference was requested before a successful load.
    #[error("pipeline not loaded")]
    NotLoaded,

    /// The input image has zero width or height.
    #[error("input image is empty")]
    ImageEmpty,

    /// A node failed during graph execution.
    #[error("node {node_id} ({node_type}) failed: {source}")]
    Module {
        node_id: i64,
        node_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// The inference backend refused an operation or is not registered.
    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
