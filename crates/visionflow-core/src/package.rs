//! Pipeline package loader.
//!
//! A package is a binary stream: the literal bytes `D V \n`, one UTF-8
//! line with `{"file_list": [...], "file_size": [...]}`, then the file
//! bodies concatenated in declared order. One entry must be
//! `pipeline.json`. Everything else is unpacked into a scoped temp
//! directory under a random name, and the graph's `model_path` references
//! are rewritten to the unpacked locations.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use rand::RngCore;
use serde_json::Value;
use tempfile::TempDir;
use tracing::info;

use crate::error::Error;

pub const PACKAGE_MAGIC: [u8; 3] = *b"DV\n";

#[derive(Debug)]
pub struct UnpackedPackage {
    pub pipeline_root: Value,
    /// Deleted on drop; the facade keeps it alive while models read from
    /// it.
    pub dir: TempDir,
}

/// True when the file starts with the package magic.
pub fn is_package_file(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 3];
    file.read_exact(&mut magic).is_ok() && magic == PACKAGE_MAGIC
}

fn bad(msg: impl Into<String>) -> Error {
    Error::Package(msg.into())
}

fn random_file_name(original: &str) -> String {
    let ext = Path::new(original)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".tmp".to_string());
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", hex::encode(bytes), ext)
}

fn file_name_only(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn copy_exact(reader: &mut impl Read, writer: &mut impl io::Write, len: u64) -> Result<(), Error> {
    let copied = io::copy(&mut reader.take(len), writer)?;
    if copied != len {
        return Err(bad("truncated file body in package"));
    }
    Ok(())
}

/// Rewrites every `nodes[*].properties.model_path` that resolves in the
/// unpack table (full name first, then basename, both lowercased).
fn rewrite_model_paths(
    pipeline_root: &mut Value,
    files: &HashMap<String, String>,
) -> Result<(), Error> {
    let nodes = pipeline_root
        .get_mut("nodes")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::Graph("pipeline.json missing nodes array".to_string()))?;

    for node in nodes {
        let Some(props) = node.get_mut("properties").and_then(Value::as_object_mut) else {
            continue;
        };
        let Some(model_path) = props.get("model_path").and_then(Value::as_str) else {
            continue;
        };
        let resolved = files
            .get(&model_path.to_lowercase())
            .or_else(|| files.get(&file_name_only(model_path).to_lowercase()));
        if let Some(new_path) = resolved {
            props.insert("model_path".to_string(), Value::from(new_path.clone()));
        }
    }
    Ok(())
}

/// Unpacks the archive into a fresh temp directory and returns the
/// rewritten graph. The directory is deleted on any error path (the
/// returned guard still owns it on success).
pub fn unpack_to_temp(path: &Path) -> Result<UnpackedPackage, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    // 1. Magic + header line.
    let mut magic = [0u8; 3];
    reader
        .read_exact(&mut magic)
        .map_err(|_| bad("missing package magic"))?;
    if magic != PACKAGE_MAGIC {
        return Err(bad("missing package magic"));
    }
    let mut header_line = Vec::new();
    reader.read_until(b'\n', &mut header_line)?;
    if header_line.last() == Some(&b'\n') {
        header_line.pop();
    }
    if header_line.is_empty() {
        return Err(bad("missing package header line"));
    }
    let header: Value = serde_json::from_slice(&header_line)
        .map_err(|e| bad(format!("header is not valid JSON: {e}")))?;
    let file_list = header
        .get("file_list")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("header missing file_list"))?;
    let file_size = header
        .get("file_size")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("header missing file_size"))?;
    if file_list.len() != file_size.len() {
        return Err(bad("file_list/file_size length mismatch"));
    }

    // 2. Unpack bodies. The temp dir is dropped (deleted) on any error.
    let dir = tempfile::Builder::new()
        .prefix("visionflow-pkg-")
        .tempdir()?;
    let mut files: HashMap<String, String> = HashMap::new();
    let mut pipeline_root: Option<Value> = None;

    for (name_v, size_v) in file_list.iter().zip(file_size) {
        let name = name_v
            .as_str()
            .ok_or_else(|| bad("file_list entry is not a string"))?;
        let size = crate::json_util::as_i64(size_v)
            .filter(|s| *s >= 0)
            .ok_or_else(|| bad("invalid file size in header"))? as u64;

        if name.to_lowercase() == "pipeline.json" {
            let mut text = String::new();
            let read = reader
                .by_ref()
                .take(size)
                .read_to_string(&mut text)
                .map_err(|_| bad("failed to read pipeline.json body"))?;
            if read as u64 != size {
                return Err(bad("truncated pipeline.json body"));
            }
            let root: Value = serde_json::from_str(&text)
                .map_err(|e| Error::Graph(format!("pipeline.json is not valid JSON: {e}")))?;
            pipeline_root = Some(root);
        } else {
            let out_path = dir.path().join(random_file_name(name));
            let mut out = File::create(&out_path)?;
            copy_exact(&mut reader, &mut out, size)?;
            let full = out_path.to_string_lossy().into_owned();
            files.insert(name.to_lowercase(), full.clone());
            files.insert(file_name_only(name).to_lowercase(), full);
        }
    }

    let mut pipeline_root =
        pipeline_root.ok_or_else(|| bad("pipeline.json not found in package"))?;
    if !pipeline_root.is_object() {
        return Err(Error::Graph("pipeline root is not an object".to_string()));
    }
    rewrite_model_paths(&mut pipeline_root, &files)?;

    // 3. Persist the rewritten graph next to the unpacked models.
    let rewritten = serde_json::to_string(&pipeline_root)
        .map_err(|e| bad(format!("failed to serialise rewritten graph: {e}")))?;
    std::fs::write(dir.path().join("pipeline.json"), rewritten)?;

    info!(
        dir = %dir.path().display(),
        files = files.len() / 2,
        "pipeline package unpacked"
    );
    Ok(UnpackedPackage { pipeline_root, dir })
}

/// Serialises a package from `(name, bytes)` pairs; the writer-side twin
/// of [`unpack_to_temp`], used by tooling and tests.
pub fn write_package(
    path: &Path,
    files: &[(&str, &[u8])],
) -> Result<(), Error> {
    use std::io::Write;

    let names: Vec<&str> = files.iter().map(|(n, _)| *n).collect();
    let sizes: Vec<usize> = files.iter().map(|(_, b)| b.len()).collect();
    let header = serde_json::json!({ "file_list": names, "file_size": sizes });

    let mut out = File::create(path)?;
    out.write_all(&PACKAGE_MAGIC)?;
    out.write_all(header.to_string().as_bytes())?;
    out.write_all(b"\n")?;
    for (_, bytes) in files {
        out.write_all(bytes)?;
    }
    Ok(())
}
