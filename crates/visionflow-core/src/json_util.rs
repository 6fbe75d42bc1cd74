//! Best-effort JSON readers.
//!
//! Graph properties come from hand-edited pipeline files, so every reader
//! treats a malformed field as absent and falls back to its default.

use serde_json::Value;

/// Integer from a number, float, or numeric string.
pub fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            s.trim().parse::<f64>().ok().map(|f| f.round() as i64)
        }),
        _ => None,
    }
}

pub fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.as_str() {
            "1" | "true" | "True" | "TRUE" => Some(true),
            "0" | "false" | "False" | "FALSE" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// String from a string value; any other non-null value is dumped as JSON.
pub fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn field<'a>(props: &'a Value, key: &str) -> Option<&'a Value> {
    props.as_object().and_then(|m| m.get(key))
}

pub fn read_i64(props: &Value, key: &str, default: i64) -> i64 {
    field(props, key).and_then(as_i64).unwrap_or(default)
}

pub fn read_f64(props: &Value, key: &str, default: f64) -> f64 {
    field(props, key).and_then(as_f64).unwrap_or(default)
}

pub fn read_bool(props: &Value, key: &str, default: bool) -> bool {
    field(props, key).and_then(as_bool).unwrap_or(default)
}

pub fn read_string(props: &Value, key: &str, default: &str) -> String {
    match field(props, key) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => default.to_string(),
        Some(Value::String(_)) => default.to_string(),
        Some(other) => other.to_string(),
    }
}

/// Optional float: present and parseable, or `None`.
pub fn read_opt_f64(props: &Value, key: &str) -> Option<f64> {
    field(props, key).and_then(as_f64)
}

/// `[a, b]` array or `"a,b"` / `"a;b"` / `"a b"` string.
pub fn read_i64_pair(props: &Value, key: &str, default: (i64, i64)) -> (i64, i64) {
    let Some(v) = field(props, key) else {
        return default;
    };
    match v {
        Value::Array(arr) if arr.len() >= 2 => {
            match (as_i64(&arr[0]), as_i64(&arr[1])) {
                (Some(a), Some(b)) => (a, b),
                _ => default,
            }
        }
        Value::String(s) => {
            let parts: Vec<&str> = s
                .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() >= 2 {
                match (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                    (Ok(a), Ok(b)) => (a, b),
                    _ => default,
                }
            } else {
                default
            }
        }
        _ => default,
    }
}

/// A string array, or a single string treated as a one-element list.
pub fn read_string_list(props: &Value, key: &str) -> Vec<String> {
    match field(props, key) {
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// A string → string map, either inline or as a JSON-encoded string.
pub fn read_string_map(props: &Value, key: &str) -> Vec<(String, String)> {
    fn collect(obj: &Value) -> Vec<(String, String)> {
        obj.as_object()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        (k.clone(), as_string(v).unwrap_or_default())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    match field(props, key) {
        Some(v @ Value::Object(_)) => collect(v),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .map(|v| collect(&v))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tolerant_readers_fall_back_to_defaults() {
        let props = json!({
            "a": "12", "b": 3.6, "c": {"x": 1}, "d": "true", "e": null,
            "pair": "640, 480", "list": ["x", "y"],
        });
        assert_eq!(read_i64(&props, "a", 0), 12);
        assert_eq!(read_i64(&props, "b", 0), 4);
        assert_eq!(read_i64(&props, "c", 7), 7);
        assert_eq!(read_i64(&props, "missing", -1), -1);
        assert!(read_bool(&props, "d", false));
        assert_eq!(read_string(&props, "e", "dv"), "dv");
        assert_eq!(read_i64_pair(&props, "pair", (0, 0)), (640, 480));
        assert_eq!(read_string_list(&props, "list"), vec!["x", "y"]);
    }
}
