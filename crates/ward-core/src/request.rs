//! Request and response payloads shared by the listener and its clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Options passed to an action handler, keys in canonical form.
pub type Options = Map<String, Value>;

/// An action request as carried inside a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub options: Options,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeSelector>,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            options: Options::new(),
            method: None,
            node: None,
        }
    }

    /// Builder method: target other nodes.
    pub fn with_node(mut self, node: NodeSelector) -> Self {
        self.node = Some(node);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The `node` field of a request: one node name (or `*`) or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSelector {
    One(String),
    Many(Vec<String>),
}

impl NodeSelector {
    /// Expand to node names. `*` means every node in `cluster_nodes`.
    pub fn expand(&self, cluster_nodes: &[String]) -> Vec<String> {
        let names: Vec<String> = match self {
            NodeSelector::One(n) => n
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            NodeSelector::Many(v) => v.clone(),
        };
        let mut out: Vec<String> = Vec::new();
        for name in names {
            if name == "*" {
                for n in cluster_nodes {
                    if !out.contains(n) {
                        out.push(n.clone());
                    }
                }
            } else if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}

/// Canonical form of an option key.
pub fn canonical_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

/// Rewrite every option key to its canonical form.
pub fn canonicalize_options(options: Options) -> Options {
    options
        .into_iter()
        .map(|(k, v)| (canonical_key(&k), v))
        .collect()
}

/// `{"status": 0}` plus optional data.
pub fn ok_result(data: Option<Value>) -> Value {
    match data {
        Some(data) => json!({"status": 0, "data": data}),
        None => json!({"status": 0}),
    }
}

/// `{"status": 0, "info": ...}`.
pub fn info_result(info: impl Into<String>) -> Value {
    json!({"status": 0, "info": info.into()})
}

/// `{"status": 1, "error": ...}`.
pub fn error_result(error: impl Into<String>) -> Value {
    json!({"status": 1, "error": error.into()})
}

/// Status code of a result, 1 when absent or not an integer.
pub fn result_status(result: &Value) -> i64 {
    result.get("status").and_then(Value::as_i64).unwrap_or(1)
}
