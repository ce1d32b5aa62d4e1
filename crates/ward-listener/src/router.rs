//! Action router.
//!
//! Maps `{action, options}` to a registered handler. Requests naming other
//! nodes are fanned out: the local node runs the action in place, the
//! others receive it through the requester.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use ward_core::request::{canonicalize_options, error_result, result_status};
use ward_core::{ActionRequest, Options};

use crate::context::AgentContext;
use crate::encoder::ReplyEncoder;

/// What a handler hands back to the connection.
pub enum Reply {
    Json(Value),
    /// Nothing is written back.
    Silent,
    /// Encoded frames, written until the sender is dropped or the daemon
    /// stops. The connection belongs to the stream from here on.
    Stream(mpsc::Receiver<Bytes>),
}

impl Reply {
    /// The JSON body, if any.
    pub fn json(&self) -> Option<&Value> {
        match self {
            Reply::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Json(v)
    }
}

/// Per-request information passed to handlers.
pub struct RequestContext {
    pub agent: Arc<AgentContext>,
    /// Peer address, or `local`.
    pub sender: String,
    /// Node name from the envelope, for encrypted requests.
    pub nodename: Option<String>,
    /// Cluster name from the envelope, for encrypted requests.
    pub cluster: Option<String>,
    pub encoder: ReplyEncoder,
}

impl RequestContext {
    /// A plain request from the local socket.
    pub fn local(agent: Arc<AgentContext>) -> Self {
        let encoder = ReplyEncoder::plain(agent.codec.clone());
        Self {
            agent,
            sender: ward_core::LOCAL_SENDER.to_string(),
            nodename: None,
            cluster: None,
            encoder,
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply;
}

#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with every built-in action registered.
    pub fn with_builtin_actions() -> Self {
        let router = Self::new();
        crate::actions::register_builtin(&router);
        router
    }

    /// Register `handler` for `action`, replacing any previous one.
    pub fn register(&self, action: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers
            .write()
            .expect("router lock")
            .insert(action.to_string(), handler);
    }

    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().expect("router lock").keys().cloned().collect();
        names.sort();
        names
    }

    fn handler(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.read().expect("router lock").get(action).cloned()
    }

    /// Route a decoded request.
    pub async fn dispatch(&self, ctx: &RequestContext, request: Value) -> Reply {
        let request: ActionRequest = match serde_json::from_value(request) {
            Ok(r) => r,
            Err(e) => return Reply::Json(error_result(format!("invalid request: {e}"))),
        };
        let Some(action) = request.action.clone().filter(|a| !a.is_empty()) else {
            return Reply::Json(error_result("action not specified"));
        };

        if let Some(selector) = &request.node {
            let config = ctx.agent.store.get();
            let targets = selector.expand(&config.cluster.nodes);
            let local = ctx.agent.nodename();
            if targets.iter().any(|n| *n != local) {
                return Reply::Json(self.multiplex(ctx, request, targets, &local).await);
            }
        }

        self.dispatch_local(ctx, &action, request.options).await
    }

    async fn dispatch_local(&self, ctx: &RequestContext, action: &str, options: Options) -> Reply {
        let Some(handler) = self.handler(action) else {
            debug!(%action, sender = %ctx.sender, "unsupported action");
            return Reply::Json(error_result("action not supported"));
        };
        debug!(%action, sender = %ctx.sender, "dispatching");
        handler.handle(ctx, canonicalize_options(options)).await
    }

    async fn multiplex(
        &self,
        ctx: &RequestContext,
        request: ActionRequest,
        targets: Vec<String>,
        local: &str,
    ) -> Value {
        let action = request.action.clone().unwrap_or_default();
        let mut forward = request.clone();
        forward.node = None;
        let forward = forward.to_value();

        let mut remote = JoinSet::new();
        for node in targets.iter().filter(|n| n.as_str() != local) {
            let requester = ctx.agent.requester.clone();
            let node = node.clone();
            let forward = forward.clone();
            remote.spawn(async move {
                let result = match requester.request(&node, &forward).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%node, error = %e, "forwarded request failed");
                        error_result(e.to_string())
                    }
                };
                (node, result)
            });
        }

        let mut nodes = Map::new();
        if targets.iter().any(|n| n == local) {
            let result = match self.dispatch_local(ctx, &action, request.options).await {
                Reply::Json(v) => v,
                Reply::Silent => json!({"status": 0}),
                Reply::Stream(_) => error_result("streaming actions cannot target several nodes"),
            };
            nodes.insert(local.to_string(), result);
        }
        while let Some(joined) = remote.join_next().await {
            match joined {
                Ok((node, result)) => {
                    nodes.insert(node, result);
                }
                Err(e) => warn!(error = %e, "forwarding task failed"),
            }
        }

        let status = if nodes.values().all(|r| result_status(r) == 0) { 0 } else { 1 };
        json!({"status": status, "nodes": nodes})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoObjects;
    use ward_core::{AgentConfig, ConfigStore};

    struct Echo;

    #[async_trait]
    impl ActionHandler for Echo {
        async fn handle(&self, _ctx: &RequestContext, options: Options) -> Reply {
            Reply::Json(json!({"status": 0, "options": options}))
        }
    }

    fn ctx() -> RequestContext {
        let mut config = AgentConfig::scaffold("n1", "prod", "s");
        config.cluster.nodes = vec!["n1".to_string(), "n2".to_string()];
        // n2 is unreachable: nothing listens on the discard port.
        config.peers.insert(
            "n2".to_string(),
            ward_core::config::PeerConfig {
                addr: Some("127.0.0.1".to_string()),
                port: Some(9),
            },
        );
        let store = Arc::new(ConfigStore::in_memory(config));
        let (agent, _queue) = AgentContext::new(store, Arc::new(NoObjects));
        RequestContext::local(Arc::new(agent))
    }

    #[tokio::test]
    async fn unknown_and_missing_action() {
        let router = Router::new();
        let ctx = ctx();
        let reply = router.dispatch(&ctx, json!({"action": "nope"})).await;
        assert_eq!(reply.json().unwrap(), &json!({"status": 1, "error": "action not supported"}));
        let reply = router.dispatch(&ctx, json!({"options": {}})).await;
        assert_eq!(reply.json().unwrap(), &json!({"status": 1, "error": "action not specified"}));
    }

    #[tokio::test]
    async fn options_are_canonicalized() {
        let router = Router::new();
        router.register("echo", Arc::new(Echo));
        let reply = router
            .dispatch(&ctx(), json!({"action": "echo", "options": {" Thr-Id ": "monitor"}}))
            .await;
        assert_eq!(reply.json().unwrap()["options"], json!({"thr_id": "monitor"}));
    }

    #[tokio::test]
    async fn local_node_selector_runs_in_place() {
        let router = Router::new();
        router.register("echo", Arc::new(Echo));
        let reply = router.dispatch(&ctx(), json!({"action": "echo", "node": "n1"})).await;
        assert_eq!(result_status(reply.json().unwrap()), 0);
        assert!(reply.json().unwrap().get("nodes").is_none());
    }

    #[tokio::test]
    async fn multiplex_collects_per_node_results() {
        let router = Router::new();
        router.register("echo", Arc::new(Echo));
        let reply = router.dispatch(&ctx(), json!({"action": "echo", "node": "*"})).await;
        let body = reply.json().unwrap();
        assert_eq!(body["nodes"]["n1"]["status"], 0);
        assert_eq!(body["nodes"]["n2"]["status"], 1);
        assert_eq!(body["status"], 1);
    }
}
