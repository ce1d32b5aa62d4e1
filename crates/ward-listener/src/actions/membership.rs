//! Cluster membership: `join` and `leave`.
//!
//! Only the live config is changed; persisting it is the job of the
//! config management layer.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::info;

use ward_core::request::{error_result, info_result, ok_result};
use ward_core::{AgentConfig, Event, Options};

use super::opt_str;
use crate::router::{ActionHandler, Reply, RequestContext};

/// The joining node's name: the envelope sender, else the `node` option.
fn joining_node(ctx: &RequestContext, options: &Options) -> Option<String> {
    ctx.nodename
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| opt_str(options, "node"))
        .or_else(|| opt_str(options, "nodename"))
}

/// Bootstrap data handed to a joining node.
fn bootstrap(config: &AgentConfig) -> Value {
    let drp: Map<String, Value> = config
        .drp
        .clusters
        .iter()
        .map(|(name, c)| {
            (
                name.clone(),
                json!({"secret": c.secret, "nodes": c.nodes}),
            )
        })
        .collect();
    json!({
        "cluster": {
            "name": config.cluster.name,
            "nodes": config.cluster.nodes,
            "secret": config.cluster.secret,
        },
        "peers": config.peers,
        "drp": drp,
    })
}

pub struct Join;

#[async_trait]
impl ActionHandler for Join {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let Some(node) = joining_node(ctx, &options) else {
            return Reply::Json(error_result("joining node name unknown"));
        };
        let config = ctx.agent.store.update(|c| {
            if !c.cluster.nodes.contains(&node) {
                c.cluster.nodes.push(node.clone());
            }
        });
        info!(%node, sender = %ctx.sender, nodes = config.cluster.nodes.len(), "node joined");
        ctx.agent
            .events
            .publish(Event::new("join", json!({"node": node})));
        Reply::Json(ok_result(Some(bootstrap(&config))))
    }
}

pub struct Leave;

#[async_trait]
impl ActionHandler for Leave {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let Some(node) = joining_node(ctx, &options) else {
            return Reply::Json(error_result("leaving node name unknown"));
        };
        let mut removed = false;
        ctx.agent.store.update(|c| {
            let before = c.cluster.nodes.len();
            c.cluster.nodes.retain(|n| *n != node);
            removed = c.cluster.nodes.len() != before;
        });
        if !removed {
            return Reply::Json(info_result(format!("{node} is not a cluster member")));
        }
        info!(%node, sender = %ctx.sender, "node left");
        ctx.agent
            .events
            .publish(Event::new("leave", json!({"node": node})));
        Reply::Json(info_result(format!("{node} removed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_carries_cluster_subset() {
        let mut config = AgentConfig::scaffold("n1", "prod", "s3cr3t");
        config.drp.clusters.insert(
            "dr".to_string(),
            ward_core::config::DrpCluster {
                secret: Some("other".to_string()),
                nodes: vec!["d1".to_string()],
            },
        );
        let data = bootstrap(&config);
        assert_eq!(data["cluster"]["name"], "prod");
        assert_eq!(data["cluster"]["nodes"], json!(["n1"]));
        assert_eq!(data["cluster"]["secret"], "s3cr3t");
        assert_eq!(data["drp"]["dr"]["nodes"], json!(["d1"]));
        assert!(data["peers"].is_object());
    }
}
