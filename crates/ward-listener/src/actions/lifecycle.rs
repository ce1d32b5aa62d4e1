//! Daemon lifecycle and introspection actions.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use ward_core::Options;
use ward_core::request::{error_result, info_result, ok_result};

use super::{opt_bool, opt_str};
use crate::router::{ActionHandler, Reply, RequestContext};

pub struct DaemonStatus;

#[async_trait]
impl ActionHandler for DaemonStatus {
    async fn handle(&self, ctx: &RequestContext, _options: Options) -> Reply {
        let agent = &ctx.agent;
        let config = agent.store.get();
        Reply::Json(json!({
            "status": 0,
            "node": agent.nodename(),
            "cluster": {
                "name": config.cluster.name,
                "nodes": config.cluster.nodes,
            },
            "listener": {
                "state": agent.state().as_str(),
                "transports": agent.transports(),
                "uptime": agent.uptime().as_secs(),
                "subscribers": agent.broadcaster.count(),
                "helpers": agent.helpers.count(),
                "stats": agent.ledger.stats(),
            },
            "components": agent.components.status(),
        }))
    }
}

pub struct DaemonStats;

#[async_trait]
impl ActionHandler for DaemonStats {
    async fn handle(&self, ctx: &RequestContext, _options: Options) -> Reply {
        Reply::Json(ok_result(Some(json!(ctx.agent.ledger.stats()))))
    }
}

/// Liveness probe.
pub struct DaemonRunning;

#[async_trait]
impl ActionHandler for DaemonRunning {
    async fn handle(&self, ctx: &RequestContext, _options: Options) -> Reply {
        Reply::Json(ok_result(Some(json!(!ctx.agent.stop.is_stopped()))))
    }
}

pub struct BlacklistStatus;

#[async_trait]
impl ActionHandler for BlacklistStatus {
    async fn handle(&self, ctx: &RequestContext, _options: Options) -> Reply {
        Reply::Json(ok_result(Some(json!(ctx.agent.ledger.blacklist()))))
    }
}

pub struct BlacklistClear;

#[async_trait]
impl ActionHandler for BlacklistClear {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let sender = opt_str(&options, "sender");
        let cleared = ctx.agent.ledger.clear_blacklist(sender.as_deref());
        info!(sender = ?sender, cleared, by = %ctx.sender, "blacklist cleared");
        Reply::Json(info_result(format!("cleared {cleared} entries")))
    }
}

/// Stop every component in order, then the daemon.
pub struct DaemonShutdown;

#[async_trait]
impl ActionHandler for DaemonShutdown {
    async fn handle(&self, ctx: &RequestContext, _options: Options) -> Reply {
        info!(by = %ctx.sender, "daemon shutdown requested");
        let agent = ctx.agent.clone();
        tokio::spawn(async move {
            agent.components.shutdown_ordered().await;
            agent.stop.signal();
        });
        Reply::Json(info_result("shutting down"))
    }
}

/// Stop one component (`thr_id`), or the daemon without one.
pub struct DaemonStop;

#[async_trait]
impl ActionHandler for DaemonStop {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let Some(thr_id) = opt_str(&options, "thr_id") else {
            info!(by = %ctx.sender, "daemon stop requested");
            ctx.agent.stop.signal();
            return Reply::Json(info_result("stopping"));
        };
        let wait = opt_bool(&options, "wait", false);
        match ctx.agent.components.stop(&thr_id, wait).await {
            Ok(()) => Reply::Json(info_result(format!("stopped {thr_id}"))),
            Err(e) => Reply::Json(error_result(e)),
        }
    }
}

pub struct DaemonStart;

#[async_trait]
impl ActionHandler for DaemonStart {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let Some(thr_id) = opt_str(&options, "thr_id") else {
            return Reply::Json(error_result("thr_id is required"));
        };
        match ctx.agent.components.start(&thr_id) {
            Ok(()) => Reply::Json(info_result(format!("started {thr_id}"))),
            Err(e) => Reply::Json(error_result(e)),
        }
    }
}
