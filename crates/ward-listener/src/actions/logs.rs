//! Log streaming actions: `node_logs` and `object_logs`.
//!
//! Node log: `<log_dir>/node.log`. Object logs:
//! `<log_dir>/objects/<path>.log`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ward_core::Options;
use ward_core::request::error_result;

use super::{is_contained, opt_bool, opt_i64, opt_str};
use crate::logs::{Tail, stream_log};
use crate::router::{ActionHandler, Reply, RequestContext};

/// Frames buffered between the file reader and the connection.
const STREAM_DEPTH: usize = 8;

/// Default backlog: the last 10 KiB.
const DEFAULT_BACKLOG: i64 = 10 * 1024;

fn tail(options: &Options) -> Tail {
    Tail {
        backlog: opt_i64(options, "backlog").unwrap_or(DEFAULT_BACKLOG),
        follow: opt_bool(options, "follow", false),
    }
}

async fn start(ctx: &RequestContext, path: PathBuf, tail: Tail) -> Reply {
    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "log unavailable");
            return Reply::Json(error_result(format!("log {} not found", path.display())));
        }
    };
    let (tx, rx) = mpsc::channel(STREAM_DEPTH);
    let encoder = ctx.encoder.clone();
    let stop = ctx.agent.stop.subscribe();
    tokio::spawn(async move {
        if let Err(e) = stream_log(file, tail, encoder, tx, stop).await {
            warn!(path = %path.display(), error = %e, "log stream aborted");
        }
    });
    Reply::Stream(rx)
}

pub struct NodeLogs;

#[async_trait]
impl ActionHandler for NodeLogs {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let path = ctx.agent.store.get().log_dir().join("node.log");
        start(ctx, path, tail(&options)).await
    }
}

pub struct ObjectLogs;

#[async_trait]
impl ActionHandler for ObjectLogs {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let Some(object) = opt_str(&options, "path") else {
            return Reply::Json(error_result("path is required"));
        };
        if !is_contained(&object) {
            return Reply::Json(error_result(format!("invalid object path {object}")));
        }
        let path = ctx
            .agent
            .store
            .get()
            .log_dir()
            .join("objects")
            .join(format!("{object}.log"));
        start(ctx, path, tail(&options)).await
    }
}
