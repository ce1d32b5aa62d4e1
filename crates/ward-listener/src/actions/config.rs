//! Config distribution: `get_config`.
//!
//! Without `path` the node's own config is served, else the object config
//! `<etc_dir>/<path>.toml`.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use ward_core::Options;
use ward_core::request::error_result;

use super::{is_contained, opt_str};
use crate::router::{ActionHandler, Reply, RequestContext};

pub struct GetConfig;

enum Format {
    Raw,
    Json,
}

#[async_trait]
impl ActionHandler for GetConfig {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let format = match opt_str(&options, "format").as_deref() {
            None | Some("raw") => Format::Raw,
            Some("json") => Format::Json,
            Some(other) => return Reply::Json(error_result(format!("unknown format {other}"))),
        };
        let config = ctx.agent.store.get();

        let (text, mtime) = match opt_str(&options, "path") {
            Some(path) => {
                if !is_contained(&path) {
                    return Reply::Json(error_result(format!("invalid object path {path}")));
                }
                if ctx.agent.objects.is_deleting(&path) {
                    return Reply::Json(error_result(format!("{path} is being deleted")));
                }
                let file = config.etc_dir().join(format!("{path}.toml"));
                match read_with_mtime(file).await {
                    Ok(found) => found,
                    Err(e) => {
                        debug!(%path, error = %e, "object config unavailable");
                        return Reply::Json(error_result(format!("{path} config not found")));
                    }
                }
            }
            None => match ctx.agent.store.path() {
                Some(file) => match read_with_mtime(file.to_path_buf()).await {
                    Ok(found) => found,
                    Err(e) => return Reply::Json(error_result(format!("node config unreadable: {e}"))),
                },
                None => match config.to_toml_string() {
                    Ok(text) => (text, 0),
                    Err(e) => return Reply::Json(error_result(e.to_string())),
                },
            },
        };

        let data = match format {
            Format::Raw => Value::String(text),
            Format::Json => match toml::from_str::<toml::Table>(&text) {
                Ok(table) => json!(table),
                Err(e) => return Reply::Json(error_result(format!("config parse error: {e}"))),
            },
        };
        Reply::Json(json!({"status": 0, "data": data, "mtime": mtime}))
    }
}

/// File content and its modification time in seconds since the epoch.
async fn read_with_mtime(path: PathBuf) -> std::io::Result<(String, u64)> {
    let text = tokio::fs::read_to_string(&path).await?;
    let mtime = tokio::fs::metadata(&path)
        .await?
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok((text, mtime))
}
