//! Remote command proxy: `run_command`.
//!
//! Commands run through the configured entry points only: the node
//! command, or the object command plus `--path <path>`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{info, warn};

use ward_core::Options;
use ward_core::request::{error_result, ok_result};

use super::{is_contained, opt_bool, opt_str};
use crate::router::{ActionHandler, Reply, RequestContext};

const SYNC_TIMEOUT: Duration = Duration::from_secs(300);

pub struct RunCommand;

fn argv_option(options: &Options) -> Result<Vec<String>, String> {
    match options.get("argv") {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                _ => Err("argv items must be scalars".to_string()),
            })
            .collect(),
        Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Some(_) => Err("argv must be a list".to_string()),
    }
}

#[async_trait]
impl ActionHandler for RunCommand {
    async fn handle(&self, ctx: &RequestContext, options: Options) -> Reply {
        let args = match argv_option(&options) {
            Ok(a) => a,
            Err(e) => return Reply::Json(error_result(e)),
        };
        let config = ctx.agent.store.get();
        let path = opt_str(&options, "path");

        let mut argv = match &path {
            Some(p) => {
                if !is_contained(p) {
                    return Reply::Json(error_result(format!("invalid object path {p}")));
                }
                let mut v = config.commands.object.clone();
                v.extend(["--path".to_string(), p.clone()]);
                v
            }
            None => config.commands.node.clone(),
        };
        if argv.is_empty() || (path.is_some() && config.commands.object.is_empty()) {
            return Reply::Json(error_result("no command configured"));
        }
        argv.extend(args);

        info!(argv = ?argv, sender = %ctx.sender, "run_command");

        if !opt_bool(&options, "sync", true) {
            return match ctx.agent.helpers.spawn("run_command", &argv) {
                Ok(pid) => Reply::Json(json!({"status": 0, "info": "started", "data": {"pid": pid}})),
                Err(e) => Reply::Json(error_result(format!("spawn failed: {e}"))),
            };
        }

        let Some((program, rest)) = argv.split_first() else {
            return Reply::Json(error_result("no command configured"));
        };
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(SYNC_TIMEOUT, child).await {
            Ok(Ok(output)) => Reply::Json(ok_result(Some(json!({
                "ret": output.status.code().unwrap_or(-1),
                "out": String::from_utf8_lossy(&output.stdout),
                "err": String::from_utf8_lossy(&output.stderr),
            })))),
            Ok(Err(e)) => Reply::Json(error_result(format!("exec failed: {e}"))),
            Err(_) => {
                warn!(argv = ?argv, "command timed out");
                Reply::Json(error_result("command timed out"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_forms() {
        let o = json!({"argv": ["print", "status", 3]}).as_object().cloned().unwrap();
        assert_eq!(argv_option(&o).unwrap(), vec!["print", "status", "3"]);
        let o = json!({"argv": "print status"}).as_object().cloned().unwrap();
        assert_eq!(argv_option(&o).unwrap(), vec!["print", "status"]);
        let o = json!({"argv": {"a": 1}}).as_object().cloned().unwrap();
        assert!(argv_option(&o).is_err());
    }
}
