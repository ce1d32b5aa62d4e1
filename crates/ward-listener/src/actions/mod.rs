//! Built-in action families.

pub mod command;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod logs;
pub mod membership;

use std::sync::Arc;

use serde_json::Value;

use ward_core::Options;

use crate::router::Router;

/// Register every built-in action on `router`.
pub fn register_builtin(router: &Router) {
    router.register("daemon_status", Arc::new(lifecycle::DaemonStatus));
    router.register("daemon_stats", Arc::new(lifecycle::DaemonStats));
    router.register("daemon_running", Arc::new(lifecycle::DaemonRunning));
    router.register("blacklist_status", Arc::new(lifecycle::BlacklistStatus));
    router.register("blacklist_clear", Arc::new(lifecycle::BlacklistClear));
    router.register("daemon_shutdown", Arc::new(lifecycle::DaemonShutdown));
    router.register("daemon_stop", Arc::new(lifecycle::DaemonStop));
    router.register("daemon_start", Arc::new(lifecycle::DaemonStart));
    router.register("join", Arc::new(membership::Join));
    router.register("leave", Arc::new(membership::Leave));
    router.register("get_config", Arc::new(config::GetConfig));
    router.register("run_command", Arc::new(command::RunCommand));
    router.register("node_logs", Arc::new(logs::NodeLogs));
    router.register("object_logs", Arc::new(logs::ObjectLogs));
    router.register("events", Arc::new(events::Subscribe));
}

// ── Option accessors ───────────────────────────────────────────

pub(crate) fn opt_str(options: &Options, key: &str) -> Option<String> {
    match options.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Booleans also accept "true"/"yes"/"1" strings and numbers.
pub(crate) fn opt_bool(options: &Options, key: &str, default: bool) -> bool {
    match options.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|i| i != 0),
        Some(Value::String(s)) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => default,
    }
}

pub(crate) fn opt_i64(options: &Options, key: &str) -> Option<i64> {
    match options.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A relative path that stays inside its base directory.
pub(crate) fn is_contained(path: &str) -> bool {
    let p = std::path::Path::new(path);
    !path.is_empty()
        && p.components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}
