//! Listener integration tests.
//!
//! Each test binds a real listener on ephemeral ports and a temporary
//! var dir, and talks to it through the requester.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use ward_codec::{ClusterSecret, Codec, Decrypted, JOIN_CLUSTER, Keyring, TERMINATOR};
use ward_core::config::{DrpCluster, PeerConfig};
use ward_core::{AgentConfig, ConfigStore, Ledger};
use ward_listener::{AgentContext, Listener, ListenerResult, ListenerState};
use ward_transport::{Requester, Seal, StreamItem};

const SECRET: &str = "s3cr3t";

struct Node {
    ctx: Arc<AgentContext>,
    config: AgentConfig,
    tcp: SocketAddr,
    run: JoinHandle<ListenerResult<()>>,
    _dir: TempDir,
}

impl Node {
    fn raw_url(&self) -> String {
        format!("raw://{}", self.tcp)
    }
}

fn node_config(dir: &TempDir) -> AgentConfig {
    let mut config = AgentConfig::scaffold("n1", "prod", SECRET);
    config.paths.var_dir = Some(dir.path().join("var"));
    config.paths.log_dir = Some(dir.path().join("log"));
    config.paths.etc_dir = Some(dir.path().join("etc"));
    config.listener.addr = Some("127.0.0.1".to_string());
    config.listener.port = Some(0);
    config.events.grace_period = Some("0s".to_string());
    config
}

fn start(config: AgentConfig, dir: TempDir) -> Node {
    let store = Arc::new(ConfigStore::in_memory(config.clone()));
    let bound = Listener::new(store).bind().unwrap();
    let ctx = bound.context().clone();
    let tcp = bound.tcp_addr().unwrap();
    let run = tokio::spawn(bound.run());
    Node {
        ctx,
        config,
        tcp,
        run,
        _dir: dir,
    }
}

fn start_default() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let config = node_config(&dir);
    start(config, dir)
}

fn node_config_named(dir: &TempDir, name: &str) -> AgentConfig {
    let mut config = node_config(dir);
    config.node.name = Some(name.to_string());
    config.cluster.nodes = vec![name.to_string()];
    config
}

fn requester(config: AgentConfig) -> Requester {
    let nodename = config.nodename();
    let store = Arc::new(ConfigStore::in_memory(config));
    let keyring = Arc::new(Keyring::from_store(store.clone()));
    let codec = Arc::new(Codec::new(&nodename, keyring, Arc::new(Ledger::new())));
    Requester::new(store, codec).with_timeout(Duration::from_secs(10))
}

async fn stop(node: Node) {
    node.ctx.stop.signal();
    tokio::time::timeout(Duration::from_secs(15), node.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ── Local sockets ──────────────────────────────────────────────

#[tokio::test]
async fn local_daemon_status() {
    let node = start_default();
    let client = requester(node.config.clone());

    let reply = client
        .request("", &json!({"action": "daemon_status"}))
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);
    assert_eq!(reply["cluster"]["name"], "prod");
    assert_eq!(reply["listener"]["state"], "accepting");

    stop(node).await;
}

#[tokio::test]
async fn local_h2_socket() {
    let node = start_default();
    let client = requester(node.config.clone());
    let h2_sock = node.config.h2_sock();

    let reply = client
        .request(h2_sock.to_str().unwrap(), &json!({"action": "daemon_running"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"status": 0, "data": true}));

    stop(node).await;
}

// ── Raw TCP ────────────────────────────────────────────────────

#[tokio::test]
async fn join_with_foreign_cluster_name() {
    let node = start_default();
    // The joiner belongs to no cluster yet; it only knows the secret.
    let client = requester(AgentConfig::scaffold("n2", "unjoined", "unused"));
    let params = client.resolve(&node.raw_url()).unwrap();
    assert!(params.encrypted);

    let seal = Seal::cluster(JOIN_CLUSTER).with_secret(ClusterSecret::from_phrase(SECRET));
    let reply = client
        .request_to(&params, &json!({"action": "join"}), &seal)
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);
    assert_eq!(reply["data"]["cluster"]["name"], "prod");
    assert_eq!(reply["data"]["cluster"]["nodes"], json!(["n1", "n2"]));
    assert_eq!(node.ctx.store.get().cluster.nodes, vec!["n1", "n2"]);

    stop(node).await;
}

#[tokio::test]
async fn wrong_secret_gets_no_reply() {
    let node = start_default();
    let client = requester(AgentConfig::scaffold("n2", "prod", "not the secret"));

    let result = client
        .request(&node.raw_url(), &json!({"action": "daemon_status"}))
        .await;
    assert!(result.is_err());
    assert_eq!(node.ctx.ledger.failures("127.0.0.1"), 1);

    stop(node).await;
}

#[tokio::test]
async fn repeated_bad_secrets_blacklist_the_sender() {
    let node = start_default();
    let intruder = requester(AgentConfig::scaffold("n2", "prod", "not the secret"));
    let honest = requester(AgentConfig::scaffold("n2", "prod", SECRET));
    let request = json!({"action": "daemon_running"});

    let threshold = node.ctx.ledger.threshold();
    for _ in 0..=threshold {
        assert!(intruder.request(&node.raw_url(), &request).await.is_err());
    }
    assert!(node.ctx.ledger.is_blacklisted("127.0.0.1"));

    // A valid request from the same address is now dropped unread.
    assert!(honest.request(&node.raw_url(), &request).await.is_err());

    let local = requester(node.config.clone());
    let reply = local
        .request("", &json!({"action": "blacklist_clear"}))
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);
    assert!(!node.ctx.ledger.is_blacklisted("127.0.0.1"));

    let reply = honest.request(&node.raw_url(), &request).await.unwrap();
    assert_eq!(reply, json!({"status": 0, "data": true}));

    stop(node).await;
}

#[tokio::test]
async fn dequeue_actions_runs_helper_without_reply() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("dequeued");
    let mut config = node_config(&dir);
    config.commands.node = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("touch {}", marker.display()),
    ];
    let node = start(config, dir);

    let mut stream = TcpStream::connect(node.tcp).await.unwrap();
    let mut frame = b"dequeue_actions".to_vec();
    frame.push(TERMINATOR);
    stream.write_all(&frame).await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.is_empty());

    for _ in 0..250 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(marker.exists());
    // Plain text on the encrypted port, but not a decrypt failure.
    assert_eq!(node.ctx.ledger.failures("127.0.0.1"), 0);

    stop(node).await;
}

#[tokio::test]
async fn all_nodes_selector_aggregates_replies() {
    let dir_b = tempfile::tempdir().unwrap();
    let config_b = node_config_named(&dir_b, "n2");
    let node_b = start(config_b, dir_b);

    let dir_a = tempfile::tempdir().unwrap();
    let mut config_a = node_config_named(&dir_a, "n1");
    config_a.cluster.nodes = vec!["n1".to_string(), "n2".to_string()];
    config_a.peers.insert(
        "n2".to_string(),
        PeerConfig {
            addr: Some("127.0.0.1".to_string()),
            port: Some(node_b.tcp.port()),
        },
    );
    let node_a = start(config_a, dir_a);

    let client = requester(node_a.config.clone());
    let reply = client
        .request("", &json!({"action": "daemon_status", "node": "*"}))
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);
    let nodes = reply["nodes"].as_object().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes["n1"]["node"], "n1");
    assert_eq!(nodes["n2"]["node"], "n2");
    assert_eq!(nodes["n2"]["status"], 0);

    stop(node_a).await;
    stop(node_b).await;
}

#[tokio::test]
async fn concurrent_clients_with_distinct_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(&dir);
    config.drp.clusters.insert(
        "dr".to_string(),
        DrpCluster {
            secret: Some("dr-secret".to_string()),
            nodes: vec!["d1".to_string()],
        },
    );
    let node = start(config, dir);

    let local = Arc::new(requester(AgentConfig::scaffold("n2", "prod", SECRET)));
    let remote = Arc::new(requester(AgentConfig::scaffold("d1", "dr", "dr-secret")));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let client = if i % 2 == 0 { local.clone() } else { remote.clone() };
        let url = node.raw_url();
        tasks.spawn(async move {
            client
                .request(&url, &json!({"action": "daemon_running"}))
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        let reply = result.unwrap().unwrap();
        assert_eq!(reply["status"], 0);
    }
    assert!(node.ctx.ledger.blacklist().is_empty());

    stop(node).await;
}

// ── Streams ────────────────────────────────────────────────────

#[tokio::test]
async fn node_logs_backlog() {
    let node = start_default();
    let log_dir = node.config.log_dir();
    std::fs::create_dir_all(&log_dir).unwrap();
    std::fs::write(log_dir.join("node.log"), "first line\nsecond line\nthird line\n").unwrap();

    let client = requester(node.config.clone());
    let mut stream = client
        .open("", &json!({"action": "node_logs", "options": {"backlog": 15}}))
        .await
        .unwrap();
    let mut text = String::new();
    while let Some(msg) = stream.next_message().await.unwrap() {
        match msg {
            Decrypted::Raw { bytes, .. } => text.push_str(&String::from_utf8_lossy(&bytes)),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    // 15 bytes back lands mid "second line"; the partial line is skipped.
    assert_eq!(text, "third line\n");

    stop(node).await;
}

#[tokio::test]
async fn event_subscription_sees_join() {
    let node = start_default();
    let client = requester(node.config.clone());

    let mut events = client.open("", &json!({"action": "events"})).await.unwrap();
    for _ in 0..100 {
        if node.ctx.broadcaster.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(node.ctx.broadcaster.count(), 1);

    let reply = client
        .request("", &json!({"action": "join", "options": {"node": "n3"}}))
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);

    let item = tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let StreamItem::Message(msg) = item else {
        panic!("expected an event");
    };
    let event: Value = msg.into_value().unwrap();
    assert_eq!(event, json!({"kind": "join", "data": {"node": "n3"}}));

    stop(node).await;
}

#[tokio::test]
async fn events_queued_during_grace_period_are_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(&dir);
    config.events.grace_period = Some("2s".to_string());
    let before = Instant::now();
    let node = start(config, dir);
    let client = requester(node.config.clone());

    let mut events = client.open("", &json!({"action": "events"})).await.unwrap();
    for _ in 0..100 {
        if node.ctx.broadcaster.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let reply = client
        .request("", &json!({"action": "join", "options": {"node": "n3"}}))
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);

    let item = tokio::time::timeout(Duration::from_secs(10), events.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let StreamItem::Message(msg) = item else {
        panic!("expected an event");
    };
    let event: Value = msg.into_value().unwrap();
    assert_eq!(event, json!({"kind": "join", "data": {"node": "n3"}}));
    // Held in the queue until the window closed.
    assert!(before.elapsed() >= Duration::from_secs(2));

    stop(node).await;
}

// ── Lifecycle ──────────────────────────────────────────────────

#[tokio::test]
async fn daemon_stop_action_ends_run() {
    let node = start_default();
    let client = requester(node.config.clone());
    let sock = node.config.lsnr_sock();
    assert!(sock.exists());

    let reply = client
        .request("", &json!({"action": "daemon_stop"}))
        .await
        .unwrap();
    assert_eq!(reply["status"], 0);

    tokio::time::timeout(Duration::from_secs(15), node.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(node.ctx.state(), ListenerState::Stopped);
    assert!(!sock.exists());
}
