use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use valet::gateway::registry::OutboundFrame;
use valet::gateway::{spawn_event_fanout, AppState};
use valet::service::SessionService;
use valet_runtime::{Runtime, RuntimeConfig};
use valet_supervisor::{PathPolicy, RuleEvaluator, Supervisor, SupervisorConfig};
use valet_transcript::TranscriptStore;

pub const ECHO_AGENT: &str = r#"read line
echo '{"type":"tool_use","tool":"bash","input":{"command":"echo hi"}}'
echo '{"type":"tool_result","tool":"bash","output":"hi"}'
echo '{"type":"result","result":"hi","usage":{"input_tokens":2,"output_tokens":1}}'
"#;

pub const SLOW_AGENT: &str = "read line\nsleep 30\n";

pub struct TestApp {
    pub state: Arc<AppState>,
    _dir: tempfile::TempDir,
}

pub fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-agent");
    let mut file = std::fs::File::create(&path).expect("create script");
    writeln!(file, "#!/bin/sh").expect("write");
    file.write_all(body.as_bytes()).expect("write");
    drop(file);
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

pub fn test_app(agent_body: &str, secret: Option<&str>) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), agent_body);
    let runtime = Runtime::new(RuntimeConfig {
        agent_bin: Some(script),
        api_key: None,
        api_base: "https://api.anthropic.com".into(),
        default_model: "claude-sonnet-4-5".into(),
        workdir: dir.path().to_path_buf(),
    });
    let supervisor = Supervisor::new(
        runtime,
        Arc::new(RuleEvaluator),
        PathPolicy::new(dir.path(), &[]),
        SupervisorConfig {
            eval_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(15),
            ..SupervisorConfig::default()
        },
    );
    let store = TranscriptStore::new(dir.path().join("transcripts")).expect("store");
    let service = SessionService::new(store, supervisor);
    let state = AppState::new(
        service,
        secret.map(|secret| secret.to_string()),
        "127.0.0.1".to_string(),
        4780,
    );
    spawn_event_fanout(state.clone());
    TestApp { state, _dir: dir }
}

pub async fn connect(app: &TestApp) -> (String, mpsc::UnboundedReceiver<OutboundFrame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let client_id = app.state.registry.register(tx).await;
    (client_id, rx)
}

pub async fn send(app: &TestApp, client_id: &str, message: Value) {
    valet::gateway::socket::dispatch(&app.state, client_id, &message.to_string()).await;
}

/// Next outbound control-plane message (heartbeat pings are skipped).
pub async fn recv_message(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed");
        if let OutboundFrame::Message(value) = frame {
            return value;
        }
    }
}

pub async fn recv_until(
    rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    wanted: &[&str],
) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let message = recv_message(rx).await;
        let done = wanted
            .iter()
            .any(|wanted| message["type"].as_str() == Some(wanted));
        seen.push(message);
        if done {
            return seen;
        }
    }
}

pub async fn authenticate(app: &TestApp, client_id: &str, rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) {
    send(app, client_id, serde_json::json!({"type": "auth"})).await;
    let reply = recv_message(rx).await;
    assert_eq!(reply["type"], "auth.ok", "expected auth to succeed: {reply}");
}
