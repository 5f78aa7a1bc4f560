mod common;

use common::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_succeeds_immediately_in_local_trust_mode() {
    let app = test_app(ECHO_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;

    send(&app, &client_id, json!({"type": "auth", "channel": "cli"})).await;
    let reply = recv_message(&mut rx).await;
    assert_eq!(reply["type"], "auth.ok");
    assert_eq!(reply["clientId"], client_id);
    assert!(reply["ts"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configured_secret_is_enforced() {
    let app = test_app(ECHO_AGENT, Some("hunter2"));
    let (client_id, mut rx) = connect(&app).await;

    send(&app, &client_id, json!({"type": "auth", "secret": "wrong"})).await;
    assert_eq!(recv_message(&mut rx).await["type"], "auth.fail");

    send(&app, &client_id, json!({"type": "auth", "secret": "hunter2"})).await;
    assert_eq!(recv_message(&mut rx).await["type"], "auth.ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthenticated_clients_may_only_auth_and_ping() {
    let app = test_app(ECHO_AGENT, Some("hunter2"));
    let (client_id, mut rx) = connect(&app).await;

    send(&app, &client_id, json!({"type": "ping"})).await;
    assert_eq!(recv_message(&mut rx).await["type"], "pong");

    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "message": "echo hi"}),
    )
    .await;
    assert_eq!(recv_message(&mut rx).await["type"], "auth.fail");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_gets_a_local_error() {
    let app = test_app(ECHO_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;

    valet::gateway::socket::dispatch(&app.state, &client_id, "{not json").await;
    let reply = recv_message(&mut rx).await;
    assert_eq!(reply["type"], "error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_request_streams_tool_events_and_one_terminal() {
    let app = test_app(ECHO_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "message": "echo hi"}),
    )
    .await;

    let messages = recv_until(&mut rx, &["agent.done", "agent.error"]).await;
    let types: Vec<&str> = messages
        .iter()
        .filter_map(|message| message["type"].as_str())
        .collect();
    assert!(types.contains(&"agent.tool_use"));
    assert!(types.contains(&"agent.tool_result"));

    let done = messages.last().expect("terminal");
    assert_eq!(done["type"], "agent.done");
    assert_eq!(done["reason"], "completed");
    assert_eq!(done["result"]["text"], "hi");
    assert_eq!(done["result"]["toolsUsed"][0], "bash");
    assert!(done["sessionId"].as_str().is_some());
    assert!(messages.iter().all(|message| message["ts"].is_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_yields_done_cancelled_for_subscribers() {
    let app = test_app(SLOW_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "sessionId": "sess_cx", "message": "long task"}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(
        &app,
        &client_id,
        json!({"type": "agent.cancel", "sessionId": "sess_cx"}),
    )
    .await;

    let messages = recv_until(&mut rx, &["agent.done", "agent.error"]).await;
    let done = messages.last().expect("terminal");
    assert_eq!(done["type"], "agent.done");
    assert_eq!(done["reason"], "cancelled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_without_active_execution_is_silent() {
    let app = test_app(ECHO_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(
        &app,
        &client_id,
        json!({"type": "agent.cancel", "sessionId": "sess_idle"}),
    )
    .await;

    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(outcome.is_err(), "idle cancel must not emit anything");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_request_while_active_is_rejected() {
    let app = test_app(SLOW_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "sessionId": "sess_dup", "message": "first"}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "sessionId": "sess_dup", "message": "second"}),
    )
    .await;

    let reply = recv_message(&mut rx).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"]
        .as_str()
        .expect("message")
        .contains("active execution"));

    assert!(app.state.service.cancel("sess_dup").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_can_be_listed_and_resumed() {
    let app = test_app(ECHO_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "sessionId": "sess_hist", "message": "echo hi"}),
    )
    .await;
    recv_until(&mut rx, &["agent.done", "agent.error"]).await;

    send(&app, &client_id, json!({"type": "session.list"})).await;
    let listing = recv_message(&mut rx).await;
    assert_eq!(listing["type"], "session.data");
    let sessions = listing["sessions"].as_array().expect("sessions");
    assert!(sessions
        .iter()
        .any(|session| session["id"] == "sess_hist"));

    send(
        &app,
        &client_id,
        json!({"type": "session.resume", "sessionId": "sess_hist"}),
    )
    .await;
    let resumed = recv_message(&mut rx).await;
    assert_eq!(resumed["type"], "session.data");
    assert_eq!(resumed["session"]["id"], "sess_hist");
    assert!(resumed["session"]["messageCount"].as_u64().expect("count") >= 1);

    send(
        &app,
        &client_id,
        json!({"type": "session.resume", "sessionId": "sess_ghost"}),
    )
    .await;
    assert_eq!(recv_message(&mut rx).await["type"], "error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocked_tool_call_leaves_no_successful_result_in_transcript() {
    let app = test_app(
        r#"read line
echo '{"type":"tool_use","tool":"Read","input":{"file_path":"../../../../etc/passwd"}}'
echo '{"type":"tool_result","tool":"Read","output":"root:x:0:0"}'
echo '{"type":"result","result":"peeked"}'
"#,
        None,
    );
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(
        &app,
        &client_id,
        json!({"type": "agent.request", "sessionId": "sess_sec", "message": "read it"}),
    )
    .await;
    let messages = recv_until(&mut rx, &["agent.done", "agent.error"]).await;
    assert!(messages
        .iter()
        .any(|message| message["type"] == "security.violation"));
    assert!(!messages
        .iter()
        .any(|message| message["type"] == "agent.tool_result"));

    // The replayable transcript carries the violation, not a tool result.
    let entries = app
        .state
        .service
        .store()
        .read("sess_sec")
        .expect("transcript");
    let event_names: Vec<String> = entries
        .iter()
        .filter_map(|entry| match entry {
            valet_protocol::TranscriptEntry::Event { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert!(event_names.iter().any(|name| name == "security.violation"));
    assert!(!event_names.iter().any(|name| name == "agent.tool_result"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_message_and_health_route_agree() {
    let app = test_app(ECHO_AGENT, None);
    let (client_id, mut rx) = connect(&app).await;
    authenticate(&app, &client_id, &mut rx).await;

    send(&app, &client_id, json!({"type": "status"})).await;
    let status = recv_message(&mut rx).await;
    assert_eq!(status["type"], "status.data");
    assert_eq!(status["running"], true);
    assert_eq!(status["bind"], "127.0.0.1");
    assert!(status["pid"].as_u64().expect("pid") > 0);
    assert!(status["clients"].as_array().expect("clients").len() >= 1);

    use http_body_util::BodyExt;
    use tower::ServiceExt;
    let router = valet::gateway::build_router(app.state.clone());
    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .expect("request"),
        )
        .await
        .expect("health response");
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    let health: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(health["running"], true);
    assert_eq!(health["port"], 4780);
}
