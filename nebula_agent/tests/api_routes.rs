//! REST routes exercised through the router without a socket.
mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{test_config, StaticSource, HOSTNAME};
use nebula_agent::config::{Config, ConfigManager};
use nebula_agent::terminal::PtyLauncher;
use nebula_agent::Agent;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn start(cfg: Config) -> (Agent, Router) {
    let agent = Agent::start(
        Arc::new(ConfigManager::new(cfg)),
        Box::new(StaticSource),
        Arc::new(PtyLauncher),
    )
    .unwrap();
    // wait for the first tick
    for _ in 0..100 {
        if !agent.state().history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let router = agent.router();
    (agent, router)
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_and_version() {
    let (agent, app) = start(test_config()).await;
    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, get("/api/v1/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    agent.shutdown().await;
}

#[tokio::test]
async fn metrics_sections_come_from_the_latest_snapshot() {
    let (agent, app) = start(test_config()).await;

    let (_, all) = call(&app, get("/api/v1/metrics/all")).await;
    assert_eq!(all["system"]["hostname"], HOSTNAME);

    let (_, cpu) = call(&app, get("/api/v1/metrics/cpu")).await;
    assert_eq!(cpu["usage_percent"], serde_json::json!([10.0, 30.0]));

    let (_, mem) = call(&app, get("/api/v1/metrics/memory")).await;
    assert_eq!(mem["used_percent"], 50.0);

    let (status, disks) = call(&app, get("/api/v1/metrics/disk")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(disks.is_array());

    let (_, info) = call(&app, get("/api/v1/system/info")).await;
    assert_eq!(info["num_cpu"], 2);

    let (_, history) = call(&app, get("/api/v1/metrics/history")).await;
    let len = history.as_array().unwrap().len();
    assert!((1..=60).contains(&len));

    let (status, _) = call(&app, get("/api/v1/metrics/stored")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    agent.shutdown().await;
}

#[tokio::test]
async fn stored_metrics_are_served_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config();
    cfg.storage.enabled = true;
    cfg.storage.path = dir.path().join("metrics.jsonl");
    let (agent, app) = start(cfg).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = call(&app, get("/api/v1/metrics/stored?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    let ts = |i: usize| {
        chrono::DateTime::parse_from_rfc3339(entries[i]["timestamp"].as_str().unwrap()).unwrap()
    };
    assert!(ts(0) >= ts(1));
    agent.shutdown().await;
}

#[tokio::test]
async fn auth_guards_api_but_not_health() {
    let mut cfg = test_config();
    cfg.auth.token = Some("s3cret".into());
    let (agent, app) = start(cfg).await;

    assert_eq!(call(&app, get("/health")).await.0, StatusCode::OK);
    assert_eq!(call(&app, get("/api/v1/version")).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(
        call(&app, get("/api/v1/version?token=s3cret")).await.0,
        StatusCode::OK
    );
    let bearer = Request::builder()
        .uri("/api/v1/version")
        .header("authorization", "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&app, bearer).await.0, StatusCode::OK);

    let (_, cfg) = call(&app, get("/api/v1/config?token=s3cret")).await;
    assert_eq!(cfg["auth"]["token"], "********");
    agent.shutdown().await;
}

#[tokio::test]
async fn terminal_listing_and_deletion() {
    let (agent, app) = start(test_config()).await;

    let (_, shells) = call(&app, get("/api/v1/terminal/shells")).await;
    assert!(shells["shells"].is_array());
    assert!(shells.get("default_shell").is_some());

    let (_, sessions) = call(&app, get("/api/v1/terminal/sessions")).await;
    assert_eq!(sessions, serde_json::json!([]));

    let del = |id: &str| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/terminal/sessions/{id}"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, body) = call(&app, del("ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("ghost"));

    #[cfg(unix)]
    {
        agent.state().terminals.create_session("live", "sh", 80, 24).unwrap();
        let (_, sessions) = call(&app, get("/api/v1/terminal/sessions")).await;
        assert_eq!(sessions[0]["id"], "live");
        assert_eq!(sessions[0]["shell"], "sh");

        assert_eq!(call(&app, del("live")).await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&app, del("live")).await.0, StatusCode::NOT_FOUND);
    }
    agent.shutdown().await;
}

#[tokio::test]
async fn config_reload_without_file_keeps_current_values() {
    let (agent, app) = start(test_config()).await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/config/reload")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metrics"]["interval_ms"], 20);
    agent.shutdown().await;
}

#[tokio::test]
async fn process_routes_list_get_and_refuse_protected_kills() {
    let (agent, app) = start(test_config()).await;
    let me = std::process::id();

    let (status, list) = call(&app, get("/api/v1/processes")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().iter().any(|p| p["pid"] == me));

    let (status, info) = call(&app, get(&format!("/api/v1/processes/{me}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["pid"], me);

    let (status, _) = call(&app, get("/api/v1/processes/4294967000")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, get("/api/v1/processes/abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, get("/api/v1/processes/search")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let kill = |uri: String| Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap();
    let (status, body) = call(&app, kill("/api/v1/processes/1/kill?force=true".into())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("protected"));
    let (status, _) = call(&app, kill(format!("/api/v1/processes/{me}/kill"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    agent.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn process_kill_terminates_a_child() {
    let (agent, app) = start(test_config()).await;
    let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    let (status, tree) = call(&app, get(&format!("/api/v1/processes/{}/tree", std::process::id()))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(tree["children"].as_array().unwrap().iter().any(|c| c["pid"] == pid));

    let (_, found) = call(&app, get("/api/v1/processes/search?q=SLEEP")).await;
    assert!(found.as_array().unwrap().iter().any(|p| p["pid"] == pid));

    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/processes/{pid}/kill?force=true"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "process terminated");
    assert!(!child.wait().unwrap().success());
    agent.shutdown().await;
}
