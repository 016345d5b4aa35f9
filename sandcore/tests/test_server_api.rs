use std::path::Path;

use axum::{routing::get, Router};
use reqwest::{Client, StatusCode};
use sandcore::{
    config::{FallbackConfig, PortRange, SandcoreConfig},
    fallback::FallbackServer,
    server::{create_router, ServerState},
};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct TestServer {
    dir: TempDir,
    base: String,
    client: Client,
    state: ServerState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TestServer {
    async fn start(first_port: u16) -> anyhow::Result<Self> {
        let dir = tempdir()?;
        std::fs::create_dir_all(dir.path().join("mounts/shared"))?;

        let config = SandcoreConfig::builder()
            .sandbox_root(dir.path().join("sandboxes"))
            .snapshot_root(dir.path().join("snapshots"))
            .mount_root(dir.path().join("mounts"))
            .events_file(dir.path().join("events.log"))
            .fallback(
                FallbackConfig::builder()
                    .port_range(PortRange::new(first_port, first_port + 9)?)
                    .startup_grace_ms(50)
                    .stop_timeout_secs(2)
                    .build(),
            )
            .build();

        let server = FallbackServer::new(which::which("sleep")?, ["30"]);
        let state = ServerState::with_fallback_server(config, server)?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = create_router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            dir,
            base: format!("http://{addr}"),
            client: Client::new(),
            state,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<(StatusCode, Value)> {
        let response = self.client.post(self.url(path)).json(&body).send().await?;
        Ok((response.status(), response.json().await?))
    }

    async fn get(&self, path: &str) -> anyhow::Result<(StatusCode, Value)> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok((response.status(), response.json().await?))
    }

    async fn delete(&self, path: &str) -> anyhow::Result<(StatusCode, Value)> {
        let response = self.client.delete(self.url(path)).send().await?;
        Ok((response.status(), response.json().await?))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_sandbox_lifecycle() -> anyhow::Result<()> {
    let server = TestServer::start(34200).await?;

    let response = server.client.post(server.url("/sandboxes")).send().await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Value = response.json().await?;
    let generated = created["sandbox_id"].as_str().unwrap_or_default().to_string();
    assert_eq!(generated.len(), 32);

    let (status, _) = server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_type"], "conflict");

    let (status, body) = server.post("/sandboxes", json!({"sandbox_id": "../x"})).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_type"], "validation_error");

    let (status, body) = server.get("/sandboxes").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(2));

    let (status, body) = server.get("/sandboxes/sb1").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sandbox_id"], "sb1");

    let (status, body) = server.post("/sandboxes/sb1/keepalive", json!({})).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = server.delete("/sandboxes/sb1").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);
    assert!(!server.root().join("sandboxes/sb1").exists());

    let (status, body) = server.get("/sandboxes/sb1").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_type"], "not_found");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_files_and_mounts() -> anyhow::Result<()> {
    let server = TestServer::start(34210).await?;
    server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;

    let (status, body) = server
        .post(
            "/sandboxes/sb1/files",
            json!({"path": "src/main.py", "data": "print('hi')"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = server.get("/sandboxes/sb1/files/src/main.py").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "print('hi')");

    let (_, body) = server.get("/sandboxes/sb1/files?path=src").await?;
    assert_eq!(body["entries"], json!(["src/main.py"]));

    let (status, _) = server
        .post(
            "/sandboxes/sb1/files",
            json!({"path": "../escape.txt", "data": "x"}),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.get("/sandboxes/sb1/files/missing.txt").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let shared = server.root().join("mounts/shared");
    std::fs::write(shared.join("notes.txt"), "shared notes")?;
    let (status, _) = server
        .post(
            "/sandboxes/sb1/mount",
            json!({"alias": "shared", "target": shared}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = server.get("/sandboxes/sb1/files/shared/notes.txt").await?;
    assert_eq!(body["content"], "shared notes");

    let (status, body) = server
        .post(
            "/sandboxes/sb1/mount",
            json!({"alias": "etc", "target": "/etc"}),
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_type"], "permission_denied");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_exec_delegation_and_usage() -> anyhow::Result<()> {
    let server = TestServer::start(34220).await?;
    server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;

    let (status, body) = server
        .post(
            "/sandboxes/sb1/exec",
            json!({"command": "bash", "args": ["-c", "echo hi"]}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fallback_url"], "http://127.0.0.1:34220");

    let (_, body) = server.get("/fallback").await?;
    assert_eq!(body[0]["sandbox_id"], "sb1");
    assert_eq!(body[0]["running"], true);

    let (status, _) = server
        .post(
            "/sandboxes/sb1/exec",
            json!({"command": "python", "code": "print(1)", "timeout": 0}),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server.get("/sandboxes/sb1/usage").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["executions_last_hour"], 1);

    let (_, body) = server.get("/usage").await?;
    assert_eq!(body["active_sandboxes"], 1);

    let (status, _) = server
        .post("/sandboxes/missing/exec", json!({"command": "python"}))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.delete("/sandboxes/sb1").await?;
    let (_, body) = server.get("/fallback").await?;
    assert_eq!(body, json!([]));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_background_jobs() -> anyhow::Result<()> {
    let server = TestServer::start(34230).await?;
    server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;

    let (status, body) = server
        .post(
            "/sandboxes/sb1/background",
            json!({"command": "python", "args": ["-c", "pass"], "interval": 5.0}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["job_id"].as_str().unwrap_or_default().to_string();

    let (_, body) = server.get("/sandboxes/sb1").await?;
    assert_eq!(body["background_jobs"], json!([job_id]));

    let (status, body) = server
        .delete(&format!("/sandboxes/sb1/background/{job_id}"))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let (status, _) = server
        .delete(&format!("/sandboxes/sb1/background/{job_id}"))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .post(
            "/sandboxes/missing/background",
            json!({"command": "python", "interval": 5.0}),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshots() -> anyhow::Result<()> {
    let server = TestServer::start(34240).await?;
    server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;
    server
        .post("/sandboxes/sb1/files", json!({"path": "a.txt", "data": "one"}))
        .await?;

    let (status, body) = server
        .post("/sandboxes/sb1/snapshots", json!({"snapshot_id": "first"}))
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["snapshot_id"], "first");

    server
        .post("/sandboxes/sb1/files", json!({"path": "a.txt", "data": "two"}))
        .await?;

    let (_, body) = server.get("/sandboxes/sb1/snapshots").await?;
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, body) = server
        .post("/sandboxes/sb1/snapshots/first/restore", json!({}))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restored"], true);

    let (_, body) = server.get("/sandboxes/sb1/files/a.txt").await?;
    assert_eq!(body["content"], "one");

    let (status, _) = server
        .post("/sandboxes/sb1/snapshots/nope/restore", json!({}))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.delete("/sandboxes/sb1/snapshots/first").await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = server.delete("/sandboxes/sb1/snapshots/first").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_preview_registration_and_proxy() -> anyhow::Result<()> {
    let server = TestServer::start(34250).await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let upstream = format!("http://{}", listener.local_addr()?);
    let app = Router::new()
        .route("/", get(|| async { "index" }))
        .route("/api/items", get(|| async { "items" }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let (status, body) = server
        .post(
            "/preview/register",
            json!({"sandbox_id": "sb1", "port": 3000, "backend_url": format!("{upstream}/")}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], upstream);
    assert_eq!(body["use_fallback"], false);

    let (_, body) = server.get("/preview/list").await?;
    assert_eq!(body["sb1:3000"]["port"], 3000);

    let response = server
        .client
        .get(server.url("/preview/sb1/3000/api/items"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await?, "items");

    let response = server.client.get(server.url("/preview/sb1/3000")).send().await?;
    assert_eq!(response.text().await?, "index");

    let (status, body) = server.get("/preview/sb1/4000/").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_type"], "not_found");

    assert_eq!(server.state.registry().list_targets().len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_expose_preview_requires_sandbox() -> anyhow::Result<()> {
    let server = TestServer::start(34260).await?;

    let (status, _) = server
        .post("/sandboxes/missing/preview", json!({"port": 3000}))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.post("/sandboxes", json!({"sandbox_id": "sb1"})).await?;
    let (status, body) = server
        .post("/sandboxes/sb1/preview", json!({"port": 3000}))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"]
        .as_str()
        .unwrap_or_default()
        .ends_with("/preview/sb1/3000"));

    let (_, body) = server.get("/sandboxes/sb1").await?;
    assert!(body["preview_ports"]["3000"].is_string());
    Ok(())
}
