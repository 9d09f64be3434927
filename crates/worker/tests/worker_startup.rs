use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio::time::sleep;

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Create a minimal valid config with every path inside `dir`
fn minimal_config(port: u16, dir: &Path) -> String {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = {port}

[database]
path = "{db}"

[storage]
root = "{storage}"

[worker]
concurrency = 1
work_root = "{work}"
"#,
        port = port,
        db = dir.join("callaudit.db").display(),
        storage = dir.join("storage").display(),
        work = dir.join("work").display(),
    )
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

/// Spawn the worker and return a handle
fn spawn_worker(config_path: &Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_callaudit-worker"))
        .env("CALLAUDIT_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn worker")
}

/// Wait for the ops server to be ready
async fn wait_for_worker(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = TempDir::new().unwrap();
    let port = get_available_port();
    let config = write_config(&minimal_config(port, dir.path()));

    let mut worker = spawn_worker(config.path());
    assert!(wait_for_worker(port, 100).await, "Worker did not start in time");

    let response = Client::new()
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .expect("Failed to send request");
    assert!(response.status().is_success());

    let json: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["status"], "ok");

    worker.kill().await.ok();
}

#[tokio::test]
async fn test_status_reports_running_pool() {
    let dir = TempDir::new().unwrap();
    let port = get_available_port();
    let config = write_config(&minimal_config(port, dir.path()));

    let mut worker = spawn_worker(config.path());
    assert!(wait_for_worker(port, 100).await, "Worker did not start in time");

    let json: serde_json::Value = Client::new()
        .get(format!("http://127.0.0.1:{}/status", port))
        .send()
        .await
        .expect("Failed to send request")
        .json()
        .await
        .expect("Failed to parse JSON");

    assert_eq!(json["pool"]["running"], true);
    assert_eq!(json["pool"]["workers"], 1);
    assert_eq!(json["jobs"]["processing"], 0);
    assert_eq!(json["reconciler_running"], true);

    let metrics = Client::new()
        .get(format!("http://127.0.0.1:{}/metrics", port))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("callaudit_worker_pool_running 1"));

    worker.kill().await.ok();
}

#[tokio::test]
async fn test_invalid_config_exits_with_error() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&format!(
        "{}\n[pipeline]\nmax_attempts = 0\n",
        minimal_config(get_available_port(), dir.path())
    ));

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        spawn_worker(config.path()).wait(),
    )
    .await
    .expect("Worker did not exit")
    .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_missing_config_exits_with_error() {
    let status = tokio::time::timeout(
        Duration::from_secs(10),
        spawn_worker(Path::new("/nonexistent/callaudit.toml")).wait(),
    )
    .await
    .expect("Worker did not exit")
    .unwrap();
    assert!(!status.success());
}
