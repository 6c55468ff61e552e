//! Process-level handoff against the real binary.

mod common;

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::{Child, Command};

const HANDOFF_ADDR: &str = "127.0.0.1:28471";
const FAILED_SPAWN_ADDR: &str = "127.0.0.1:28472";

fn spawn_server(addr: &str, extra: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_graceful-handoff"))
        .args(["--bind", addr, "--slow-path-trigger-ratio", "0", "--drain-deadline", "5"])
        .args(extra)
        .env_remove("GRACEFUL_RESTART")
        .env_remove("GRACEFUL_FD")
        .env_remove("READY_PIPE_FD")
        .env_remove("NEW_BINARY_PATH")
        .env_remove("HANDOFF_CONFIG")
        .env_remove("LISTEN_PID")
        .env_remove("LISTEN_FDS")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

async fn status(client: &reqwest::Client, addr: &str) -> Option<Value> {
    let response = client.get(format!("http://{addr}/status")).send().await.ok()?;
    response.json().await.ok()
}

/// Poll `/status` until `accept` matches, or panic after 10s.
async fn wait_status(client: &reqwest::Client, addr: &str, accept: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..200 {
        if let Some(body) = status(client, addr).await {
            if accept(&body) {
                return body;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{addr} never reported the expected status");
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(rc, 0, "failed to signal {pid}");
}

#[tokio::test]
async fn sighup_hands_listener_to_successor_process() {
    let client = common::client();
    let mut predecessor = spawn_server(HANDOFF_ADDR, &[]);
    let predecessor_pid = predecessor.id().unwrap();

    let first = wait_status(&client, HANDOFF_ADDR, |_| true).await;
    assert_eq!(first["pid"], predecessor_pid);
    assert_eq!(first["role"], "fresh");

    send_signal(predecessor_pid, libc::SIGHUP);

    let second = wait_status(&client, HANDOFF_ADDR, |body| body["pid"] != predecessor_pid).await;
    assert_eq!(second["role"], "successor");
    let successor_pid = second["pid"].as_u64().unwrap() as u32;

    let exit = tokio::time::timeout(Duration::from_secs(10), predecessor.wait())
        .await
        .expect("predecessor did not exit after handoff")
        .unwrap();
    assert_eq!(exit.code(), Some(0));

    let still_served = wait_status(&client, HANDOFF_ADDR, |_| true).await;
    assert_eq!(still_served["pid"], successor_pid);

    send_signal(successor_pid, libc::SIGTERM);
    for _ in 0..200 {
        if tokio::net::TcpStream::connect(HANDOFF_ADDR).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("successor kept accepting after SIGTERM");
}

#[tokio::test]
async fn failed_spawn_leaves_predecessor_serving() {
    let client = common::client();
    let mut server = spawn_server(
        FAILED_SPAWN_ADDR,
        &["--successor-binary", "/nonexistent/graceful-handoff"],
    );
    let pid = server.id().unwrap();
    wait_status(&client, FAILED_SPAWN_ADDR, |_| true).await;

    send_signal(pid, libc::SIGHUP);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let body = wait_status(&client, FAILED_SPAWN_ADDR, |_| true).await;
    assert_eq!(body["pid"], pid);
    assert_eq!(body["role"], "fresh");

    send_signal(pid, libc::SIGTERM);
    let exit = tokio::time::timeout(Duration::from_secs(10), server.wait())
        .await
        .expect("server did not exit after SIGTERM")
        .unwrap();
    assert_eq!(exit.code(), Some(0));
}
