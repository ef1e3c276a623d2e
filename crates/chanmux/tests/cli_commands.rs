#![cfg(all(unix, feature = "cli"))]

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chanmux_channel::{MessageEvent, VirtualChannel};
use chanmux_peer::connect;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/chanmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn spawn_server(sock_path: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve command should start")
}

fn wait_for_server(path: &Path, timeout: Duration) -> io::Result<()> {
    let start = Instant::now();
    loop {
        match connect(path, "echo", &BTreeMap::new()) {
            Ok(_connection) => return Ok(()),
            Err(err) => {
                if start.elapsed() >= timeout {
                    return Err(io::Error::other(format!("connect timeout: {err}")));
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn stop(mut child: Child, dir: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn open_upper_channel_prints_json_reply() {
    let dir = unique_temp_dir("upper");
    let sock_path = dir.join("demo.sock");
    let child = spawn_server(&sock_path);
    wait_for_server(&sock_path, Duration::from_secs(3)).expect("server should come up");

    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("--log-level")
        .arg("error")
        .arg("--format")
        .arg("json")
        .arg("open")
        .arg(&sock_path)
        .arg("--code")
        .arg("UPPR")
        .arg("--text")
        .arg("hello")
        .arg("--wait")
        .output()
        .expect("open should run");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("open should emit json");
    assert_eq!(payload["code"], "UPPR");
    assert_eq!(payload["kind"], "text");
    assert_eq!(payload["payload"], "HELLO");
    assert_eq!(payload["channel_id"].as_u64().map(|id| id % 2), Some(1));

    stop(child, &dir);
}

#[test]
fn open_echo_channel_returns_binary_unchanged() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("demo.sock");
    let child = spawn_server(&sock_path);
    wait_for_server(&sock_path, Duration::from_secs(3)).expect("server should come up");

    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("--format")
        .arg("raw")
        .arg("--log-level")
        .arg("error")
        .arg("open")
        .arg(&sock_path)
        .arg("--code")
        .arg("ECHO")
        .arg("--data")
        .arg("ping")
        .arg("--wait")
        .output()
        .expect("open should run");

    assert!(output.status.success());
    assert_eq!(output.stdout, b"ping");

    stop(child, &dir);
}

#[test]
fn unknown_code_is_refused_with_policy_violation() {
    let dir = unique_temp_dir("refused");
    let sock_path = dir.join("demo.sock");
    let child = spawn_server(&sock_path);
    wait_for_server(&sock_path, Duration::from_secs(3)).expect("server should come up");

    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("--log-level")
        .arg("error")
        .arg("open")
        .arg(&sock_path)
        .arg("--code")
        .arg("NOPE")
        .arg("--data")
        .arg("x")
        .arg("--wait")
        .output()
        .expect("open should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("1008"), "stderr: {stderr}");

    stop(child, &dir);
}

#[test]
fn direct_echo_action_against_server() {
    let dir = unique_temp_dir("direct");
    let sock_path = dir.join("demo.sock");
    let child = spawn_server(&sock_path);
    wait_for_server(&sock_path, Duration::from_secs(3)).expect("server should come up");

    let channel = connect(&sock_path, "echo", &BTreeMap::new())
        .expect("client should connect")
        .into_direct()
        .expect("direct channel should start");
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    channel.on_message(Arc::new(move |event: &MessageEvent| {
        let _ = tx.lock().unwrap().send(event.data.as_text().map(str::to_string));
    }));
    channel.send_text("direct").expect("send should succeed");

    let reply = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo should arrive");
    assert_eq!(reply.as_deref(), Some("direct"));

    channel.close(None, None);
    stop(child, &dir);
}

#[test]
fn open_against_missing_socket_returns_3() {
    let dir = unique_temp_dir("missing");
    let missing = dir.join("absent.sock");

    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("open")
        .arg(&missing)
        .arg("--code")
        .arg("ECHO")
        .arg("--data")
        .arg("x")
        .output()
        .expect("open should run");

    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_chanmux"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("chanmux {}", env!("CARGO_PKG_VERSION"))
    );
}
