#![cfg(all(target_os = "linux", feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::process::{Child, Command, Output, Stdio};
use std::time::Duration;

struct Served {
    child: Child,
    addr: String,
}

impl Served {
    fn start(extra: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_tickchat"))
            .args(["--log-level", "error", "--format", "json", "serve"])
            .args(["--host", "127.0.0.1", "--port", "0", "--poll-ms", "10"])
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");

        let stdout = child.stdout.take().expect("stdout should be piped");
        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .expect("serve should announce its address");
        let announced: serde_json::Value =
            serde_json::from_str(&line).expect("announcement should be json");
        let addr = announced["addr"]
            .as_str()
            .expect("announcement should carry addr")
            .to_string();

        Self { child, addr }
    }

    fn send(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_tickchat"))
            .args(["--log-level", "error", "--format", "json", "send", &self.addr])
            .args(args)
            .output()
            .expect("send should run")
    }
}

impl Drop for Served {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn frames(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line should be json"))
        .collect()
}

#[test]
fn send_joins_and_sees_its_own_message() {
    let served = Served::start(&[]);
    let output = served.send(&["--channel", "3", "--name", "ivy", "--text", "hello"]);

    assert!(output.status.success(), "send failed: {output:?}");
    let frames = frames(&output);
    let events: Vec<&serde_json::Value> = frames
        .iter()
        .filter(|f| f["kind"] == "batch")
        .flat_map(|f| f["events"].as_array().expect("batch should list events"))
        .collect();

    assert!(events
        .iter()
        .any(|e| e["type"] == "system" && e["event"] == "join" && e["user_name"] == "ivy"));
    assert!(events
        .iter()
        .any(|e| e["type"] == "user" && e["event"] == "hello" && e["channel_id"] == 3));
}

#[test]
fn send_with_blank_name_is_refused() {
    let served = Served::start(&[]);
    let output = served.send(&["--channel", "1", "--name", "  "]);

    assert_eq!(output.status.code(), Some(1));
    let frames = frames(&output);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["kind"], "error");
    assert_eq!(frames[0]["error"], "A user name is required.");
}

#[test]
fn send_to_silent_server_times_out_with_124() {
    let silent = TcpListener::bind("127.0.0.1:0").expect("ephemeral bind should work");
    let addr = silent.local_addr().expect("listener should have an address");
    let holder = std::thread::spawn(move || {
        let accepted = silent.accept();
        std::thread::sleep(Duration::from_secs(2));
        drop(accepted);
    });

    let output = Command::new(env!("CARGO_BIN_EXE_tickchat"))
        .args(["send", &addr.to_string(), "--name", "wait"])
        .args(["--wait-timeout", "300ms"])
        .output()
        .expect("send should run");

    assert_eq!(output.status.code(), Some(124));
    let _ = holder.join();
}

#[test]
fn doctor_passes_on_clean_env() {
    let output = Command::new(env!("CARGO_BIN_EXE_tickchat"))
        .args(["--format", "json", "doctor", "--host", "127.0.0.1", "--port", "0"])
        .output()
        .expect("doctor should run");

    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("doctor should emit json");
    assert_eq!(report["overall"], "pass");
    let names: Vec<&str> = report["checks"]
        .as_array()
        .expect("checks should be a list")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"multiplexer"));
    assert!(names.contains(&"fd_limit"));
}
