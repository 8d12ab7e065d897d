//! Smoke tests -- verify the binary runs and its subcommands are wired up.

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use assert_cmd::Command;
use predicates::str::contains;

use stressgen::config::{GovernorConfig, TemplateConfig};
use stressgen::worker::protocol::WorkerLaunch;
use stressgen::worker::WorkerSpec;
use stressgen::Protocol;

fn stressgen() -> Command {
    let mut cmd = Command::cargo_bin("stressgen").unwrap();
    cmd.env_remove("STRESSGEN_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn sink_port() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

#[test]
fn test_cli_help() {
    stressgen()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Adaptive-rate"));
}

#[test]
fn test_cli_version() {
    stressgen()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("stressgen"));
}

#[test]
fn test_run_subcommand_exists() {
    stressgen()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(contains("--mbps"));
}

#[test]
fn test_run_requires_a_rate() {
    stressgen()
        .args(["run", "-p", "udp", "-t", "127.0.0.1", "--port", "9"])
        .assert()
        .failure();
}

#[test]
fn test_run_rejects_unknown_protocol() {
    stressgen()
        .args(["run", "-p", "sctp", "-t", "127.0.0.1", "--rate", "1000"])
        .assert()
        .failure()
        .stderr(contains("unknown protocol"));
}

#[test]
fn test_config_prints_defaults() {
    stressgen()
        .arg("config")
        .assert()
        .success()
        .stdout(contains("[governor]"))
        .stdout(contains("max_burst = 262144"));
}

#[test]
fn test_config_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stressgen.toml");
    std::fs::write(&path, "[governor]\nmax_burst = 4096\n").unwrap();

    stressgen()
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(contains("max_burst = 4096"));
}

#[test]
fn test_config_env_path_is_used() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stressgen.toml");
    std::fs::write(&path, "[governor]\nmax_burst = 8192\n").unwrap();

    stressgen()
        .env("STRESSGEN_CONFIG", &path)
        .arg("config")
        .assert()
        .success()
        .stdout(contains("max_burst = 8192"));
}

#[test]
fn test_bad_config_env_path_falls_back_to_defaults() {
    stressgen()
        .env("STRESSGEN_CONFIG", "/nonexistent/stressgen.toml")
        .arg("config")
        .assert()
        .success()
        .stdout(contains("max_burst = 262144"));
}

#[test]
fn test_run_rejects_oversized_duration() {
    stressgen()
        .args(["run", "-p", "udp", "-t", "127.0.0.1", "--port", "9", "--rate", "1000"])
        .args(["--duration", "999999999999999999h"])
        .assert()
        .failure()
        .stderr(contains("too large"));
}

#[test]
fn test_udp_run_prints_summary() {
    let (_receiver, port) = sink_port();
    stressgen()
        .args(["run", "-p", "udp", "-t", "127.0.0.1", "--rate", "200000", "-w", "2"])
        .args(["--port", &port.to_string(), "--duration", "1s"])
        .timeout(Duration::from_secs(20))
        .assert()
        .success()
        .stdout(contains("Sending udp to 127.0.0.1"))
        .stdout(contains("packets"));
}

#[test]
fn test_udp_run_json_summary() {
    let (_receiver, port) = sink_port();
    stressgen()
        .args(["run", "-p", "udp", "-t", "127.0.0.1", "--mbps", "1", "-w", "1"])
        .args(["--port", &port.to_string(), "--duration", "500ms", "--json"])
        .timeout(Duration::from_secs(20))
        .assert()
        .success()
        .stdout(contains("\"total_packets\""))
        .stdout(contains("\"target_rate_bytes_per_sec\": 125000"));
}

#[test]
fn test_udp_run_with_process_workers() {
    let (_receiver, port) = sink_port();
    stressgen()
        .args(["run", "-p", "udp", "-t", "127.0.0.1", "--rate", "200000", "-w", "2"])
        .args(["--port", &port.to_string(), "--duration", "1s", "--mode", "process"])
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stdout(contains("with 2 worker(s)"));
}

#[test]
fn test_worker_subcommand_speaks_line_protocol() {
    let (_receiver, port) = sink_port();
    let launch = WorkerLaunch {
        spec: WorkerSpec {
            id: 3,
            protocol: Protocol::Udp,
            destination: Ipv4Addr::LOCALHOST,
            target_port: port,
            source: Ipv4Addr::UNSPECIFIED,
            rate_bytes_per_sec: 100_000,
            packet_size: 256,
        },
        governor: GovernorConfig::default(),
        template: TemplateConfig::default(),
    };
    let json = serde_json::to_string(&launch).unwrap();

    // Empty stdin means the parent has already asked the worker to stop.
    stressgen()
        .args(["worker", "--launch", &json])
        .write_stdin("")
        .timeout(Duration::from_secs(20))
        .assert()
        .success()
        .stdout(contains("\"event\":\"ready\",\"worker_id\":3"))
        .stdout(contains("\"event\":\"finished\""));
}
