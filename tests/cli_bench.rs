use serde_json::Value;
use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "collbench-{prefix}-{}-{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn bench_command() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_allreduce_bench"));
    cmd.env_clear();
    cmd
}

fn single_rank_env(cmd: &mut Command, port: &str) {
    cmd.env("MASTER_ADDR", "127.0.0.1")
        .env("MASTER_PORT", port)
        .env("WORLD_SIZE", "1")
        .env("RANK", "0");
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn missing_coordination_env_fails_with_configuration_error() {
    let output = bench_command()
        .args(["--element-count", "16", "--experiments", "1", "--calls", "1"])
        .output()
        .expect("run allreduce_bench");
    assert!(!output.status.success(), "expected non-zero exit");
    let text = combined_output(&output);
    assert!(text.contains("ConfigurationError"), "output: {text}");
    for field in ["MASTER_ADDR", "MASTER_PORT", "WORLD_SIZE", "RANK"] {
        assert!(text.contains(field), "missing {field} in output: {text}");
    }
}

#[test]
fn out_of_range_master_port_is_rejected() {
    let mut cmd = bench_command();
    single_rank_env(&mut cmd, "65536");
    let output = cmd
        .args(["--element-count", "16", "--experiments", "1", "--calls", "1"])
        .output()
        .expect("run allreduce_bench");
    assert!(!output.status.success(), "expected non-zero exit");
    let text = combined_output(&output);
    assert!(text.contains("ConfigurationError"), "output: {text}");
    assert!(text.contains("MASTER_PORT"), "output: {text}");
}

#[test]
fn unknown_backend_is_rejected() {
    let mut cmd = bench_command();
    single_rank_env(&mut cmd, "29500");
    let output = cmd
        .args(["--backend", "carrier-pigeon"])
        .output()
        .expect("run allreduce_bench");
    assert!(!output.status.success(), "expected non-zero exit");
    let text = combined_output(&output);
    assert!(text.contains("ConfigurationError"), "output: {text}");
}

#[test]
fn single_rank_run_reports_unbounded_bandwidth() {
    let dir = unique_temp_dir("single-rank");
    let report_path = dir.join("report.json");

    let mut cmd = bench_command();
    single_rank_env(&mut cmd, "29500");
    let output = cmd
        .args([
            "--element-count",
            "1024",
            "--experiments",
            "1",
            "--calls",
            "1",
            "--pause-ms",
            "0",
            "--report-json",
            report_path.to_str().unwrap(),
        ])
        .output()
        .expect("run allreduce_bench");
    assert!(
        output.status.success(),
        "allreduce_bench failed: {}",
        combined_output(&output)
    );
    let text = combined_output(&output);
    assert!(text.contains("MB/s"), "output: {text}");

    let raw = fs::read_to_string(&report_path).expect("read report.json");
    let v: Value = serde_json::from_str(&raw).expect("parse report.json");
    assert_eq!(v.get("world_size").and_then(Value::as_u64), Some(1));
    assert_eq!(v.get("element_count").and_then(Value::as_u64), Some(1024));
    assert_eq!(v.get("dtype").and_then(Value::as_str), Some("bf16"));
    assert!(v.get("bandwidth_mbps").is_some_and(Value::is_null));
    assert_eq!(v.get("total_megabytes").and_then(Value::as_f64), Some(0.0));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn local_backend_runs_a_full_session() {
    let mut cmd = bench_command();
    single_rank_env(&mut cmd, "29500");
    let output = cmd
        .args([
            "--backend",
            "local",
            "--element-count",
            "256",
            "--experiments",
            "2",
            "--calls",
            "2",
            "--pause-ms",
            "0",
        ])
        .output()
        .expect("run allreduce_bench");
    assert!(
        output.status.success(),
        "allreduce_bench failed: {}",
        combined_output(&output)
    );
    assert!(combined_output(&output).contains("MB/s"));
}

#[test]
fn two_rank_socket_session_measures_real_traffic() {
    let dir = unique_temp_dir("two-rank");
    let report_path = dir.join("report.json");
    let port = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind probe listener");
        listener.local_addr().expect("probe local addr").port()
    };

    let mut children = Vec::new();
    for rank in 0..2 {
        let mut cmd = bench_command();
        cmd.env("MASTER_ADDR", "127.0.0.1")
            .env("MASTER_PORT", port.to_string())
            .env("WORLD_SIZE", "2")
            .env("RANK", rank.to_string())
            .args([
                "--element-count",
                "4096",
                "--experiments",
                "1",
                "--calls",
                "2",
                "--pause-ms",
                "0",
            ]);
        if rank == 0 {
            cmd.args(["--report-json", report_path.to_str().unwrap()]);
        }
        children.push(cmd.spawn().expect("spawn allreduce_bench"));
    }
    for child in &mut children {
        let status = child.wait().expect("wait for allreduce_bench");
        assert!(status.success(), "a rank exited with {status}");
    }

    let raw = fs::read_to_string(&report_path).expect("read report.json");
    let v: Value = serde_json::from_str(&raw).expect("parse report.json");
    assert_eq!(v.get("world_size").and_then(Value::as_u64), Some(2));
    // 4096 bf16 elements: 8 KiB per call, 2 * (2 - 1) * 8 KiB total.
    let total = v
        .get("total_megabytes")
        .and_then(Value::as_f64)
        .expect("total_megabytes");
    assert!((total - 0.015625).abs() < 1e-12, "total={total}");

    let _ = fs::remove_dir_all(&dir);
}
