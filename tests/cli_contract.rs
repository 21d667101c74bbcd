use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::tempdir;

use screentape::frame_log::FrameLog;

fn run_screentape(cwd: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_screentape"))
        .current_dir(cwd)
        .env_remove("SCREENTAPE_CONFIG")
        .args(args)
        .output()
        .expect("screentape command should run")
}

fn write_log(dir: &Path, name: &str, frames: &[(f64, &str)]) -> PathBuf {
    let path = dir.join(name);
    let mut log = FrameLog::create(&path).expect("log should create");
    for (timestamp, payload) in frames {
        log.append(*timestamp, payload.as_bytes())
            .expect("frame should append");
    }
    path
}

fn abc_log(dir: &Path) -> PathBuf {
    write_log(
        dir,
        "abc.framelog",
        &[(10.0, "a"), (10.2, "bb"), (10.35, "ccc")],
    )
}

#[test]
fn index_json_lists_frames_in_log_order() {
    let dir = tempdir().expect("tempdir should create");
    abc_log(dir.path());

    let output = run_screentape(dir.path(), &["index", "abc.framelog", "--json"]);
    assert!(
        output.status.success(),
        "index should succeed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json: Value = serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(json["ok"], true);
    let frames = json["frames"].as_array().expect("frames array");
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["byte_offset"], 12);
    assert_eq!(frames[1]["byte_offset"], 25);
    assert_eq!(frames[2]["byte_offset"], 39);
    assert_eq!(frames[2]["length"], 3);
}

#[test]
fn script_prints_subfile_entries() {
    let dir = tempdir().expect("tempdir should create");
    let log = abc_log(dir.path());

    let output = run_screentape(
        dir.path(),
        &["script", "abc.framelog", "--last-frame-duration", "0.5"],
    );
    assert!(output.status.success(), "script should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines = stdout.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 6);
    assert_eq!(
        lines[4],
        format!(
            "file 'subfile,,start,39,end,42,,:{}'",
            Path::new("abc.framelog").display()
        )
    );
    assert_eq!(lines[5], "duration 0.50000");
    assert!(log.exists());
}

#[test]
fn assemble_dry_run_applies_overrides() {
    let dir = tempdir().expect("tempdir should create");
    abc_log(dir.path());

    let output = run_screentape(
        dir.path(),
        &[
            "assemble",
            "abc.framelog",
            "-o",
            "out.mp4",
            "--set=-qp=20",
            "--remove=-fps_mode",
            "--dry-run",
        ],
    );
    assert!(
        output.status.success(),
        "dry run should succeed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("ffmpeg -y -f concat -safe 0"), "{stdout}");
    assert!(stdout.contains("-qp 20"), "{stdout}");
    assert!(!stdout.contains("-fps_mode"), "{stdout}");
    assert!(stdout.trim_end().ends_with("out.mp4"), "{stdout}");
    assert!(!dir.path().join("out.mp4").exists());
}

#[test]
fn config_file_sets_encoder_and_arguments() {
    let dir = tempdir().expect("tempdir should create");
    abc_log(dir.path());
    fs::write(
        dir.path().join("screentape.yaml"),
        r#"
encoder_binary: /opt/ffmpeg/bin/ffmpeg
args:
  set:
    - key: -c:v
      value: libx264
"#,
    )
    .expect("config should write");

    let output = run_screentape(
        dir.path(),
        &[
            "assemble",
            "abc.framelog",
            "-o",
            "out.mp4",
            "--dry-run",
            "--json",
        ],
    );
    assert!(output.status.success(), "dry run should succeed");

    let json: Value = serde_json::from_slice(&output.stdout).expect("stdout should be json");
    let command = json["command"]
        .as_array()
        .expect("command array")
        .iter()
        .map(|arg| arg.as_str().expect("string arg").to_owned())
        .collect::<Vec<_>>();
    assert_eq!(command[0], "/opt/ffmpeg/bin/ffmpeg");
    assert_eq!(
        &command[command.len() - 3..],
        ["-c:v", "libx264", "out.mp4"]
    );
    assert_eq!(json["frame_count"], 3);
}

#[test]
fn empty_log_assembly_fails_with_json_envelope() {
    let dir = tempdir().expect("tempdir should create");
    write_log(dir.path(), "empty.framelog", &[]);

    let output = run_screentape(
        dir.path(),
        &["assemble", "empty.framelog", "-o", "out.mp4", "--json"],
    );
    assert!(!output.status.success(), "empty recording should fail");

    let json: Value = serde_json::from_slice(&output.stdout).expect("stdout should be json");
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"]["code"], "E_EMPTY_RECORDING");
    assert_eq!(json["error"]["kind"], "external_process");
}

#[test]
fn truncated_log_needs_drop_partial() {
    let dir = tempdir().expect("tempdir should create");
    let log = abc_log(dir.path());
    let mut bytes = fs::read(&log).expect("log should read");
    bytes.truncate(bytes.len() - 1);
    fs::write(&log, bytes).expect("log should write");

    let strict = run_screentape(dir.path(), &["index", "abc.framelog", "--json"]);
    assert!(!strict.status.success());
    let json: Value = serde_json::from_slice(&strict.stdout).expect("stdout should be json");
    assert_eq!(json["error"]["kind"], "internal_invariant");

    let lenient = run_screentape(
        dir.path(),
        &["index", "abc.framelog", "--json", "--drop-partial"],
    );
    assert!(lenient.status.success());
    let json: Value = serde_json::from_slice(&lenient.stdout).expect("stdout should be json");
    assert_eq!(json["frames"].as_array().map(Vec::len), Some(2));
}

#[test]
fn bad_override_is_rejected() {
    let dir = tempdir().expect("tempdir should create");
    abc_log(dir.path());

    let output = run_screentape(
        dir.path(),
        &["assemble", "abc.framelog", "-o", "out.mp4", "--set=-qp", "--dry-run"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("E_ARG_OVERRIDE"));
}
