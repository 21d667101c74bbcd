use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tempfile::tempdir;

use screentape::assembler::VideoAssembler;
use screentape::concat_script::{self, DEFAULT_LAST_FRAME_DURATION};
use screentape::config::AssemblerConfig;
use screentape::encoder_args::KeyedOverride;
use screentape::error_codes::{find_capture_error, CaptureErrorKind};
use screentape::frame_log::FRAME_HEADER_LEN;
use screentape::indexer::{self, FrameIndexEntry, TruncatedTailPolicy};
use screentape::recorder::{
    Recorder, ScreencastOptions, ScreencastSession, SCREENCAST_FRAME_ACK, START_SCREENCAST,
};

#[derive(Default)]
struct ScriptedSession {
    frames: Option<Sender<Value>>,
    acks: usize,
}

impl ScriptedSession {
    fn emit_frame(&self, payload: &[u8], timestamp: f64) {
        self.frames
            .as_ref()
            .expect("recorder should have subscribed")
            .send(json!({
                "data": BASE64.encode(payload),
                "metadata": { "timestamp": timestamp, "offsetTop": 0, "pageScaleFactor": 1 },
                "sessionId": 1,
            }))
            .expect("recorder should be listening");
    }
}

impl ScreencastSession for ScriptedSession {
    fn subscribe(&mut self, _event: &str) -> Result<Receiver<Value>> {
        let (sender, receiver) = mpsc::channel();
        self.frames = Some(sender);
        Ok(receiver)
    }

    fn send_message(&mut self, method: &str, _params: Value) -> Result<()> {
        assert_eq!(method, SCREENCAST_FRAME_ACK);
        self.acks += 1;
        Ok(())
    }

    fn send_message_sync(&mut self, method: &str, _params: Value) -> Result<Value> {
        if method == START_SCREENCAST {
            return Ok(json!({ "sessionId": 1, "streamId": "stream-a" }));
        }
        Ok(json!({}))
    }
}

fn record(frames: &[(&[u8], f64)]) -> Recorder<ScriptedSession> {
    let mut recorder = Recorder::new(ScriptedSession::default()).expect("recorder should create");
    recorder
        .start_recording(&ScreencastOptions::default())
        .expect("recording should start");
    for (payload, timestamp) in frames {
        recorder.session().emit_frame(payload, *timestamp);
        recorder.pump_frames().expect("frame should persist");
    }
    recorder.stop_recording().expect("recording should stop");
    recorder
}

fn abc_frames() -> Vec<(&'static [u8], f64)> {
    vec![
        (b"a".as_slice(), 10.0),
        (b"bb".as_slice(), 10.2),
        (b"ccc".as_slice(), 10.35),
    ]
}

#[test]
fn three_frame_recording_has_expected_layout() {
    let recorder = record(&abc_frames());

    let log_len = fs::metadata(recorder.log_path())
        .expect("log should exist")
        .len();
    assert_eq!(log_len, 42);
    assert_eq!(recorder.session().acks, 3);

    let entries = recorder.frames().expect("log should index");
    assert_eq!(
        entries,
        vec![
            FrameIndexEntry {
                timestamp: 10.0,
                byte_offset: 12,
                length: 1
            },
            FrameIndexEntry {
                timestamp: 10.2,
                byte_offset: 25,
                length: 2
            },
            FrameIndexEntry {
                timestamp: 10.35,
                byte_offset: 39,
                length: 3
            },
        ]
    );

    let script =
        concat_script::generate(&entries, recorder.log_path(), DEFAULT_LAST_FRAME_DURATION)
            .expect("script should generate");
    let rendered = script.render();
    let lines = rendered.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 6);
    assert_eq!(
        lines[0],
        format!(
            "file 'subfile,,start,12,end,13,,:{}'",
            recorder.log_path().display()
        )
    );
    assert_eq!(lines[1], "duration 0.20000");
    assert_eq!(lines[3], "duration 0.15000");
    assert_eq!(lines[5], "duration 0.10000");
}

#[test]
fn recorded_payloads_round_trip_through_the_index() {
    let payloads = (0..50_usize)
        .map(|n| (0..n * 7).map(|byte| (byte % 251) as u8).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let frames = payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| (payload.as_slice(), 100.0 + index as f64 / 30.0))
        .collect::<Vec<_>>();
    let recorder = record(&frames);

    let entries = recorder.frames().expect("log should index");
    let bytes = fs::read(recorder.log_path()).expect("log should read");
    assert_eq!(entries.len(), payloads.len());
    for ((entry, payload), (_, timestamp)) in entries.iter().zip(&payloads).zip(&frames) {
        assert_eq!(entry.timestamp, *timestamp);
        let start = entry.byte_offset as usize;
        assert_eq!(&bytes[start..start + entry.length as usize], payload.as_slice());
    }
    for pair in entries.windows(2) {
        assert!(pair[1].byte_offset >= pair[0].end());
        assert_eq!(
            pair[1].byte_offset,
            pair[0].end() + FRAME_HEADER_LEN as u64
        );
    }

    let again = recorder.frames().expect("log should index twice");
    assert_eq!(entries, again);
}

#[test]
fn empty_recording_indexes_to_nothing() {
    let recorder = record(&[]);
    let entries = recorder.frames().expect("empty log should index");
    assert!(entries.is_empty());
    let script = concat_script::generate(&entries, recorder.log_path(), 0.1)
        .expect("empty script should generate");
    assert_eq!(script.render(), "");
}

#[test]
fn persisted_recording_can_be_indexed_by_path() {
    let dir = tempdir().expect("tempdir should create");
    let recorder = record(&[(b"one".as_slice(), 1.0), (b"two".as_slice(), 2.0)]);
    let kept = dir.path().join("session.framelog");
    let log = recorder
        .into_log()
        .expect("idle recorder releases its log")
        .persist(&kept)
        .expect("log should persist");
    drop(log);

    let entries = indexer::scan_path(&kept, TruncatedTailPolicy::Fail).expect("should index");
    assert_eq!(entries.len(), 2);
}

#[test]
fn interrupted_trailing_write_is_reported_unless_dropped() {
    let dir = tempdir().expect("tempdir should create");
    let recorder = record(&[(b"whole".as_slice(), 1.0), (b"cut short".as_slice(), 2.0)]);
    let path = dir.path().join("partial.framelog");
    let mut bytes = fs::read(recorder.log_path()).expect("log should read");
    bytes.truncate(bytes.len() - 3);
    fs::write(&path, bytes).expect("partial log should write");

    let error = indexer::scan_path(&path, TruncatedTailPolicy::Fail).unwrap_err();
    assert_eq!(
        find_capture_error(&error).map(|coded| coded.kind),
        Some(CaptureErrorKind::InternalInvariant)
    );

    let entries =
        indexer::scan_path(&path, TruncatedTailPolicy::DropPartial).expect("should index");
    assert_eq!(entries.len(), 1);
}

#[cfg(unix)]
fn write_fake_encoder(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("fake encoder should write");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .expect("fake encoder should be executable");
    path
}

#[cfg(unix)]
#[test]
fn assemble_hands_script_and_output_to_the_encoder() {
    let dir = tempdir().expect("tempdir should create");
    // Copies the concat script (the value after -i) to the last argument.
    let encoder = write_fake_encoder(
        dir.path(),
        r#"while [ "$#" -gt 1 ]; do
  if [ "$1" = "-i" ]; then script="$2"; fi
  shift
done
cp "$script" "$1""#,
    );
    let recorder = record(&abc_frames());
    let assembler = VideoAssembler::new(AssemblerConfig {
        encoder_binary: encoder.display().to_string(),
        ..AssemblerConfig::default()
    });
    let output = dir.path().join("nested/out.mp4");

    let summary = recorder
        .generate_video(
            &assembler,
            &output,
            &[KeyedOverride::set("-qp", "20")],
            Some(0.25),
        )
        .expect("assembly should succeed");

    assert_eq!(summary.frame_count, 3);
    let script = fs::read_to_string(&output).expect("fake encoder should copy the script");
    assert!(script.starts_with("file 'subfile,,start,12,end,13,,:"));
    assert!(script.ends_with("duration 0.25000\n"));
}

#[cfg(unix)]
#[test]
fn non_zero_encoder_exit_is_an_external_process_error() {
    let dir = tempdir().expect("tempdir should create");
    let encoder = write_fake_encoder(dir.path(), "echo 'simulated failure' >&2\nexit 3");
    let recorder = record(&[(b"a".as_slice(), 0.0)]);
    let assembler = VideoAssembler::new(AssemblerConfig {
        encoder_binary: encoder.display().to_string(),
        ..AssemblerConfig::default()
    });

    let error = recorder
        .generate_video(&assembler, &dir.path().join("out.mp4"), &[], None)
        .unwrap_err();
    let coded = find_capture_error(&error).expect("coded error");
    assert_eq!(coded.kind, CaptureErrorKind::ExternalProcess);
    assert_eq!(coded.exit_status(), Some(3));
    assert!(coded.message.contains("simulated failure"));
    assert!(
        recorder.log_path().exists(),
        "frames stay on disk after a failed encode"
    );
}
