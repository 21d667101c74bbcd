//! Screencast capture into a frame log.
//!
//! The source will not emit frame N+1 until it has seen the ack for frame N,
//! so every frame is acked before anything else happens to it, including
//! parsing its payload. Any latency added before the ack shows up as stutter
//! in the final video.

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::assembler::{AssemblySummary, VideoAssembler};
use crate::encoder_args::KeyedOverride;
use crate::error_codes::CaptureError;
use crate::frame_log::FrameLog;
use crate::indexer::{self, FrameIndexEntry};

pub const START_SCREENCAST: &str = "Page.startScreencast";
pub const STOP_SCREENCAST: &str = "Page.stopScreencast";
pub const SCREENCAST_FRAME: &str = "Page.screencastFrame";
pub const SCREENCAST_FRAME_ACK: &str = "Page.screencastFrameAck";

/// Transport to the screencast source (a DevTools page session).
pub trait ScreencastSession {
    /// Registers the caller as the consumer of `event`; the params of every
    /// later event of that name arrive on the returned receiver.
    fn subscribe(&mut self, event: &str) -> Result<Receiver<Value>>;

    /// Sends a command without waiting for its response.
    fn send_message(&mut self, method: &str, params: Value) -> Result<()>;

    /// Sends a command and blocks until the source answers it.
    fn send_message_sync(&mut self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreencastFormat {
    Jpeg,
    Png,
}

/// Start parameters. Unset fields are left out so the source uses its own
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreencastOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ScreencastFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every_nth_frame: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StartScreencastResponse {
    #[serde(rename = "sessionId")]
    session_id: Value,
    #[serde(rename = "streamId", alias = "id")]
    stream_id: Value,
}

#[derive(Debug, Deserialize)]
struct ScreencastFramePayload {
    data: String,
    #[serde(default)]
    metadata: ScreencastFrameMetadata,
}

/// Frames without a capture time are stored at 0.0.
#[derive(Debug, Default, Deserialize)]
struct ScreencastFrameMetadata {
    #[serde(default)]
    timestamp: f64,
}

/// Identifiers the source handed out when the screencast started. The two
/// are unrelated tokens.
#[derive(Debug)]
pub struct ActiveScreencast {
    pub session_id: Value,
    pub stream_id: Value,
    frames: Receiver<Value>,
}

#[derive(Debug)]
pub enum RecordingState {
    Idle,
    Recording(ActiveScreencast),
}

pub struct Recorder<S: ScreencastSession> {
    session: S,
    log: FrameLog,
    state: RecordingState,
}

impl<S: ScreencastSession> Recorder<S> {
    /// Records into a fresh temporary log that is deleted with the recorder.
    pub fn new(session: S) -> Result<Self> {
        Ok(Self::with_log(session, FrameLog::temporary()?))
    }

    pub fn with_log(session: S, log: FrameLog) -> Self {
        Self {
            session,
            log,
            state: RecordingState::Idle,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn state(&self) -> &RecordingState {
        &self.state
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecordingState::Recording(_))
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn frames_written(&self) -> u64 {
        self.log.frames_written()
    }

    pub fn start_recording(&mut self, options: &ScreencastOptions) -> Result<()> {
        if self.is_recording() {
            return Err(
                CaptureError::logic("E_ALREADY_RECORDING", "recording already started").into(),
            );
        }
        if self.log.is_failed() {
            return Err(CaptureError::storage(
                "E_LOG_FAILED",
                format!(
                    "frame log {} was abandoned after a failed write; record into a new log",
                    self.log.path().display()
                ),
            )
            .into());
        }

        let frames = self
            .session
            .subscribe(SCREENCAST_FRAME)
            .context("failed to subscribe to screencast frames")?;
        let params =
            serde_json::to_value(options).context("failed to encode screencast options")?;
        let response = self
            .session
            .send_message_sync(START_SCREENCAST, params)
            .context("failed to start screencast")?;
        let response: StartScreencastResponse =
            serde_json::from_value(response).map_err(|error| {
                CaptureError::argument(
                    "E_START_RESPONSE",
                    format!("unexpected {START_SCREENCAST} response: {error}"),
                )
            })?;

        info!(
            "screencast started (session {}, stream {}) into {}",
            response.session_id,
            response.stream_id,
            self.log.path().display()
        );
        self.state = RecordingState::Recording(ActiveScreencast {
            session_id: response.session_id,
            stream_id: response.stream_id,
            frames,
        });
        Ok(())
    }

    /// Persists every frame event already queued, without blocking.
    pub fn pump_frames(&mut self) -> Result<usize> {
        let RecordingState::Recording(active) = &self.state else {
            return Err(not_recording());
        };
        let drained = drain_frames(&active.frames, &mut self.session, &mut self.log);
        self.end_if_log_failed(drained)
    }

    /// Waits up to `timeout` for the next frame event and persists it.
    pub fn wait_for_frame(&mut self, timeout: Duration) -> Result<usize> {
        let RecordingState::Recording(active) = &self.state else {
            return Err(not_recording());
        };
        match active.frames.recv_timeout(timeout) {
            Ok(event) => {
                let persisted = persist_frame(&mut self.session, &mut self.log, &event);
                self.end_if_log_failed(persisted).map(|()| 1)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => {
                debug!("screencast frame stream closed by the source");
                Ok(0)
            }
        }
    }

    /// Stops the screencast, then persists frames the source queued before
    /// acknowledging the stop.
    pub fn stop_recording(&mut self) -> Result<()> {
        let RecordingState::Recording(active) =
            std::mem::replace(&mut self.state, RecordingState::Idle)
        else {
            return Err(not_recording());
        };
        if let Err(error) = self
            .session
            .send_message_sync(STOP_SCREENCAST, json!({ "sessionId": active.session_id }))
        {
            self.state = RecordingState::Recording(active);
            return Err(error.context("failed to stop screencast"));
        }

        let drained = drain_frames(&active.frames, &mut self.session, &mut self.log)?;
        info!(
            "screencast stopped after {} frames ({} drained at stop, {} bytes)",
            self.log.frames_written(),
            drained,
            self.log.bytes_written()
        );
        Ok(())
    }

    /// Indexes this recorder's log.
    pub fn frames(&self) -> Result<Vec<FrameIndexEntry>> {
        self.ensure_idle("index the recording")?;
        indexer::scan_path(self.log.path(), indexer::TruncatedTailPolicy::Fail)
    }

    pub fn generate_video(
        &self,
        assembler: &VideoAssembler,
        output_path: &Path,
        overrides: &[KeyedOverride],
        last_frame_duration: Option<f64>,
    ) -> Result<AssemblySummary> {
        self.ensure_idle("generate a video")?;
        assembler.assemble(self.log.path(), output_path, overrides, last_frame_duration)
    }

    /// Gives up the recorder and returns its log, e.g. to persist it.
    pub fn into_log(self) -> Result<FrameLog> {
        self.ensure_idle("release the frame log")?;
        Ok(self.log)
    }

    /// A failed append leaves a partial record at the end of the log. The
    /// screencast is stopped there and the recorder returns to idle, so the
    /// caller gets the storage error and no frame lands behind the damage.
    fn end_if_log_failed<T>(&mut self, result: Result<T>) -> Result<T> {
        let failure = match result {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        if !self.log.is_failed() {
            return Err(failure);
        }

        if let RecordingState::Recording(active) =
            std::mem::replace(&mut self.state, RecordingState::Idle)
        {
            error!(
                "recording into {} abandoned after {} frames: {failure:#}",
                self.log.path().display(),
                self.log.frames_written()
            );
            if let Err(stop_error) = self
                .session
                .send_message_sync(STOP_SCREENCAST, json!({ "sessionId": active.session_id }))
            {
                warn!("failed to stop screencast after log failure: {stop_error:#}");
            }
        }
        Err(failure)
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        if self.is_recording() {
            return Err(CaptureError::logic(
                "E_STILL_RECORDING",
                format!("cannot {action} while recording; stop the recording first"),
            )
            .into());
        }
        Ok(())
    }
}

fn not_recording() -> anyhow::Error {
    CaptureError::logic("E_NOT_RECORDING", "recording not started").into()
}

fn drain_frames<S: ScreencastSession>(
    frames: &Receiver<Value>,
    session: &mut S,
    log: &mut FrameLog,
) -> Result<usize> {
    let mut persisted = 0;
    loop {
        match frames.try_recv() {
            Ok(event) => {
                persist_frame(session, log, &event)?;
                persisted += 1;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                debug!("screencast frame stream closed by the source");
                break;
            }
        }
    }
    Ok(persisted)
}

fn persist_frame<S: ScreencastSession>(
    session: &mut S,
    log: &mut FrameLog,
    event: &Value,
) -> Result<()> {
    let session_id = event.get("sessionId").cloned().ok_or_else(|| {
        CaptureError::argument(
            "E_FRAME_EVENT",
            format!("{SCREENCAST_FRAME} event without sessionId"),
        )
    })?;
    if let Err(error) =
        session.send_message(SCREENCAST_FRAME_ACK, json!({ "sessionId": session_id }))
    {
        warn!("failed to ack screencast frame (session {session_id}): {error:#}");
    }

    let payload: ScreencastFramePayload =
        serde_json::from_value(event.clone()).map_err(|error| {
            CaptureError::argument(
                "E_FRAME_EVENT",
                format!("malformed {SCREENCAST_FRAME} event: {error}"),
            )
        })?;
    let bytes = BASE64.decode(payload.data.as_bytes()).map_err(|error| {
        CaptureError::argument(
            "E_FRAME_DATA",
            format!("frame data is not valid base64: {error}"),
        )
    })?;

    log.append(payload.metadata.timestamp, &bytes)?;
    debug!(
        "frame {} at {:.6}s, {} bytes",
        log.frames_written(),
        payload.metadata.timestamp,
        bytes.len()
    );
    Ok(())
}
