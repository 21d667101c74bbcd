//! Append-only frame log.
//!
//! A log is a bare sequence of records, each a 12-byte header followed by the
//! payload it announces:
//!
//! ```text
//! [f64 timestamp, 8 bytes LE][u32 payload length, 4 bytes LE][payload]
//! ```
//!
//! There is no file header, no padding and no checksum; end of file is the
//! only terminator. A record whose payload is cut short makes every later
//! record unreadable, so a failed write leaves the log refusing further
//! appends.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::error;
use tempfile::NamedTempFile;

use crate::error_codes::{find_capture_error, CaptureError};

pub const FRAME_HEADER_LEN: usize = 12;

const TEMP_LOG_PREFIX: &str = "screentape-";
const TEMP_LOG_SUFFIX: &str = ".framelog";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// Source-provided capture time in seconds.
    pub timestamp: f64,
    /// Payload byte count.
    pub length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0_u8; FRAME_HEADER_LEN];
        bytes[..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8..].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        let mut timestamp = [0_u8; 8];
        timestamp.copy_from_slice(&bytes[..8]);
        let mut length = [0_u8; 4];
        length.copy_from_slice(&bytes[8..]);
        Self {
            timestamp: f64::from_le_bytes(timestamp),
            length: u32::from_le_bytes(length),
        }
    }
}

enum LogBacking {
    Temporary(NamedTempFile),
    Persistent { file: File, path: PathBuf },
    Sink {
        writer: Box<dyn Write + Send>,
        path: PathBuf,
    },
}

/// Write end of a frame log. Only the recorder appends to it.
pub struct FrameLog {
    backing: LogBacking,
    bytes_written: u64,
    frames_written: u64,
    failure: Option<&'static str>,
}

impl FrameLog {
    /// Creates a log in the system temp directory; it is deleted on drop
    /// unless [`FrameLog::persist`] is called.
    pub fn temporary() -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(TEMP_LOG_PREFIX)
            .suffix(TEMP_LOG_SUFFIX)
            .tempfile()
            .map_err(|error| {
                CaptureError::storage(
                    "E_LOG_CREATE",
                    format!("failed to create temp file for recording: {error}"),
                )
            })?;
        Ok(Self::from_backing(LogBacking::Temporary(temp)))
    }

    pub fn temporary_in(dir: &Path) -> Result<Self> {
        create_log_dir(dir)?;
        let temp = tempfile::Builder::new()
            .prefix(TEMP_LOG_PREFIX)
            .suffix(TEMP_LOG_SUFFIX)
            .tempfile_in(dir)
            .map_err(|error| {
                CaptureError::storage(
                    "E_LOG_CREATE",
                    format!(
                        "failed to create temp file for recording in {}: {error}",
                        dir.display()
                    ),
                )
            })?;
        Ok(Self::from_backing(LogBacking::Temporary(temp)))
    }

    /// Creates (or truncates) a log at `path` that outlives the process.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            create_log_dir(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|error| {
                CaptureError::storage(
                    "E_LOG_CREATE",
                    format!("failed to create frame log {}: {error}", path.display()),
                )
            })?;
        Ok(Self::from_backing(LogBacking::Persistent {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Log over an arbitrary byte sink such as a pipe. `path` is only used in
    /// messages; the log cannot be indexed or persisted through it.
    pub fn from_writer(writer: impl Write + Send + 'static, path: impl Into<PathBuf>) -> Self {
        Self::from_backing(LogBacking::Sink {
            writer: Box::new(writer),
            path: path.into(),
        })
    }

    fn from_backing(backing: LogBacking) -> Self {
        Self {
            backing,
            bytes_written: 0,
            frames_written: 0,
            failure: None,
        }
    }

    pub fn path(&self) -> &Path {
        match &self.backing {
            LogBacking::Temporary(temp) => temp.path(),
            LogBacking::Persistent { path, .. } | LogBacking::Sink { path, .. } => path,
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.backing, LogBacking::Temporary(_))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// True once a write has failed. Whatever follows the last whole record
    /// on disk is unreliable from then on.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Appends one record with a single write call.
    ///
    /// A failed write poisons the log: every later append is refused with
    /// `E_LOG_FAILED`, so nothing lands behind a partial record.
    pub fn append(&mut self, timestamp: f64, payload: &[u8]) -> Result<()> {
        if let Some(code) = self.failure {
            return Err(CaptureError::storage(
                "E_LOG_FAILED",
                format!(
                    "frame log {} stopped accepting frames after {code}",
                    self.path().display()
                ),
            )
            .into());
        }

        let path = self.path().display().to_string();
        let record = encode_record(timestamp, payload)
            .with_context(|| format!("failed to append frame to {path}"))?;
        let writer: &mut dyn Write = match &mut self.backing {
            LogBacking::Temporary(temp) => temp.as_file_mut(),
            LogBacking::Persistent { file, .. } => file,
            LogBacking::Sink { writer, .. } => &mut **writer,
        };
        match write_record(writer, &record) {
            Ok(written) => {
                self.bytes_written += written as u64;
                self.frames_written += 1;
                Ok(())
            }
            Err(write_error) => {
                let code = find_capture_error(&write_error)
                    .map_or("E_LOG_WRITE", |coded| coded.code);
                error!(
                    "frame log {path} failed after {} frames ({code}); later appends are refused",
                    self.frames_written
                );
                self.failure = Some(code);
                Err(write_error.context(format!("failed to append frame to {path}")))
            }
        }
    }

    /// Moves the log to `path` so it is kept after the owner goes away.
    pub fn persist(self, path: &Path) -> Result<Self> {
        let Self {
            backing,
            bytes_written,
            frames_written,
            failure,
        } = self;
        let file = match backing {
            LogBacking::Temporary(temp) => temp.persist(path).map_err(|error| {
                CaptureError::storage(
                    "E_LOG_PERSIST",
                    format!(
                        "failed to persist recording to {}: {}",
                        path.display(),
                        error.error
                    ),
                )
            })?,
            LogBacking::Persistent {
                file,
                path: current,
            } => {
                fs::rename(&current, path).map_err(|error| {
                    CaptureError::storage(
                        "E_LOG_PERSIST",
                        format!(
                            "failed to move recording {} to {}: {error}",
                            current.display(),
                            path.display()
                        ),
                    )
                })?;
                file
            }
            LogBacking::Sink { path: current, .. } => {
                return Err(CaptureError::storage(
                    "E_LOG_PERSIST",
                    format!(
                        "frame log {} is not file backed and cannot be persisted",
                        current.display()
                    ),
                )
                .into());
            }
        };
        Ok(Self {
            backing: LogBacking::Persistent {
                file,
                path: path.to_path_buf(),
            },
            bytes_written,
            frames_written,
            failure,
        })
    }
}

fn create_log_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|error| {
        CaptureError::storage(
            "E_LOG_CREATE",
            format!("failed to create log directory {}: {error}", dir.display()),
        )
        .into()
    })
}

/// Serializes header and payload into one buffer.
pub(crate) fn encode_record(timestamp: f64, payload: &[u8]) -> Result<Vec<u8>> {
    let length = u32::try_from(payload.len()).map_err(|_| {
        CaptureError::storage(
            "E_FRAME_TOO_LARGE",
            format!(
                "frame payload of {} bytes does not fit the 32-bit length field",
                payload.len()
            ),
        )
    })?;

    let mut record = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    record.extend_from_slice(&FrameHeader { timestamp, length }.encode());
    record.extend_from_slice(payload);
    Ok(record)
}

/// Hands `record` to the writer in a single `write` call. Returns the number
/// of bytes written.
pub(crate) fn write_record<W: Write + ?Sized>(writer: &mut W, record: &[u8]) -> Result<usize> {
    let written = writer.write(record).map_err(|error| {
        CaptureError::storage("E_LOG_WRITE", format!("write to frame log failed: {error}"))
    })?;
    if written != record.len() {
        return Err(CaptureError::storage(
            "E_SHORT_WRITE",
            format!("could only write {written} of {} bytes to disk", record.len()),
        )
        .into());
    }
    Ok(written)
}
