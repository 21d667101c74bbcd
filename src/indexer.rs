use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error_codes::CaptureError;
use crate::frame_log::{FrameHeader, FRAME_HEADER_LEN};

/// What to do with a record cut short at the end of the log, which is what
/// a write interrupted mid-frame leaves behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncatedTailPolicy {
    /// Treat it as corruption and abort the scan.
    #[default]
    Fail,
    /// Drop the partial record and keep every complete one before it.
    DropPartial,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameIndexEntry {
    pub timestamp: f64,
    /// Absolute position of the first payload byte, right after the header.
    pub byte_offset: u64,
    pub length: u32,
}

impl FrameIndexEntry {
    /// One past the last payload byte.
    pub fn end(&self) -> u64 {
        self.byte_offset + u64::from(self.length)
    }
}

pub fn scan_path(path: &Path, policy: TruncatedTailPolicy) -> Result<Vec<FrameIndexEntry>> {
    let mut file = File::open(path).map_err(|error| {
        CaptureError::storage(
            "E_LOG_OPEN",
            format!("failed to open frame log {}: {error}", path.display()),
        )
    })?;
    let entries = scan(&mut file, policy)
        .with_context(|| format!("failed to index frame log {}", path.display()))?;
    debug!("indexed {} frames from {}", entries.len(), path.display());
    Ok(entries)
}

/// Indexes a log in one forward pass from its start. Payloads are skipped
/// with a relative seek and never read.
pub fn scan<R: Read + Seek>(
    reader: &mut R,
    policy: TruncatedTailPolicy,
) -> Result<Vec<FrameIndexEntry>> {
    let data_len = reader.seek(SeekFrom::End(0)).map_err(seek_error)?;
    reader.seek(SeekFrom::Start(0)).map_err(seek_error)?;

    let mut entries = Vec::new();
    let mut position = 0_u64;
    let mut header = [0_u8; FRAME_HEADER_LEN];

    loop {
        let filled = read_header(reader, &mut header)?;
        if filled == 0 {
            break;
        }
        if filled < FRAME_HEADER_LEN {
            truncated_tail(
                policy,
                format!(
                    "truncated frame header at byte {position}: {filled} of {FRAME_HEADER_LEN} bytes present"
                ),
            )?;
            break;
        }

        let FrameHeader { timestamp, length } = FrameHeader::decode(&header);
        let entry = FrameIndexEntry {
            timestamp,
            byte_offset: position + FRAME_HEADER_LEN as u64,
            length,
        };
        if entry.end() > data_len {
            truncated_tail(
                policy,
                format!(
                    "truncated frame payload at byte {}: header announces {length} bytes, {} present",
                    entry.byte_offset,
                    data_len - entry.byte_offset
                ),
            )?;
            break;
        }

        reader
            .seek(SeekFrom::Current(i64::from(length)))
            .map_err(seek_error)?;
        position = entry.end();
        entries.push(entry);
    }

    Ok(entries)
}

/// Fills `buf` as far as the data allows; returns how many bytes were read.
fn read_header<R: Read>(reader: &mut R, buf: &mut [u8; FRAME_HEADER_LEN]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => {
                return Err(CaptureError::storage(
                    "E_LOG_READ",
                    format!("failed to read frame header: {error}"),
                )
                .into())
            }
        }
    }
    Ok(filled)
}

fn truncated_tail(policy: TruncatedTailPolicy, message: String) -> Result<()> {
    match policy {
        TruncatedTailPolicy::Fail => {
            Err(CaptureError::internal_invariant("E_TRUNCATED_RECORD", message).into())
        }
        TruncatedTailPolicy::DropPartial => {
            warn!("{message}; dropping partial trailing record");
            Ok(())
        }
    }
}

fn seek_error(error: std::io::Error) -> anyhow::Error {
    CaptureError::storage("E_LOG_SEEK", format!("seek in frame log failed: {error}")).into()
}
