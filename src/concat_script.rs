use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::error_codes::CaptureError;
use crate::frame_log::FRAME_HEADER_LEN;
use crate::indexer::FrameIndexEntry;

/// Display time given to the final frame, which has no successor to measure
/// against. Picked empirically.
pub const DEFAULT_LAST_FRAME_DURATION: f64 = 0.1;

/// A `[start, end)` byte window into the frame log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatEntry {
    pub range: ByteRange,
    pub duration: f64,
}

/// ffmpeg concat demuxer input addressing frames inside one log file through
/// the `subfile` protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatScript {
    log_path: PathBuf,
    entries: Vec<ConcatEntry>,
}

impl ConcatScript {
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn entries(&self) -> &[ConcatEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_duration(&self) -> f64 {
        self.entries.iter().map(|entry| entry.duration).sum()
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConcatScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log_path = escape_single_quotes(&self.log_path.to_string_lossy());
        for entry in &self.entries {
            writeln!(
                f,
                "file 'subfile,,start,{},end,{},,:{}'",
                entry.range.start, entry.range.end, log_path
            )?;
            writeln!(f, "duration {:.5}", entry.duration)?;
        }
        Ok(())
    }
}

/// Builds the script for `entries`, which must be in log order.
///
/// Each frame lasts until the next frame's timestamp; the last one lasts
/// `last_frame_duration`. Zero or negative durations, inferred or supplied,
/// are kept as-is for the encoder to deal with.
pub fn generate(
    entries: &[FrameIndexEntry],
    log_path: &Path,
    last_frame_duration: f64,
) -> Result<ConcatScript> {
    if !last_frame_duration.is_finite() {
        return Err(CaptureError::argument(
            "E_LAST_FRAME_DURATION",
            format!("last frame duration must be a finite number of seconds, got {last_frame_duration}"),
        )
        .into());
    }
    validate_log_order(entries)?;

    let script_entries = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let duration = entries
                .get(index + 1)
                .map_or(last_frame_duration, |next| next.timestamp - entry.timestamp);
            ConcatEntry {
                range: ByteRange {
                    start: entry.byte_offset,
                    end: entry.end(),
                },
                duration,
            }
        })
        .collect();

    Ok(ConcatScript {
        log_path: log_path.to_path_buf(),
        entries: script_entries,
    })
}

fn validate_log_order(entries: &[FrameIndexEntry]) -> Result<()> {
    let mut previous_end = 0_u64;
    for (index, entry) in entries.iter().enumerate() {
        let earliest = previous_end + FRAME_HEADER_LEN as u64;
        if entry.byte_offset < earliest {
            return Err(CaptureError::argument(
                "E_FRAME_ORDER",
                format!(
                    "frame {index} starts at byte {} but cannot start before byte {earliest}; entries are not an ordered frame index",
                    entry.byte_offset
                ),
            )
            .into());
        }
        previous_end = entry.end();
    }
    Ok(())
}

fn escape_single_quotes(value: &str) -> String {
    value.replace('\'', r"'\''")
}
