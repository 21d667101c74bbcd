use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::concat_script::{self, ConcatScript};
use crate::config::AssemblerConfig;
use crate::encoder_args::{display_command, EncoderArgs, KeyedOverride};
use crate::error_codes::CaptureError;
use crate::indexer::{self, FrameIndexEntry};

const STDERR_TAIL_CHARS: usize = 500;

/// Everything needed to run the encoder, short of writing the script file.
#[derive(Debug, Clone)]
pub struct AssemblyPlan {
    pub entries: Vec<FrameIndexEntry>,
    pub script: ConcatScript,
    pub encoder_binary: String,
    pub args: EncoderArgs,
}

impl AssemblyPlan {
    pub fn command_args(&self, script_path: &Path, output_path: &Path) -> Vec<OsString> {
        self.args.resolve(script_path, output_path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssemblySummary {
    pub output: PathBuf,
    pub frame_count: usize,
    pub duration_seconds: f64,
    pub encoder_binary: String,
}

pub struct VideoAssembler {
    config: AssemblerConfig,
}

impl Default for VideoAssembler {
    fn default() -> Self {
        Self::new(AssemblerConfig::default())
    }
}

impl VideoAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// Indexes the log and builds the script and argument list. `overrides`
    /// apply after the configured ones.
    pub fn plan(
        &self,
        log_path: &Path,
        overrides: &[KeyedOverride],
        last_frame_duration: Option<f64>,
    ) -> Result<AssemblyPlan> {
        let entries = indexer::scan_path(log_path, self.config.truncated_tail)?;
        let script = concat_script::generate(
            &entries,
            log_path,
            last_frame_duration.unwrap_or(self.config.last_frame_duration),
        )?;

        let mut args = EncoderArgs::defaults();
        args.apply_all(&self.config.overrides);
        args.apply_all(overrides);

        Ok(AssemblyPlan {
            entries,
            script,
            encoder_binary: self.config.encoder_binary.clone(),
            args,
        })
    }

    /// Runs index → script → encoder and waits for the encoder to exit.
    pub fn assemble(
        &self,
        log_path: &Path,
        output_path: &Path,
        overrides: &[KeyedOverride],
        last_frame_duration: Option<f64>,
    ) -> Result<AssemblySummary> {
        validate_output_path(output_path)?;

        let plan = self.plan(log_path, overrides, last_frame_duration)?;
        // ffmpeg rejects an empty concat list; fail the same way without
        // starting it.
        if plan.entries.is_empty() {
            return Err(CaptureError::external_process(
                "E_EMPTY_RECORDING",
                format!(
                    "failed to create video: frame log {} contains no frames",
                    log_path.display()
                ),
                None,
            )
            .into());
        }

        if let Some(parent) = output_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(|error| {
                CaptureError::storage(
                    "E_OUTPUT_DIR",
                    format!(
                        "failed to create output directory {}: {error}",
                        parent.display()
                    ),
                )
            })?;
        }

        let script_file = self.write_script(&plan.script)?;
        let args = plan.command_args(script_file.path(), output_path);
        info!(
            "encoding {} frames ({:.3}s) from {} into {}",
            plan.entries.len(),
            plan.script.total_duration(),
            log_path.display(),
            output_path.display()
        );
        run_encoder(&plan.encoder_binary, &args)?;

        Ok(AssemblySummary {
            output: output_path.to_path_buf(),
            frame_count: plan.entries.len(),
            duration_seconds: plan.script.total_duration(),
            encoder_binary: plan.encoder_binary,
        })
    }

    fn write_script(&self, script: &ConcatScript) -> Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("screentape-concat-").suffix(".ffconcat");
        let created = match &self.config.script_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|error| {
                    CaptureError::storage(
                        "E_SCRIPT_CREATE",
                        format!("failed to create script directory {}: {error}", dir.display()),
                    )
                })?;
                builder.tempfile_in(dir)
            }
            None => builder.tempfile(),
        };
        let mut file = created.map_err(|error| {
            CaptureError::storage(
                "E_SCRIPT_CREATE",
                format!("failed to create concat script file: {error}"),
            )
        })?;

        file.write_all(script.render().as_bytes())
            .and_then(|()| file.flush())
            .map_err(|error| {
                CaptureError::storage(
                    "E_SCRIPT_CREATE",
                    format!(
                        "failed to write concat script {}: {error}",
                        file.path().display()
                    ),
                )
            })?;
        debug!("wrote concat script {}", file.path().display());
        Ok(file)
    }
}

fn validate_output_path(output_path: &Path) -> Result<()> {
    let path_str = output_path.to_string_lossy();
    if path_str.is_empty() {
        return Err(CaptureError::argument("E_OUTPUT_PATH", "output path is empty").into());
    }
    if path_str.chars().any(|c| c.is_control()) {
        return Err(CaptureError::argument(
            "E_OUTPUT_PATH",
            "output path contains invalid control characters",
        )
        .into());
    }
    Ok(())
}

fn run_encoder(binary: &str, args: &[OsString]) -> Result<()> {
    let command_line = display_command(binary, args);
    debug!("running {command_line}");

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                CaptureError::external_process(
                    "E_ENCODER_NOT_FOUND",
                    format!(
                        "encoder executable '{binary}' not found. Install ffmpeg or set encoder_binary in the config."
                    ),
                    None,
                )
            } else {
                CaptureError::external_process(
                    "E_ENCODER_SPAWN",
                    format!("failed to spawn encoder (command='{command_line}'): {error}"),
                    None,
                )
            }
        })?;

    let mut stderr = Vec::new();
    if let Some(mut pipe) = child.stderr.take() {
        pipe.read_to_end(&mut stderr)
            .context("failed reading encoder stderr")?;
    }
    let status = child.wait().context("failed waiting for encoder process")?;
    let stderr_tail = last_n_chars(&String::from_utf8_lossy(&stderr), STDERR_TAIL_CHARS);

    if !status.success() {
        return Err(CaptureError::external_process(
            "E_ENCODER_FAILED",
            format!(
                "failed to create video: encoder exited with {status} (command='{command_line}', stderr_tail='{stderr_tail}')"
            ),
            status.code(),
        )
        .into());
    }
    if !stderr_tail.is_empty() {
        debug!("encoder stderr tail: {stderr_tail}");
    }
    Ok(())
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let chars = s.chars().collect::<Vec<_>>();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect::<String>().trim().to_owned()
}
