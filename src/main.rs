use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use screentape::assembler::VideoAssembler;
use screentape::concat_script;
use screentape::config::{load_config, AssemblerConfig};
use screentape::encoder_args::{display_command, KeyedOverride};
use screentape::error_codes::{find_capture_error, ErrorEnvelope};
use screentape::indexer::{self, TruncatedTailPolicy};

#[derive(Debug, Parser)]
#[command(name = "screentape")]
#[command(about = "Index screencast frame logs and assemble them into video with ffmpeg")]
#[command(version = env!("SCREENTAPE_VERSION"))]
struct Cli {
    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Config file (default: $SCREENTAPE_CONFIG, then ./screentape.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Drop a truncated trailing record instead of failing
    #[arg(long, global = true)]
    drop_partial: bool,

    /// Print results and errors as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the frames stored in a log
    Index { log: PathBuf },
    /// Print the concat demuxer script for a log
    Script {
        log: PathBuf,
        #[arg(long)]
        last_frame_duration: Option<f64>,
        /// Write the script here instead of stdout
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Encode a log into a video
    Assemble {
        log: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Replace or add an encoder argument, e.g. --set=-qp=20
        #[arg(long = "set", value_name = "KEY=VALUE", allow_hyphen_values = true)]
        set: Vec<String>,
        /// Leave an encoder argument out, e.g. --remove=-fps_mode
        #[arg(long = "remove", value_name = "KEY", allow_hyphen_values = true)]
        remove: Vec<String>,
        #[arg(long)]
        last_frame_duration: Option<f64>,
        /// Print the encoder command without running it
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .format_target(false)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error, cli.json);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if cli.drop_partial {
        config.truncated_tail = TruncatedTailPolicy::DropPartial;
    }

    match &cli.command {
        Commands::Index { log } => run_index(&config, log, cli.json),
        Commands::Script {
            log,
            last_frame_duration,
            output,
        } => run_script(&config, log, *last_frame_duration, output.as_deref()),
        Commands::Assemble {
            log,
            output,
            set,
            remove,
            last_frame_duration,
            dry_run,
        } => {
            let mut overrides = set
                .iter()
                .map(|raw| KeyedOverride::parse(raw))
                .collect::<Result<Vec<_>>>()?;
            overrides.extend(remove.iter().map(|key| KeyedOverride::remove(key)));
            let assembler = VideoAssembler::new(config);
            if *dry_run {
                run_assemble_dry_run(
                    &assembler,
                    log,
                    output,
                    &overrides,
                    *last_frame_duration,
                    cli.json,
                )
            } else {
                run_assemble(
                    &assembler,
                    log,
                    output,
                    &overrides,
                    *last_frame_duration,
                    cli.json,
                )
            }
        }
    }
}

fn run_index(config: &AssemblerConfig, log: &Path, as_json: bool) -> Result<()> {
    let entries = indexer::scan_path(log, config.truncated_tail)?;
    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": true,
                "log": log.display().to_string(),
                "frames": entries,
            }))?
        );
        return Ok(());
    }

    for (index, entry) in entries.iter().enumerate() {
        println!(
            "{index}\t{:.6}\t{}\t{}",
            entry.timestamp, entry.byte_offset, entry.length
        );
    }
    eprintln!("{} frames in {}", entries.len(), log.display());
    Ok(())
}

fn run_script(
    config: &AssemblerConfig,
    log: &Path,
    last_frame_duration: Option<f64>,
    output: Option<&Path>,
) -> Result<()> {
    let entries = indexer::scan_path(log, config.truncated_tail)?;
    let script = concat_script::generate(
        &entries,
        log,
        last_frame_duration.unwrap_or(config.last_frame_duration),
    )?;
    match output {
        Some(path) => {
            fs::write(path, script.render())
                .with_context(|| format!("failed to write concat script {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{script}"),
    }
    Ok(())
}

fn run_assemble_dry_run(
    assembler: &VideoAssembler,
    log: &Path,
    output: &Path,
    overrides: &[KeyedOverride],
    last_frame_duration: Option<f64>,
    as_json: bool,
) -> Result<()> {
    let plan = assembler.plan(log, overrides, last_frame_duration)?;
    let args = plan.command_args(Path::new("<concat-script>"), output);
    if as_json {
        let command = std::iter::once(plan.encoder_binary.clone())
            .chain(args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": true,
                "dry_run": true,
                "frame_count": plan.entries.len(),
                "duration_seconds": plan.script.total_duration(),
                "command": command,
            }))?
        );
    } else {
        println!("{}", display_command(&plan.encoder_binary, &args));
        eprintln!(
            "{} frames, {:.3}s (dry run, encoder not started)",
            plan.entries.len(),
            plan.script.total_duration()
        );
    }
    Ok(())
}

fn run_assemble(
    assembler: &VideoAssembler,
    log: &Path,
    output: &Path,
    overrides: &[KeyedOverride],
    last_frame_duration: Option<f64>,
    as_json: bool,
) -> Result<()> {
    let summary = assembler.assemble(log, output, overrides, last_frame_duration)?;
    if as_json {
        let mut value = serde_json::to_value(&summary)?;
        value["ok"] = json!(true);
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!(
            "Wrote {} ({} frames, {:.3}s)",
            summary.output.display(),
            summary.frame_count,
            summary.duration_seconds
        );
    }
    Ok(())
}

fn report_error(error: &anyhow::Error, as_json: bool) {
    if as_json {
        let envelope = find_capture_error(error).map_or_else(
            || ErrorEnvelope::unclassified(format!("{error:#}")),
            |coded| coded.envelope(),
        );
        match serde_json::to_string_pretty(&envelope) {
            Ok(text) => println!("{text}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
        return;
    }
    eprintln!("error: {error:#}");
}
