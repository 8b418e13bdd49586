use argprobe_core::{Binary, EngineConfig, InferenceEngine, InferenceReport};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{LevelFilter, info};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "argprobe.toml";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Emulation {
    /// Emulate when the binary carries no AFL instrumentation.
    Auto,
    On,
    Off,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Infer how a binary takes file input and which file type it expects", long_about = None)]
struct Cli {
    /// Executable to analyze.
    #[clap(short, long, value_parser)]
    binary: PathBuf,
    /// Seeds directory with one subdirectory per file type.
    #[clap(short, long, value_parser)]
    seeds: PathBuf,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Worker pool size; overrides the configuration.
    #[clap(long)]
    cores: Option<usize>,
    #[clap(long, value_enum, default_value_t = Emulation::Auto)]
    emulation: Emulation,
    /// Write results here instead of stdout.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,
    /// One JSON record per line instead of a single document.
    #[clap(long)]
    json_lines: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or(default_level.as_str()));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn load_config(config_file: Option<PathBuf>) -> Result<EngineConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            EngineConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("No config file specified, loading default {default_config_path:?}");
                EngineConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and {DEFAULT_CONFIG_FILE} not found, using built-in defaults");
                Ok(EngineConfig::default())
            }
        }
    }
}

fn load_binary(path: &Path, emulation: Emulation) -> Result<Binary, anyhow::Error> {
    let binary = match emulation {
        Emulation::Auto => Binary::detect(path)
            .with_context(|| format!("Failed to inspect binary {path:?}"))?,
        Emulation::On => Binary::new(path, true),
        Emulation::Off => Binary::new(path, false),
    };
    info!(
        "{}: {}",
        binary.display_name(),
        if binary.needs_emulation {
            "running coverage tools in emulation mode"
        } else {
            "using compile-time instrumentation"
        }
    );
    Ok(binary)
}

fn write_report<W: Write>(report: &InferenceReport, json_lines: bool, mut writer: W) -> Result<(), anyhow::Error> {
    if json_lines {
        report.write_json_lines(&mut writer)?;
    } else {
        report.write_json(&mut writer)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config_file)?;
    if let Some(cores) = cli.cores {
        config.cores = cores;
    }
    let binary = load_binary(&cli.binary, cli.emulation)?;

    let engine = InferenceEngine::new(config)?;
    let report = engine
        .infer(&binary, &cli.seeds)
        .with_context(|| format!("Inference impossible for {}", binary.display_name()))?;

    if let Some(best) = report.max_coverage() {
        info!(
            "{}: best invocation '{}' with coverage {}",
            binary.display_name(),
            best.invocation_str(),
            best.max_coverage
        );
    }

    match cli.output {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("Failed to create output file {path:?}"))?;
            write_report(&report, cli.json_lines, BufWriter::new(file))?;
            info!("Wrote {} config(s) to {path:?}", report.len());
        }
        None => write_report(&report, cli.json_lines, io::stdout().lock())?,
    }
    Ok(())
}
