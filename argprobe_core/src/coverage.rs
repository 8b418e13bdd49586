use crate::binary::Binary;
use crate::candidate::InvocationTemplate;
use crate::config::EngineConfig;
use crate::env::ToolEnv;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionStatus, ProcessOutput};
use crate::oracle::{CrashOracle, CrashReport, Oracle};
use log::{debug, error, info, warn};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

static UNIQUE_TUPLES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\+\] Found (\d*) unique tuples across (.*) files\.").expect("valid regex")
});

const COV_ONLY_FLAGS: &[&str] = &[];
const CMIN_FLAGS: &[&str] = &["-I"];

/// Raw result of one coverage-tool run that completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageSample {
    Tuples(u64),
    Crash(CrashReport),
}

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("{tool} timed out")]
    Timeout { tool: String },

    #[error("{tool} could not be run: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("{tool} failed ({status}) and no crash could be confirmed")]
    Unconfirmed { tool: String, status: String },

    #[error("Could not stage samples of bucket {bucket}: {reason}")]
    Staging { bucket: String, reason: String },

    #[error("Failed to prepare coverage directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-bucket coverage result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageOutcome {
    /// Ran cleanly with this many unique tuples, possibly zero.
    Clean(u64),
    /// Crashed; reproducers were kept in this directory.
    Crash(PathBuf),
    Timeout,
    Failed,
    /// Not attempted because the failure threshold was reached.
    Unavailable,
}

impl CoverageOutcome {
    /// Integer view used in results: tuples, `1` for a crash, `0` for a
    /// failed or timed-out run, `-1` when unavailable.
    pub fn value(&self) -> i64 {
        match self {
            CoverageOutcome::Clean(n) => i64::try_from(*n).unwrap_or(i64::MAX),
            CoverageOutcome::Crash(_) => 1,
            CoverageOutcome::Timeout | CoverageOutcome::Failed => 0,
            CoverageOutcome::Unavailable => -1,
        }
    }
}

impl From<CoverageSample> for CoverageOutcome {
    fn from(sample: CoverageSample) -> Self {
        match sample {
            CoverageSample::Tuples(n) => CoverageOutcome::Clean(n),
            CoverageSample::Crash(report) => CoverageOutcome::Crash(report.reproducer_dir),
        }
    }
}

/// Everything a backend needs to measure one directory of inputs.
pub struct CoverageRequest<'a> {
    pub binary: &'a Binary,
    pub invocation: &'a InvocationTemplate,
    pub input_dir: &'a Path,
    pub env: &'a ToolEnv,
}

/// An instrumentation-based coverage measurement backend.
pub trait CoverageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the target over every file in `request.input_dir` and reports the
    /// unique tuples reached, or a confirmed crash.
    ///
    /// Unparseable tool output is a clean run with zero tuples. A failing run
    /// is re-checked for a crash before it is reported as an error.
    fn measure(&self, request: &CoverageRequest<'_>) -> Result<CoverageSample, CoverageError>;
}

/// Extracts the unique tuple count from minimizer output.
pub fn parse_unique_tuples(output: &str) -> Option<u64> {
    UNIQUE_TUPLES
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

/// Executables an `AflCoverage` backend drives.
#[derive(Debug, Clone)]
pub struct AflTools {
    pub cmin: PathBuf,
    /// Coverage-only minimizer; used for measurement when present.
    pub cmin_cov_only: Option<PathBuf>,
}

pub struct AflCoverage {
    tools: AflTools,
    memory_limit: String,
    exec_timeout: Duration,
    run_timeout: Duration,
    results_dir: PathBuf,
    executor: CommandExecutor,
    oracle: CrashOracle,
}

impl AflCoverage {
    pub fn new(tools: AflTools, config: &EngineConfig) -> Self {
        Self {
            tools,
            memory_limit: config.memory_limit.clone(),
            exec_timeout: config.tool_exec_timeout(),
            run_timeout: config.tool_run_timeout(),
            results_dir: config.results_dir.clone(),
            executor: CommandExecutor::new(),
            oracle: CrashOracle::new(),
        }
    }

    fn command(
        &self,
        tool: &Path,
        mode_flags: &[&str],
        request: &CoverageRequest<'_>,
        out_dir: &Path,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(tool, self.run_timeout).args(mode_flags.iter().copied());
        if request.binary.needs_emulation {
            spec = spec.arg("-Q");
        }
        spec.args([
            "-m".to_string(),
            self.memory_limit.clone(),
            "-o".to_string(),
            out_dir.display().to_string(),
            "-t".to_string(),
            self.exec_timeout.as_millis().to_string(),
            "-i".to_string(),
            request.input_dir.display().to_string(),
            "--".to_string(),
            request.binary.path.display().to_string(),
        ])
        .args(request.invocation.raw_args())
        .envs(request.env.vars())
    }

    fn run(&self, spec: &CommandSpec) -> ProcessOutput {
        debug!("Coverage tool: {}", spec.command_line());
        self.executor.execute(spec)
    }

    /// Re-runs in crash-only mode, keeping crashing inputs under the results
    /// directory when the crash is confirmed.
    fn reproduce_crash(&self, request: &CoverageRequest<'_>) -> Result<CoverageSample, CoverageError> {
        let crash_dir = self.results_dir.join(format!("crashes{}", Uuid::new_v4()));
        fs::create_dir_all(&crash_dir).map_err(|source| CoverageError::Io {
            path: crash_dir.clone(),
            source,
        })?;
        let spec = self.command(&self.tools.cmin, &["-C"], request, &crash_dir);
        let result = self.run(&spec);
        if let Some(report) = self.oracle.examine(&result.status, &result.output, &crash_dir) {
            error!(
                "Found a crash for {}, stored reproducers in {}",
                request.binary.display_name(),
                crash_dir.display()
            );
            return Ok(CoverageSample::Crash(report));
        }
        if let Err(e) = fs::remove_dir_all(&crash_dir) {
            debug!("Failed to remove {crash_dir:?}: {e}");
        }
        Err(CoverageError::Unconfirmed {
            tool: self.tools.cmin.display().to_string(),
            status: format!("{:?}", result.status),
        })
    }
}

impl CoverageBackend for AflCoverage {
    fn name(&self) -> &str {
        "afl-cmin"
    }

    fn measure(&self, request: &CoverageRequest<'_>) -> Result<CoverageSample, CoverageError> {
        let (tool, mode_flags) = match &self.tools.cmin_cov_only {
            Some(cov_only) => (cov_only.as_path(), COV_ONLY_FLAGS),
            None => (self.tools.cmin.as_path(), CMIN_FLAGS),
        };
        let scratch = tempfile::Builder::new()
            .prefix("argprobe_cmin")
            .tempdir()
            .map_err(|source| CoverageError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let spec = self.command(tool, mode_flags, request, &scratch.path().join("out"));
        let result = self.run(&spec);
        let tool_name = tool.display().to_string();

        match result.status {
            ExecutionStatus::Ok => match parse_unique_tuples(&result.output) {
                Some(tuples) => Ok(CoverageSample::Tuples(tuples)),
                None => {
                    warn!("Could not find a tuple count in {tool_name} output, assuming 0");
                    Ok(CoverageSample::Tuples(0))
                }
            },
            ExecutionStatus::Timeout => Err(CoverageError::Timeout { tool: tool_name }),
            ExecutionStatus::Crash(desc) => {
                info!("Coverage tool exited abnormally ({desc}), checking for a crash");
                self.reproduce_crash(request)
            }
            ExecutionStatus::Other(reason) => Err(CoverageError::Spawn {
                tool: tool_name,
                reason,
            }),
        }
    }
}
