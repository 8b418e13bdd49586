use crate::env::ToolEnv;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionStatus};
use log::{debug, warn};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

pub const PTRACE_NOT_PERMITTED: &str = "ptrace(PTRACE_TRACEME, ...): Operation not permitted";

// `openat(AT_FDCWD</cwd>, "/abs/path", O_RDONLY|O_CLOEXEC) = 3</abs/path>`
static OPEN_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bopen(?:at)?\([^"]*"([^"]*)",\s*([^)]*)\)\s*=\s*(-?\d+)"#).expect("valid regex")
});
// `read(3</abs/path>, "CONTENT", 4096) = 7`
static READ_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:read|readv|pread64)\((\d+)(?:<([^>]*)>)?,").expect("valid regex")
});
static CLOSE_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bclose\((\d+)").expect("valid regex"));

/// Output of one traced run of the target.
#[derive(Debug, Clone)]
pub struct TraceRun {
    pub status: ExecutionStatus,
    pub output: String,
}

impl TraceRun {
    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::Timeout
    }

    pub fn not_permitted(&self) -> bool {
        self.output.contains(PTRACE_NOT_PERMITTED)
    }
}

/// A syscall tracing backend.
///
/// Implementations run the target once with the given arguments and return
/// the raw trace text, annotated with descriptor paths, with child processes
/// followed.
pub trait Tracer: Send + Sync {
    fn name(&self) -> &str;

    /// Runs `binary args...` under the tracer.
    ///
    /// # Arguments
    /// * `stdin`: file fed to the target's standard input, or `None` for null.
    /// * `env`: environment overlay (preload libraries) for the target.
    /// * `timeout`: hard bound; the whole process group is killed after it.
    fn trace(
        &self,
        binary: &Path,
        args: &[String],
        stdin: Option<&Path>,
        env: &ToolEnv,
        timeout: Duration,
    ) -> TraceRun;
}

pub struct StraceTracer {
    strace: PathBuf,
    executor: CommandExecutor,
}

impl StraceTracer {
    pub fn new(strace: impl Into<PathBuf>) -> Self {
        Self {
            strace: strace.into(),
            executor: CommandExecutor::new(),
        }
    }
}

impl Tracer for StraceTracer {
    fn name(&self) -> &str {
        "strace"
    }

    fn trace(
        &self,
        binary: &Path,
        args: &[String],
        stdin: Option<&Path>,
        env: &ToolEnv,
        timeout: Duration,
    ) -> TraceRun {
        let mut spec = CommandSpec::new(&self.strace, timeout)
            .args(["-y", "-f", "-v", "-s", "65000", "--"])
            .arg(binary.display().to_string())
            .args(args.iter().cloned())
            .envs(env.vars());
        if let Some(path) = stdin {
            spec = spec.stdin_file(path);
        }
        debug!("Trying invocation {}", spec.command_line());
        let result = self.executor.execute(&spec);
        if let ExecutionStatus::Other(msg) = &result.status {
            warn!("Tracer run failed: {msg}");
        }
        TraceRun {
            status: result.status,
            output: result.output,
        }
    }
}

/// True when the trace shows `path` opened for reading and one of the
/// returned descriptors read afterwards, before it was closed. Opening or
/// stat-ing alone does not count.
pub fn opened_then_read(trace: &str, path: &Path) -> bool {
    let wanted = path.display().to_string();
    let mut open_fds = HashSet::new();
    for line in trace.lines() {
        if let Some(caps) = OPEN_CALL.captures(line) {
            if caps[1] == *wanted && !caps[2].contains("O_WRONLY") {
                if let Some(fd) = caps[3].parse::<i64>().ok().filter(|fd| *fd >= 0) {
                    open_fds.insert(fd);
                }
            }
            continue;
        }
        if let Some(caps) = CLOSE_CALL.captures(line) {
            if let Ok(fd) = caps[1].parse::<i64>() {
                open_fds.remove(&fd);
            }
            continue;
        }
        let read_tracked = READ_CALL
            .captures_iter(line)
            .any(|caps| caps[1].parse::<i64>().is_ok_and(|fd| open_fds.contains(&fd)));
        if read_tracked {
            return true;
        }
    }
    false
}

/// True when any descriptor annotated with `path` is read from. This is how
/// a file fed on standard input shows up with `-y`.
pub fn read_through_annotated_fd(trace: &str, path: &Path) -> bool {
    let wanted = path.display().to_string();
    trace.lines().any(|line| {
        READ_CALL
            .captures_iter(line)
            .any(|caps| caps.get(2).is_some_and(|p| p.as_str() == wanted))
    })
}
