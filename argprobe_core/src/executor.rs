use log::{debug, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Timeout,
    Crash(String),
    Other(String),
}

/// A fully described external process run: program, arguments, environment
/// overlay, optional stdin file and a hard timeout.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin_file: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin_file: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin_file = Some(path.to_path_buf());
        self
    }

    /// Space-joined command line, for log lines only.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExecutionStatus,
    /// Interleaved stdout and stderr, lossily decoded.
    pub output: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    fn failed(msg: String) -> Self {
        Self {
            status: ExecutionStatus::Other(msg),
            output: String::new(),
            exit_code: None,
            signal: None,
        }
    }
}

pub struct CommandExecutor {
    poll_interval: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }

    fn run_and_wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<ExitStatus, ExecutionStatus> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!("Process {} timed out, killing its process group", child.id());
                        if let Err(e) = kill_process_group(child) {
                            warn!("Failed to kill timed-out process {}: {e}", child.id());
                            return Err(ExecutionStatus::Other(format!(
                                "Failed to kill timed-out process: {e}",
                            )));
                        }
                        // Reap so the worker slot is actually free.
                        let _ = child.wait();
                        return Err(ExecutionStatus::Timeout);
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(e) => {
                    warn!("Error waiting for child process: {e}");
                    let _ = kill_process_group(child);
                    let _ = child.wait();
                    return Err(ExecutionStatus::Other(format!(
                        "Error waiting for child: {e}",
                    )));
                }
            }
        }
    }

    pub fn execute(&self, spec: &CommandSpec) -> ProcessOutput {
        let mut capture = match tempfile::tempfile() {
            Ok(f) => f,
            Err(e) => return ProcessOutput::failed(format!("Failed to create capture file: {e}")),
        };
        let (stdout_handle, stderr_handle) = match (capture.try_clone(), capture.try_clone()) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                return ProcessOutput::failed(format!("Failed to clone capture file: {e}"));
            }
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        match &spec.stdin_file {
            Some(path) => match File::open(path) {
                Ok(f) => {
                    cmd.stdin(Stdio::from(f));
                }
                Err(e) => {
                    return ProcessOutput::failed(format!(
                        "Failed to open stdin file {path:?}: {e}"
                    ));
                }
            },
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        cmd.stdout(Stdio::from(stdout_handle));
        cmd.stderr(Stdio::from(stderr_handle));
        // Own process group, so a timeout takes down tracer and tracee together.
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg = format!("Failed to spawn command '{}': {}", spec.command_line(), e);
                debug!("{error_msg}");
                return ProcessOutput::failed(error_msg);
            }
        };

        let wait_result = self.run_and_wait_with_timeout(&mut child, spec.timeout);

        let output = read_capture(&mut capture);
        match wait_result {
            Ok(status) => {
                let exit_code = status.code();
                let signal = status.signal();
                let execution_status = if status.success() {
                    ExecutionStatus::Ok
                } else if let Some(code) = exit_code {
                    ExecutionStatus::Crash(format!("Exited with code {code}"))
                } else if let Some(signal) = signal {
                    ExecutionStatus::Crash(format!("Terminated by signal {signal}"))
                } else {
                    ExecutionStatus::Crash("Exited abnormally".to_string())
                };
                ProcessOutput {
                    status: execution_status,
                    output,
                    exit_code,
                    signal,
                }
            }
            Err(status) => ProcessOutput {
                status,
                output,
                exit_code: None,
                signal: None,
            },
        }
    }
}

fn read_capture(capture: &mut File) -> String {
    let mut bytes = Vec::new();
    if let Err(e) = capture
        .seek(SeekFrom::Start(0))
        .and_then(|_| capture.read_to_end(&mut bytes))
    {
        warn!("Failed to read captured process output: {e}");
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions; the group was created by us.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        child.kill()
    }
}


#[cfg(test)]
mod command_executor_tests {
    use super::test_support::get_test_target_path;
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sh_spec(script: &str, timeout: Duration) -> CommandSpec {
        let target_path = get_test_target_path(script);
        if !target_path.exists() {
            panic!("Test target missing: {target_path:?}");
        }
        CommandSpec::new("sh", timeout).arg(target_path.to_str().unwrap())
    }

    #[test]
    fn cmd_exec_successful_run_captures_output() {
        let executor = CommandExecutor::new();
        let result = executor.execute(&sh_spec("test_target_ok.sh", Duration::from_secs(5)));
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("target ok"), "output: {}", result.output);
    }

    #[test]
    fn cmd_exec_captures_stderr_too() {
        let executor = CommandExecutor::new();
        let result = executor.execute(&sh_spec("test_target_stderr.sh", Duration::from_secs(5)));
        assert!(result.output.contains("to stdout"));
        assert!(result.output.contains("to stderr"));
    }

    #[test]
    fn cmd_exec_crash_detection() {
        let executor = CommandExecutor::new();
        let result = executor.execute(&sh_spec("test_target_crash.sh", Duration::from_secs(5)));
        match result.status {
            ExecutionStatus::Crash(desc) => {
                assert!(
                    desc.contains("code 139") || desc.contains("signal 11"),
                    "Unexpected crash desc: {desc}",
                );
            }
            other => panic!("Expected Crash status, got {other:?}"),
        }
    }

    #[test]
    fn cmd_exec_timeout_kills_child() {
        let executor = CommandExecutor::new();
        let start = Instant::now();
        let result = executor.execute(&sh_spec("test_target_timeout.sh", Duration::from_millis(100)));
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn cmd_exec_feeds_stdin_from_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input.txt");
        fs::write(&input, "CONTENT").unwrap();
        let executor = CommandExecutor::new();
        let spec = sh_spec("test_target_cat.sh", Duration::from_secs(5)).stdin_file(&input);
        let result = executor.execute(&spec);
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.output, "CONTENT");
    }

    #[test]
    fn cmd_exec_passes_environment_overlay() {
        let executor = CommandExecutor::new();
        let spec = sh_spec("test_target_env.sh", Duration::from_secs(5))
            .envs(&[("ARGPROBE_MARKER".to_string(), "marker-value".to_string())]);
        let result = executor.execute(&spec);
        assert!(result.output.contains("marker-value"));
    }

    #[test]
    fn cmd_exec_invalid_command() {
        let executor = CommandExecutor::new();
        let spec = CommandSpec::new(
            "./this_command_does_not_exist_ever_12345.sh",
            Duration::from_secs(1),
        );
        let result = executor.execute(&spec);
        match result.status {
            ExecutionStatus::Other(msg) => assert!(msg.contains("Failed to spawn command")),
            other => panic!("Expected Other status for invalid command, got {other:?}"),
        }
    }

    #[test]
    fn command_line_joins_program_and_args() {
        let spec = CommandSpec::new("/usr/bin/strace", Duration::from_secs(1)).args(["-f", "--"]);
        assert_eq!(spec.command_line(), "/usr/bin/strace -f --");
    }
}
