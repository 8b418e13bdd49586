use crate::executor::ExecutionStatus;
use std::fs;
use std::path::{Path, PathBuf};

/// Printed by the minimizer in crash-only mode once it kept crashing inputs.
pub const CRASH_CONFIRMATION_MARKER: &str = "Narrowed down to";

/// A confirmed crash with the directory holding its reproducers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub reproducer_dir: PathBuf,
    /// Human-readable summary of how the confirmation run ended.
    pub description: String,
    /// MD5 of the first reproducer, useful for deduplicating reports.
    pub input_hash: Option<String>,
}

/// An `Oracle` looks at a crash-only confirmation run and decides whether
/// the suspected crash is real.
pub trait Oracle: Send + Sync {
    /// # Arguments
    /// * `status`: how the confirmation run terminated.
    /// * `output`: its merged stdout/stderr.
    /// * `reproducer_dir`: where the run was told to keep crashing inputs.
    ///
    /// # Returns
    /// `Some(CrashReport)` when the crash is confirmed, otherwise `None`.
    fn examine(
        &self,
        status: &ExecutionStatus,
        output: &str,
        reproducer_dir: &Path,
    ) -> Option<CrashReport>;
}

/// Confirms a crash when the minimizer reports having narrowed the input set
/// down to crashing inputs.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    pub fn new() -> Self {
        CrashOracle
    }
}

impl Oracle for CrashOracle {
    fn examine(
        &self,
        status: &ExecutionStatus,
        output: &str,
        reproducer_dir: &Path,
    ) -> Option<CrashReport> {
        if !output.contains(CRASH_CONFIRMATION_MARKER) {
            return None;
        }
        let description = match status {
            ExecutionStatus::Ok => "crash confirmed".to_string(),
            ExecutionStatus::Crash(desc) | ExecutionStatus::Other(desc) => {
                format!("crash confirmed ({desc})")
            }
            ExecutionStatus::Timeout => "crash confirmed (confirmation run timed out)".to_string(),
        };
        Some(CrashReport {
            reproducer_dir: reproducer_dir.to_path_buf(),
            description,
            input_hash: first_reproducer_hash(reproducer_dir),
        })
    }
}

fn first_reproducer_hash(dir: &Path) -> Option<String> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    let bytes = fs::read(files.first()?).ok()?;
    Some(format!("{:x}", md5::compute(bytes)))
}
