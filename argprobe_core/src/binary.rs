use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marker string compiled into every AFL-instrumented binary.
pub const AFL_SHM_MARKER: &[u8] = b"__AFL_SHM_ID";

/// The executable under inference. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub path: PathBuf,
    /// Run coverage tools in instruction-emulation mode (`-Q`).
    pub needs_emulation: bool,
    /// Per-binary override of the worker pool size.
    pub cores: Option<usize>,
}

impl Binary {
    pub fn new(path: impl Into<PathBuf>, needs_emulation: bool) -> Self {
        Self {
            path: path.into(),
            needs_emulation,
            cores: None,
        }
    }

    /// Builds a `Binary`, deriving `needs_emulation` from the absence of
    /// compile-time instrumentation.
    pub fn detect(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let instrumented = is_instrumented(&path)?;
        Ok(Self::new(path, !instrumented))
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

pub fn is_instrumented(path: &Path) -> io::Result<bool> {
    let bytes = fs::read(path)?;
    Ok(bytes
        .windows(AFL_SHM_MARKER.len())
        .any(|window| window == AFL_SHM_MARKER))
}
