use std::path::{Path, PathBuf};

pub const FILE_PLACEHOLDER: &str = "@@";

const ASAN_OPTIONS: &str = "detect_leaks=0:detect_odr_violation=0:abort_on_error=1:symbolize=0:allocator_may_return_null=1";

const DESOCK_LIB: &str = "src/desock_vincent.so";
const DESRAND_LIB: &str = "src/desrand.so";
const DERAND_LIB: &str = "src/derand.so";

/// Who consumes the environment: the tracer loads preloads directly, the AFL
/// tools forward them to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvTarget {
    Tracer,
    CoverageTool,
}

impl EnvTarget {
    fn preload_var(self) -> &'static str {
        match self {
            EnvTarget::Tracer => "LD_PRELOAD",
            EnvTarget::CoverageTool => "AFL_PRELOAD",
        }
    }
}

/// Environment overlay for one invocation. Built once and passed down by
/// reference; there is no way to mutate it after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEnv {
    vars: Vec<(String, String)>,
}

impl ToolEnv {
    /// Chooses preload libraries by invocation shape: socket redirection only
    /// for invocations that do not take a file argument.
    pub fn for_invocation(invocation: &str, target: EnvTarget, preeny_dir: &Path) -> Self {
        let desock = !invocation.contains(FILE_PLACEHOLDER);
        Self::build(target, preeny_dir, desock)
    }

    /// Same as [`ToolEnv::for_invocation`] but never redirects sockets.
    pub fn without_desock(target: EnvTarget, preeny_dir: &Path) -> Self {
        Self::build(target, preeny_dir, false)
    }

    fn build(target: EnvTarget, preeny_dir: &Path, desock: bool) -> Self {
        let mut vars: Vec<(String, String)> = [
            ("AFL_SKIP_CPUFREQ", "1"),
            ("AFL_INST_LIBS", "1"),
            ("AFL_EXIT_WHEN_DONE", "1"),
            ("AFL_ALLOW_TMP", "1"),
            ("AFL_I_DONT_CARE_ABOUT_MISSING_CRASHES", "1"),
            ("ASAN_OPTIONS", ASAN_OPTIONS),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut libs: Vec<PathBuf> = Vec::new();
        if desock {
            libs.push(preeny_dir.join(DESOCK_LIB));
        }
        libs.push(preeny_dir.join(DESRAND_LIB));
        libs.push(preeny_dir.join(DERAND_LIB));
        let preload: Vec<String> = libs
            .into_iter()
            .filter(|lib| lib.is_file())
            .map(|lib| lib.display().to_string())
            .collect();
        if !preload.is_empty() {
            vars.push((target.preload_var().to_string(), preload.join(" ")));
        }
        Self { vars }
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
