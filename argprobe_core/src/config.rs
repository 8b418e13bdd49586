use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolPaths {
    #[serde(default = "default_strace")]
    pub strace: PathBuf,
    #[serde(default = "default_afl_cmin")]
    pub afl_cmin: PathBuf,
    #[serde(default = "default_afl_cmin_cov_only")]
    pub afl_cmin_cov_only: PathBuf,
    #[serde(default = "default_preeny_dir")]
    pub preeny_dir: PathBuf,
}

fn default_strace() -> PathBuf {
    PathBuf::from("strace")
}

fn default_afl_cmin() -> PathBuf {
    PathBuf::from("/usr/local/bin/afl-cmin")
}

fn default_afl_cmin_cov_only() -> PathBuf {
    PathBuf::from("/usr/local/bin/afl_cmin_cov_only")
}

fn default_preeny_dir() -> PathBuf {
    PathBuf::from("/preeny")
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            strace: default_strace(),
            afl_cmin: default_afl_cmin(),
            afl_cmin_cov_only: default_afl_cmin_cov_only(),
            preeny_dir: default_preeny_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub help_timeout_ms: u64,
    #[serde(default = "default_tool_exec_timeout_ms")]
    pub tool_exec_timeout_ms: u64,
    #[serde(default = "default_tool_run_timeout_secs")]
    pub tool_run_timeout_secs: u64,
    #[serde(default = "default_failed_invocations_threshold")]
    pub failed_invocations_threshold: usize,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_probe_files")]
    pub probe_files: usize,
    #[serde(default = "default_probe_z_threshold")]
    pub probe_z_threshold: f64,
    #[serde(default = "default_selection_z_threshold")]
    pub selection_z_threshold: f64,
    #[serde(default = "default_use_probe")]
    pub use_probe: bool,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_network_buckets")]
    pub network_buckets: Vec<String>,
    #[serde(default)]
    pub tools: ToolPaths,
}

pub fn default_cores() -> usize {
    1
}

fn default_probe_timeout_ms() -> u64 {
    1200
}

fn default_tool_exec_timeout_ms() -> u64 {
    3000
}

fn default_tool_run_timeout_secs() -> u64 {
    10 * 60
}

pub fn default_failed_invocations_threshold() -> usize {
    10
}

fn default_memory_limit() -> String {
    "none".to_string()
}

fn default_probe_files() -> usize {
    3
}

// z-score cut-offs: probe pass, then final selection.
fn default_probe_z_threshold() -> f64 {
    2.0
}

fn default_selection_z_threshold() -> f64 {
    2.5
}

fn default_use_probe() -> bool {
    true
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

pub fn default_results_dir() -> PathBuf {
    PathBuf::from("./inference_results")
}

fn default_network_buckets() -> Vec<String> {
    vec!["pcap-network".to_string()]
}

impl EngineConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate().map_err(|e| {
            anyhow::anyhow!("Invalid configuration in {:?}: {}", path, e)
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cores == 0 {
            return Err("cores must be at least 1".to_string());
        }
        if self.failed_invocations_threshold == 0 {
            return Err("failed-invocations-threshold must be at least 1".to_string());
        }
        if self.probe_files == 0 {
            return Err("probe-files must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn help_timeout(&self) -> Duration {
        Duration::from_millis(self.help_timeout_ms)
    }

    pub fn tool_exec_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_exec_timeout_ms)
    }

    pub fn tool_run_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_run_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cores: default_cores(),
            probe_timeout_ms: default_probe_timeout_ms(),
            help_timeout_ms: default_probe_timeout_ms(),
            tool_exec_timeout_ms: default_tool_exec_timeout_ms(),
            tool_run_timeout_secs: default_tool_run_timeout_secs(),
            failed_invocations_threshold: default_failed_invocations_threshold(),
            memory_limit: default_memory_limit(),
            probe_files: default_probe_files(),
            probe_z_threshold: default_probe_z_threshold(),
            selection_z_threshold: default_selection_z_threshold(),
            use_probe: default_use_probe(),
            work_dir: default_work_dir(),
            results_dir: default_results_dir(),
            network_buckets: default_network_buckets(),
            tools: ToolPaths::default(),
        }
    }
}
