use crate::ranker::{self, best_pair};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::PathBuf;

/// One inferred way to feed a binary, with the file types it favors.
///
/// `filetypes` and `coverages` are parallel; `max_coverage` is the maximum
/// of `coverages`. `coverage_list` covers every bucket of the seeds
/// directory and is what the score vectors are computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    pub binary_path: PathBuf,
    /// Argument pattern with `@@` for the file; `None` for no arguments.
    pub invocation: Option<String>,
    pub filetypes: Vec<PathBuf>,
    pub coverages: Vec<i64>,
    pub coverage_list: Vec<(String, i64)>,
    pub max_coverage: i64,
    pub emulation: bool,
    pub took_max_file: bool,
    pub invocation_always_possible: bool,
    pub deviation_scores: Vec<(String, f64)>,
    pub best_deviation: Option<(String, f64)>,
    pub chebyshev_scores: Vec<(String, f64)>,
    pub best_chebyshev: Option<(String, f64)>,
}

impl CliConfig {
    pub fn new(
        binary_path: PathBuf,
        invocation: &str,
        selected: Vec<(PathBuf, i64)>,
        coverage_list: Vec<(String, i64)>,
    ) -> Self {
        let (filetypes, coverages): (Vec<PathBuf>, Vec<i64>) = selected.into_iter().unzip();
        let max_coverage = coverages.iter().copied().max().unwrap_or(0);

        let labels: Vec<String> = coverage_list.iter().map(|(l, _)| l.clone()).collect();
        let raw: Vec<i64> = coverage_list.iter().map(|(_, v)| *v).collect();
        let values = ranker::ranking_values(&raw);
        let deviation = ranker::deviation_scores(&values);
        let chebyshev = ranker::chebyshev_scores(&values);

        Self {
            binary_path,
            invocation: (!invocation.is_empty()).then(|| invocation.to_string()),
            filetypes,
            coverages,
            max_coverage,
            emulation: false,
            took_max_file: false,
            invocation_always_possible: true,
            best_deviation: best_pair(&labels, &deviation),
            best_chebyshev: best_pair(&labels, &chebyshev),
            deviation_scores: labels.iter().cloned().zip(deviation).collect(),
            chebyshev_scores: labels.into_iter().zip(chebyshev).collect(),
            coverage_list,
        }
    }

    pub fn with_emulation(mut self, emulation: bool) -> Self {
        self.emulation = emulation;
        self
    }

    pub fn with_took_max_file(mut self, took_max_file: bool) -> Self {
        self.took_max_file = took_max_file;
        self
    }

    pub fn with_invocation_always_possible(mut self, possible: bool) -> Self {
        self.invocation_always_possible = possible;
        self
    }

    /// Invocation text as used on a command line; empty for `None`.
    pub fn invocation_str(&self) -> &str {
        self.invocation.as_deref().unwrap_or("")
    }

    fn best_chebyshev_score(&self) -> f64 {
        self.best_chebyshev.as_ref().map_or(0.0, |(_, s)| *s)
    }
}

/// Everything inferred for one binary, ordered by `max_coverage`, highest
/// first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceReport {
    pub binary_path: PathBuf,
    pub configs: Vec<CliConfig>,
}

impl InferenceReport {
    pub fn new(binary_path: PathBuf, mut configs: Vec<CliConfig>) -> Self {
        // Stable, so equal coverage keeps resolution order.
        configs.sort_by(|a, b| b.max_coverage.cmp(&a.max_coverage));
        Self {
            binary_path,
            configs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Config with the highest best chebyshev score; first one on ties.
    pub fn best_by_chebyshev(&self) -> Option<&CliConfig> {
        let mut best: Option<&CliConfig> = None;
        for config in &self.configs {
            if best.is_none_or(|b| config.best_chebyshev_score() > b.best_chebyshev_score()) {
                best = Some(config);
            }
        }
        best
    }

    /// Config with the highest `max_coverage`.
    pub fn max_coverage(&self) -> Option<&CliConfig> {
        self.configs.first()
    }

    pub fn write_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, self)
    }

    /// One JSON document per config, one per line.
    pub fn write_json_lines<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for config in &self.configs {
            serde_json::to_writer(&mut writer, config)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }
}
