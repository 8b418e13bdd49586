use crate::binary::Binary;
use crate::config::EngineConfig;
use crate::corpus::{FileTypeBucket, SeedCorpus, SeedError};
use crate::coverage::{CoverageBackend, CoverageError, CoverageOutcome, CoverageRequest};
use crate::env::{EnvTarget, ToolEnv};
use crate::ranker;
use crate::resolver::ResolvedInvocation;
use crate::scheduler::ExecutionController;
use log::{debug, info};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Result of the cheap pass over every bucket.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// One outcome per bucket, in corpus order.
    pub outcomes: Vec<CoverageOutcome>,
    /// The single bucket that stood out, if exactly one did.
    pub standout: Option<usize>,
    /// Buckets worth a full evaluation: the standouts, or else every bucket
    /// above the probe mean. Empty when all buckets scored the same.
    pub narrowed: Vec<usize>,
}

/// Final coverage picture for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Label and result integer for every bucket, in corpus order.
    ///
    /// Each value is the larger of the probe and full-pass values, so a
    /// full-pass `-1` stays hidden behind a probe `0`. A tripped breaker is
    /// reported through `breaker_tripped` only.
    pub coverage_list: Vec<(String, i64)>,
    pub selected: Vec<(PathBuf, i64)>,
    pub took_max_file: bool,
    pub breaker_tripped: bool,
}

pub struct CoverageEvaluator<'a> {
    pub backend: &'a dyn CoverageBackend,
    pub controller: &'a ExecutionController,
    pub binary: &'a Binary,
    pub config: &'a EngineConfig,
}

impl CoverageEvaluator<'_> {
    fn context(&self, invocation: &ResolvedInvocation) -> String {
        format!(
            "{} and invocation '{}'",
            self.binary.display_name(),
            invocation.template.template
        )
    }

    fn env(&self, invocation: &ResolvedInvocation) -> ToolEnv {
        ToolEnv::for_invocation(
            &invocation.template.template,
            EnvTarget::CoverageTool,
            &self.config.tools.preeny_dir,
        )
    }

    /// Network-only buckets are skipped for invocations that read files.
    pub fn is_candidate_bucket(&self, bucket: &FileTypeBucket, invocation: &ResolvedInvocation) -> bool {
        !bucket.is_empty()
            && (invocation.network || !self.config.network_buckets.contains(&bucket.label))
    }

    /// Measures a few representative samples of every bucket. A bucket whose
    /// samples cannot be staged counts as a failed run.
    pub fn probe(&self, invocation: &ResolvedInvocation, corpus: &SeedCorpus) -> ProbeReport {
        let staged: Vec<(usize, Result<TempDir, SeedError>)> = corpus
            .buckets
            .iter()
            .enumerate()
            .map(|(index, bucket)| (index, stage_samples(bucket, self.config.probe_files)))
            .collect();
        let env = self.env(invocation);
        let context = self.context(invocation);
        let results = self.controller.run_all(&context, staged, |(index, staged)| match staged {
            Ok(dir) => self.backend.measure(&CoverageRequest {
                binary: self.binary,
                invocation: &invocation.template,
                input_dir: dir.path(),
                env: &env,
            }),
            Err(e) => Err(CoverageError::Staging {
                bucket: corpus.buckets[*index].label.clone(),
                reason: e.to_string(),
            }),
        });

        let mut outcomes = vec![CoverageOutcome::Unavailable; corpus.len()];
        for ((index, _dir), outcome) in results {
            info!(
                "{}: got {} coverage probing filetype {} and invocation {}",
                self.binary.display_name(),
                outcome.value(),
                corpus.buckets[index].label,
                invocation.template.template
            );
            outcomes[index] = outcome;
        }

        let values: Vec<i64> = outcomes.iter().map(CoverageOutcome::value).collect();
        let ranked = ranker::ranking_values(&values);
        let standouts = ranker::outliers(&ranked, self.config.probe_z_threshold);
        debug!("Probe standouts for {context}: {standouts:?}");
        let standout = match standouts.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        let narrowed = if standouts.is_empty() {
            ranker::above_mean(&ranked)
        } else {
            standouts
        };
        ProbeReport {
            outcomes,
            standout,
            narrowed,
        }
    }

    /// Measures the full sample set of each listed bucket.
    pub fn evaluate(
        &self,
        invocation: &ResolvedInvocation,
        corpus: &SeedCorpus,
        indices: &[usize],
    ) -> Vec<(usize, CoverageOutcome)> {
        let env = self.env(invocation);
        let context = self.context(invocation);
        let results = self.controller.run_all(&context, indices.to_vec(), |index| {
            self.backend.measure(&CoverageRequest {
                binary: self.binary,
                invocation: &invocation.template,
                input_dir: &corpus.buckets[*index].path,
                env: &env,
            })
        });
        for (index, outcome) in &results {
            info!(
                "{}: got {} coverage for filetype {} and invocation {}",
                self.binary.display_name(),
                outcome.value(),
                corpus.buckets[*index].label,
                invocation.template.template
            );
        }
        results
    }

    /// Probe, then full evaluation of the narrowed buckets unless one bucket
    /// stood out, then selection. The failure count covers both passes.
    pub fn assess(&self, invocation: &ResolvedInvocation, corpus: &SeedCorpus) -> Assessment {
        self.controller.begin_invocation();
        let mut values: Vec<Option<i64>> = vec![None; corpus.len()];
        let mut shortlist: Option<Vec<usize>> = None;

        if self.config.use_probe {
            let report = self.probe(invocation, corpus);
            for (slot, outcome) in values.iter_mut().zip(&report.outcomes) {
                *slot = Some(outcome.value());
            }
            if let Some(index) = report.standout {
                info!(
                    "{}: filetype {} stands out while probing invocation '{}'",
                    self.binary.display_name(),
                    corpus.buckets[index].label,
                    invocation.template.template
                );
                let coverage_list = self.coverage_list(corpus, &values);
                return Assessment {
                    selected: vec![(corpus.buckets[index].path.clone(), coverage_list[index].1)],
                    coverage_list,
                    took_max_file: false,
                    breaker_tripped: self.controller.breaker().is_tripped(),
                };
            }
            if !report.narrowed.is_empty() {
                shortlist = Some(report.narrowed);
            }
        }

        let indices: Vec<usize> = corpus
            .buckets
            .iter()
            .enumerate()
            .filter(|(i, bucket)| {
                shortlist.as_ref().is_none_or(|s| s.contains(i))
                    && self.is_candidate_bucket(bucket, invocation)
            })
            .map(|(i, _)| i)
            .collect();
        debug!("Full evaluation of buckets {indices:?} for {}", self.context(invocation));
        for (index, outcome) in self.evaluate(invocation, corpus, &indices) {
            let full = outcome.value();
            values[index] = Some(values[index].map_or(full, |probe| probe.max(full)));
        }

        let coverage_list = self.coverage_list(corpus, &values);
        let raw: Vec<i64> = coverage_list.iter().map(|(_, v)| *v).collect();
        let selection = ranker::select(
            &ranker::ranking_values(&raw),
            self.config.selection_z_threshold,
        );
        Assessment {
            selected: selection
                .indices
                .iter()
                .map(|i| (corpus.buckets[*i].path.clone(), raw[*i]))
                .collect(),
            coverage_list,
            took_max_file: selection.took_max_file,
            breaker_tripped: self.controller.breaker().is_tripped(),
        }
    }

    fn coverage_list(&self, corpus: &SeedCorpus, values: &[Option<i64>]) -> Vec<(String, i64)> {
        corpus
            .buckets
            .iter()
            .zip(values)
            .map(|(bucket, value)| (bucket.label.clone(), value.unwrap_or(0)))
            .collect()
    }
}

/// Copies the bucket's representative samples into a scratch directory.
fn stage_samples(bucket: &FileTypeBucket, count: usize) -> Result<TempDir, SeedError> {
    let io_err = |path: PathBuf| move |source| SeedError::Io { path, source };
    let dir = tempfile::Builder::new()
        .prefix("argprobe_probe")
        .tempdir()
        .map_err(io_err(std::env::temp_dir()))?;
    for (i, sample) in bucket.representative_samples(count)?.iter().enumerate() {
        let name = sample
            .file_name()
            .map_or_else(|| format!("sample_{i}").into(), |n| n.to_os_string());
        fs::copy(sample, dir.path().join(name)).map_err(io_err(sample.clone()))?;
    }
    Ok(dir)
}
