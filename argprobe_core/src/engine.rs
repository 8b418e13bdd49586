use crate::binary::Binary;
use crate::candidate::{CandidateGenerator, read_help_texts};
use crate::config::EngineConfig;
use crate::corpus::{SeedCorpus, SeedError};
use crate::coverage::{AflCoverage, AflTools, CoverageBackend};
use crate::evaluator::CoverageEvaluator;
use crate::executor::CommandExecutor;
use crate::resolver::{ProbeError, Resolver};
use crate::result::{CliConfig, InferenceReport};
use crate::scheduler::ExecutionController;
use crate::tracer::{StraceTracer, Tracer};
use log::{debug, error, info, warn};
use rayon::ThreadPoolBuildError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that abort inference for a binary. Per-bucket failures never end
/// up here; they are folded into the returned configs.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("No viable invocation found for {binary:?}")]
    NoViableInvocation { binary: PathBuf },

    #[error(transparent)]
    Seeds(#[from] SeedError),

    #[error("Failed to create probe file {path:?}: {source}")]
    ProbeFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Tracer is not permitted to ptrace the target. Try granting the SYS_PTRACE capability")]
    TracePermission,

    #[error("Binary {path:?} does not exist or is not a file")]
    Binary { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] ThreadPoolBuildError),
}

impl From<ProbeError> for InferenceError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::ProbeFile { path, source } => InferenceError::ProbeFile { path, source },
            ProbeError::TracePermission => InferenceError::TracePermission,
        }
    }
}

/// The tracing and coverage backends, chosen once per engine.
pub struct Toolchain {
    pub tracer: Box<dyn Tracer>,
    pub coverage: Box<dyn CoverageBackend>,
}

impl Toolchain {
    pub fn new(tracer: Box<dyn Tracer>, coverage: Box<dyn CoverageBackend>) -> Self {
        Self { tracer, coverage }
    }

    /// Locates strace and the AFL minimizers. Missing tools are reported and
    /// kept as configured; their runs then fail per item.
    pub fn resolve(config: &EngineConfig) -> Self {
        let strace = locate(&config.tools.strace, "Tracer");
        let cmin = locate(&config.tools.afl_cmin, "Coverage tool");
        let cmin_cov_only = which::which(&config.tools.afl_cmin_cov_only).ok();
        match &cmin_cov_only {
            Some(path) => info!("Using coverage-only minimizer {}", path.display()),
            None => info!("Coverage-only minimizer not found, using {} -I", cmin.display()),
        }
        Self::new(
            Box::new(StraceTracer::new(strace)),
            Box::new(AflCoverage::new(AflTools { cmin, cmin_cov_only }, config)),
        )
    }
}

fn locate(tool: &Path, what: &str) -> PathBuf {
    match which::which(tool) {
        Ok(path) => path,
        Err(e) => {
            warn!("{what} {} not found ({e}), keeping configured path", tool.display());
            tool.to_path_buf()
        }
    }
}

pub struct InferenceEngine {
    config: EngineConfig,
    toolchain: Toolchain,
    executor: CommandExecutor,
}

impl InferenceEngine {
    pub fn new(config: EngineConfig) -> Result<Self, InferenceError> {
        let toolchain = Toolchain::resolve(&config);
        Self::with_toolchain(config, toolchain)
    }

    pub fn with_toolchain(config: EngineConfig, toolchain: Toolchain) -> Result<Self, InferenceError> {
        config.validate().map_err(InferenceError::Config)?;
        Ok(Self {
            config,
            toolchain,
            executor: CommandExecutor::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Finds the invocations `binary` accepts a file through and ranks the
    /// seed buckets for each of them.
    ///
    /// # Errors
    /// Fails when the binary or seeds directory is unusable, the probe file
    /// cannot be created, the tracer lacks permission, or no candidate
    /// invocation is accepted. Every other failure is reported inside the
    /// returned configs.
    pub fn infer(&self, binary: &Binary, seeds: &Path) -> Result<InferenceReport, InferenceError> {
        if !binary.path.is_file() {
            return Err(InferenceError::Binary {
                path: binary.path.clone(),
            });
        }
        let corpus = SeedCorpus::load(seeds)?;
        let name = binary.display_name();

        info!("Figuring out invocations for {name}");
        let help = read_help_texts(&self.executor, &binary.path, self.config.help_timeout());
        let generator = CandidateGenerator::new().with_help_output(help.iter().map(String::as_str));
        if !generator.help_flags().is_empty() {
            info!("{name}: help output suggests {:?}", generator.help_flags());
        }

        let resolver = Resolver {
            tracer: self.toolchain.tracer.as_ref(),
            work_dir: &self.config.work_dir,
            preeny_dir: &self.config.tools.preeny_dir,
            timeout: self.config.probe_timeout(),
        };
        let invocations = resolver.resolve(&binary.path, &generator.groups())?;
        if invocations.is_empty() {
            error!("No invocations found for {name}");
            return Err(InferenceError::NoViableInvocation {
                binary: binary.path.clone(),
            });
        }

        info!("Now searching for the right filetype for {name}");
        let controller = ExecutionController::new(
            binary.cores.unwrap_or(self.config.cores),
            self.config.failed_invocations_threshold,
        )?;
        debug!("{name}: {} coverage worker(s)", controller.pool().threads());
        let evaluator = CoverageEvaluator {
            backend: self.toolchain.coverage.as_ref(),
            controller: &controller,
            binary,
            config: &self.config,
        };

        let mut configs = Vec::with_capacity(invocations.len());
        for invocation in &invocations {
            let assessment = evaluator.assess(invocation, &corpus);
            configs.push(
                CliConfig::new(
                    binary.path.clone(),
                    &invocation.template.template,
                    assessment.selected,
                    assessment.coverage_list,
                )
                .with_emulation(binary.needs_emulation)
                .with_took_max_file(assessment.took_max_file)
                .with_invocation_always_possible(!assessment.breaker_tripped),
            );
        }
        Ok(InferenceReport::new(binary.path.clone(), configs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::test_utils::write_bucket;
    use crate::evaluator::test_utils::{StubCoverage, StubResult};
    use crate::executor::test_support::get_test_target_path;
    use crate::resolver::test_utils::ScriptedTracer;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        work: TempDir,
        seeds: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                work: tempdir().unwrap(),
                seeds: tempdir().unwrap(),
            }
        }

        fn config(&self) -> EngineConfig {
            let mut config = EngineConfig {
                cores: 2,
                work_dir: self.work.path().to_path_buf(),
                results_dir: self.work.path().join("results"),
                ..EngineConfig::default()
            };
            config.tools.preeny_dir = PathBuf::from("/nonexistent/preeny");
            config
        }
    }

    // Boxed trait objects need ownership; the tests keep a handle to count calls.
    struct Shared<T>(Arc<T>);

    impl Tracer for Shared<ScriptedTracer> {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn trace(
            &self,
            binary: &Path,
            args: &[String],
            stdin: Option<&Path>,
            env: &crate::env::ToolEnv,
            timeout: Duration,
        ) -> crate::tracer::TraceRun {
            self.0.trace(binary, args, stdin, env, timeout)
        }
    }

    impl CoverageBackend for Shared<StubCoverage> {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn measure(
            &self,
            request: &crate::coverage::CoverageRequest<'_>,
        ) -> Result<crate::coverage::CoverageSample, crate::coverage::CoverageError> {
            self.0.measure(request)
        }
    }

    fn engine(
        config: EngineConfig,
        tracer: &Arc<ScriptedTracer>,
        coverage: &Arc<StubCoverage>,
    ) -> InferenceEngine {
        InferenceEngine::with_toolchain(
            config,
            Toolchain::new(
                Box::new(Shared(Arc::clone(tracer))),
                Box::new(Shared(Arc::clone(coverage))),
            ),
        )
        .unwrap()
    }

    fn target() -> Binary {
        Binary::new(get_test_target_path("test_target_ok.sh"), false)
    }

    #[test]
    fn file_reader_ranks_richest_filetype_first() {
        let fx = Fixture::new();
        write_bucket(fx.seeds.path(), "pdf_samples", 10);
        write_bucket(fx.seeds.path(), "txt_samples", 10);
        let tracer = Arc::new(ScriptedTracer::file_reader("-f @@"));
        let coverage = Arc::new(StubCoverage::new(
            &[("pdf", StubResult::Tuples(500)), ("txt", StubResult::Tuples(20))],
            StubResult::Tuples(0),
        ));

        let report = engine(fx.config(), &tracer, &coverage)
            .infer(&target(), fx.seeds.path())
            .unwrap();
        assert_eq!(report.len(), 1);
        let config = &report.configs[0];
        assert_eq!(config.invocation.as_deref(), Some("-f @@"));
        assert_eq!(config.max_coverage, 500);
        assert_eq!(config.filetypes, vec![fx.seeds.path().join("pdf_samples")]);
        assert_eq!(
            config.coverage_list,
            vec![("pdf".to_string(), 500), ("txt".to_string(), 20)]
        );
        assert_eq!(config.best_chebyshev.as_ref().unwrap().0, "pdf");
        assert_eq!(config.best_deviation.as_ref().unwrap().0, "pdf");
        assert!(config.invocation_always_possible);
        assert!(!config.emulation);
        // Probe file is gone once resolution ends.
        assert!(
            fs::read_dir(fx.work.path())
                .unwrap()
                .all(|e| !e.unwrap().file_name().to_string_lossy().starts_with("dummyfile_"))
        );
    }

    #[test]
    fn binary_that_never_reads_has_no_viable_invocation() {
        let fx = Fixture::new();
        write_bucket(fx.seeds.path(), "pdf_samples", 2);
        let tracer = Arc::new(ScriptedTracer::never_reads());
        let coverage = Arc::new(StubCoverage::new(&[], StubResult::Tuples(1)));

        let err = engine(fx.config(), &tracer, &coverage)
            .infer(&target(), fx.seeds.path())
            .unwrap_err();
        assert!(matches!(err, InferenceError::NoViableInvocation { .. }));
        assert_eq!(coverage.calls(), 0);
        assert!(tracer.calls() > 0);
    }

    #[test]
    fn crashing_bucket_is_a_signal_not_an_abort() {
        let fx = Fixture::new();
        write_bucket(fx.seeds.path(), "crashy_samples", 3);
        write_bucket(fx.seeds.path(), "gif_samples", 3);
        write_bucket(fx.seeds.path(), "png_samples", 3);
        let tracer = Arc::new(ScriptedTracer::file_reader("@@"));
        let coverage = Arc::new(StubCoverage::new(
            &[
                ("crashy", StubResult::Crash),
                ("gif", StubResult::Tuples(100)),
                ("png", StubResult::Tuples(120)),
            ],
            StubResult::Tuples(0),
        ));

        let report = engine(fx.config(), &tracer, &coverage)
            .infer(&target(), fx.seeds.path())
            .unwrap();
        let config = &report.configs[0];
        assert_eq!(config.invocation.as_deref(), Some("@@"));
        assert_eq!(
            config.coverage_list,
            vec![
                ("crashy".to_string(), 1),
                ("gif".to_string(), 100),
                ("png".to_string(), 120)
            ]
        );
        // Probe measured all three; gif and png were above the probe mean.
        assert_eq!(coverage.calls(), 5);
        assert!(config.invocation_always_possible);
    }

    #[test]
    fn identical_coverage_falls_back_to_first_bucket() {
        let fx = Fixture::new();
        for dir in ["bmp_samples", "gif_samples", "png_samples"] {
            write_bucket(fx.seeds.path(), dir, 2);
        }
        let tracer = Arc::new(ScriptedTracer::file_reader("-i @@"));
        let coverage = Arc::new(StubCoverage::new(&[], StubResult::Tuples(50)));

        let report = engine(fx.config(), &tracer, &coverage)
            .infer(&target(), fx.seeds.path())
            .unwrap();
        let config = &report.configs[0];
        assert!(config.took_max_file);
        assert_eq!(config.filetypes, vec![fx.seeds.path().join("bmp_samples")]);
        assert_eq!(config.coverages, vec![50]);
        assert!(config.chebyshev_scores.iter().all(|(_, s)| *s == 0.0));
    }

    #[test]
    fn failure_threshold_stops_tool_runs_for_the_invocation() {
        let fx = Fixture::new();
        for i in 0..6 {
            write_bucket(fx.seeds.path(), &format!("t{i}_samples"), 2);
        }
        let tracer = Arc::new(ScriptedTracer::file_reader("@@"));
        let coverage = Arc::new(StubCoverage::new(&[], StubResult::Fail));
        let config = EngineConfig {
            cores: 1,
            failed_invocations_threshold: 3,
            ..fx.config()
        };

        let report = engine(config, &tracer, &coverage)
            .infer(&target(), fx.seeds.path())
            .unwrap();
        assert_eq!(coverage.calls(), 3);
        let config = &report.configs[0];
        assert!(!config.invocation_always_possible);
        assert!(config.coverage_list.iter().all(|(_, v)| *v <= 0));
        assert_eq!(config.coverage_list.len(), 6);
        assert!(config.filetypes.is_empty());
        assert_eq!(config.max_coverage, 0);
        assert!(config.took_max_file);
    }

    #[test]
    fn emulation_flag_is_recorded() {
        let fx = Fixture::new();
        write_bucket(fx.seeds.path(), "pdf_samples", 1);
        let tracer = Arc::new(ScriptedTracer::file_reader("@@"));
        let coverage = Arc::new(StubCoverage::new(&[], StubResult::Tuples(7)));
        let binary = Binary::new(get_test_target_path("test_target_ok.sh"), true);

        let report = engine(fx.config(), &tracer, &coverage)
            .infer(&binary, fx.seeds.path())
            .unwrap();
        assert!(report.configs[0].emulation);
    }

    #[test]
    fn missing_seeds_and_binary_are_fatal() {
        let fx = Fixture::new();
        let tracer = Arc::new(ScriptedTracer::file_reader("@@"));
        let coverage = Arc::new(StubCoverage::new(&[], StubResult::Tuples(7)));
        let engine = engine(fx.config(), &tracer, &coverage);

        let err = engine.infer(&target(), fx.seeds.path()).unwrap_err();
        assert!(matches!(err, InferenceError::Seeds(SeedError::NoBuckets(_))));

        write_bucket(fx.seeds.path(), "pdf_samples", 1);
        let missing = Binary::new("/nonexistent/argprobe/target", false);
        let err = engine.infer(&missing, fx.seeds.path()).unwrap_err();
        assert!(matches!(err, InferenceError::Binary { .. }));
        assert_eq!(tracer.calls(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let fx = Fixture::new();
        let tracer = Arc::new(ScriptedTracer::never_reads());
        let coverage = Arc::new(StubCoverage::new(&[], StubResult::Tuples(0)));
        let config = EngineConfig {
            failed_invocations_threshold: 0,
            ..fx.config()
        };
        let result = InferenceEngine::with_toolchain(
            config,
            Toolchain::new(Box::new(Shared(tracer)), Box::new(Shared(coverage))),
        );
        assert!(matches!(result, Err(InferenceError::Config(_))));
    }
}
