pub mod binary;
pub mod candidate;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod engine;
pub mod env;
pub mod evaluator;
pub mod executor;
pub mod oracle;
pub mod ranker;
pub mod resolver;
pub mod result;
pub mod scheduler;
pub mod tracer;

pub use binary::Binary;
pub use candidate::{CandidateGenerator, Channel, InvocationTemplate};
pub use config::EngineConfig;
pub use corpus::{FileTypeBucket, SeedCorpus, SeedError};
pub use coverage::{AflCoverage, CoverageBackend, CoverageError, CoverageOutcome};
pub use engine::{InferenceEngine, InferenceError, Toolchain};
pub use executor::{CommandExecutor, ExecutionStatus};
pub use oracle::{CrashOracle, CrashReport, Oracle};
pub use resolver::{ProbeError, ResolvedInvocation};
pub use result::{CliConfig, InferenceReport};
pub use scheduler::{ExecutionController, FailureBreaker, WorkerPool};
pub use tracer::{StraceTracer, Tracer};
