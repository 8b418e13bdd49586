use crate::candidate::{CandidateGroup, Channel, InvocationTemplate};
use crate::env::{EnvTarget, ToolEnv};
use crate::tracer::{self, Tracer};
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const PROBE_CONTENT: &str = "CONTENT";

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to create probe file {path:?}: {source}")]
    ProbeFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Tracer is not permitted to trace the target (missing ptrace capability?)")]
    TracePermission,
}

/// Uniquely named file with known content, removed when dropped.
#[derive(Debug)]
pub struct ProbeFile {
    path: PathBuf,
}

impl ProbeFile {
    pub fn create(dir: &Path) -> Result<Self, ProbeError> {
        let dir = fs::canonicalize(dir).map_err(|source| ProbeError::ProbeFile {
            path: dir.to_path_buf(),
            source,
        })?;
        let probe = Self {
            path: dir.join(format!("dummyfile_{}", Uuid::new_v4())),
        };
        probe.ensure_present()?;
        Ok(probe)
    }

    /// Absolute path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recreates the file if a previous target run removed or truncated it.
    pub fn ensure_present(&self) -> Result<(), ProbeError> {
        let intact = fs::read(&self.path).is_ok_and(|bytes| bytes == PROBE_CONTENT.as_bytes());
        if intact {
            return Ok(());
        }
        fs::write(&self.path, PROBE_CONTENT).map_err(|source| ProbeError::ProbeFile {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for ProbeFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove probe file {:?}: {e}", self.path);
            }
        }
    }
}

/// One traced run of the target per candidate, judged from the trace alone.
pub struct DynamicProbe<'a> {
    pub tracer: &'a dyn Tracer,
    pub binary: &'a Path,
    pub file: &'a ProbeFile,
    pub preeny_dir: &'a Path,
    pub timeout: Duration,
}

impl DynamicProbe<'_> {
    pub fn accepts(&self, template: &InvocationTemplate) -> Result<bool, ProbeError> {
        let env = ToolEnv::for_invocation(&template.template, EnvTarget::Tracer, self.preeny_dir);
        self.run(template, &env)
    }

    /// Re-probes a template on standard input without socket redirection.
    pub fn reads_stdin_without_desock(
        &self,
        template: &InvocationTemplate,
    ) -> Result<bool, ProbeError> {
        let env = ToolEnv::without_desock(EnvTarget::Tracer, self.preeny_dir);
        let as_stdin = InvocationTemplate::new(template.template.clone(), Channel::Stdin);
        self.run(&as_stdin, &env)
    }

    fn run(&self, template: &InvocationTemplate, env: &ToolEnv) -> Result<bool, ProbeError> {
        self.file.ensure_present()?;
        let path = self.file.path();
        let args = template.args_for(path);
        let stdin = match template.channel {
            Channel::File => None,
            Channel::Stdin | Channel::Network => Some(path),
        };
        let run = self
            .tracer
            .trace(self.binary, &args, stdin, env, self.timeout);
        if run.not_permitted() {
            return Err(ProbeError::TracePermission);
        }
        if run.timed_out() {
            debug!("Invocation '{}' timed out", template.template);
            return Ok(false);
        }
        Ok(match template.channel {
            Channel::File => tracer::opened_then_read(&run.output, path),
            Channel::Stdin | Channel::Network => tracer::read_through_annotated_fd(&run.output, path),
        })
    }

    /// A network invocation takes no file argument and does not read the
    /// probe file from stdin unless sockets are redirected to it.
    pub fn is_network_invocation(&self, template: &InvocationTemplate) -> Result<bool, ProbeError> {
        if template.has_placeholder() {
            return Ok(false);
        }
        Ok(!self.reads_stdin_without_desock(template)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInvocation {
    pub template: InvocationTemplate,
    pub network: bool,
}

pub struct Resolver<'a> {
    pub tracer: &'a dyn Tracer,
    pub work_dir: &'a Path,
    pub preeny_dir: &'a Path,
    pub timeout: Duration,
}

impl Resolver<'_> {
    /// Walks the groups in order and returns the accepted templates of the
    /// first group that has any. Within a group every alternative list
    /// contributes at most its first accepted template. An empty result means
    /// no viable invocation.
    ///
    /// The probe file lives exactly as long as this call.
    pub fn resolve(
        &self,
        binary: &Path,
        groups: &[CandidateGroup],
    ) -> Result<Vec<ResolvedInvocation>, ProbeError> {
        let file = ProbeFile::create(self.work_dir)?;
        let probe = DynamicProbe {
            tracer: self.tracer,
            binary,
            file: &file,
            preeny_dir: self.preeny_dir,
            timeout: self.timeout,
        };

        for group in groups {
            let mut accepted: Vec<InvocationTemplate> = Vec::new();
            for alternatives in &group.alternatives {
                for template in alternatives {
                    if probe.accepts(template)? {
                        info!("{}: accepted invocation '{}'", binary.display(), template.template);
                        if !accepted.contains(template) {
                            accepted.push(template.clone());
                        }
                        break;
                    }
                    info!("{}: rejected invocation '{}'", binary.display(), template.template);
                }
            }
            if accepted.is_empty() {
                continue;
            }
            debug!(
                "Group {:?} (subcommand '{}') yielded {} invocation(s)",
                group.kind,
                group.subcommand,
                accepted.len()
            );
            let mut resolved = Vec::with_capacity(accepted.len());
            for template in accepted {
                let network = probe.is_network_invocation(&template)?;
                resolved.push(ResolvedInvocation { template, network });
            }
            return Ok(resolved);
        }
        Ok(Vec::new())
    }
}
