use crate::env::FILE_PLACEHOLDER;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionStatus};
use log::debug;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Leading verbs tried in front of every group, for multi-command tools.
pub const SUBCOMMANDS: [&str; 4] = ["", "convert", "run", "show"];

pub const HELP_FLAGS: [&str; 3] = ["-h", "--help", "-H"];

const COMMON_FLAGS: [&str; 20] = [
    "-a", "-b", "-c", "-d", "-e", "-f", "-g", "-i", "-j", "-k", "-l", "-m", "-n", "-o", "-p",
    "-r", "-x", "-nr", "-ir", "-nvr",
];

const AUXILIARY_FLAGS: [&str; 5] = ["-t", "-c", "-r", "-d", "-p"];

const OUTPUT_SUFFIXES: [&str; 4] = ["", " /dev/null", " -o /dev/null", " -w /dev/null"];

// `-r <infile>`, `-i, --input FILE  read the file`
static SPACE_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(-\S+)\s+.*file.*").expect("valid regex"));
// `--include=<file>`, `--input=FILE`
static INLINE_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(-\S*?(?:<file>|=file\b)\S*)").expect("valid regex"));
static ANGLE_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<file>").expect("valid regex"));
static EQUALS_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)=file\b").expect("valid regex"));

/// How the target receives the probe input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The placeholder is replaced with a path.
    File,
    /// The file content is piped to standard input.
    Stdin,
    /// Socket-style candidates; input also arrives on stdin through desock.
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvocationTemplate {
    pub template: String,
    pub channel: Channel,
}

impl InvocationTemplate {
    pub fn new(template: impl Into<String>, channel: Channel) -> Self {
        Self {
            template: template.into(),
            channel,
        }
    }

    pub fn with_subcommand(&self, subcommand: &str) -> Self {
        let template = match (subcommand.is_empty(), self.template.is_empty()) {
            (true, _) => self.template.clone(),
            (false, true) => subcommand.to_string(),
            (false, false) => format!("{subcommand} {}", self.template),
        };
        Self::new(template, self.channel)
    }

    pub fn has_placeholder(&self) -> bool {
        self.template.contains(FILE_PLACEHOLDER)
    }

    /// Argument vector for the target, with the placeholder replaced by `file`
    /// for file-channel templates.
    pub fn args_for(&self, file: &Path) -> Vec<String> {
        let file = file.display().to_string();
        self.template
            .split_whitespace()
            .map(|token| match self.channel {
                Channel::File => token.replace(FILE_PLACEHOLDER, &file),
                Channel::Stdin | Channel::Network => token.to_string(),
            })
            .collect()
    }

    /// Argument vector with the placeholder kept, as coverage tools expect it.
    pub fn raw_args(&self) -> Vec<String> {
        self.template.split_whitespace().map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Placeholder,
    Stdin,
    Network,
    SingleFlag,
    DependentFlag,
}

/// One priority level of the search. Each alternative list is tried in order
/// until one of its templates is accepted.
#[derive(Debug, Clone)]
pub struct CandidateGroup {
    pub kind: GroupKind,
    pub subcommand: String,
    pub alternatives: Vec<Vec<InvocationTemplate>>,
}

impl CandidateGroup {
    pub fn len(&self) -> usize {
        self.alternatives.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Produces the ordered candidate groups for one binary.
#[derive(Debug, Clone, Default)]
pub struct CandidateGenerator {
    help_flags: Vec<String>,
}

impl CandidateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the flags mined from the given help texts.
    pub fn with_help_output<'a>(mut self, texts: impl IntoIterator<Item = &'a str>) -> Self {
        for text in texts {
            for flag in flags_from_help_output(text) {
                if !self.help_flags.contains(&flag) {
                    self.help_flags.push(flag);
                }
            }
        }
        self
    }

    pub fn help_flags(&self) -> &[String] {
        &self.help_flags
    }

    fn single_flag_candidates(&self) -> Vec<String> {
        let mut flags: Vec<String> = COMMON_FLAGS
            .iter()
            .map(|flag| format!("{flag} {FILE_PLACEHOLDER}"))
            .collect();
        for flag in &self.help_flags {
            if !flags.contains(flag) {
                flags.push(flag.clone());
            }
        }
        flags
    }

    fn base_groups(&self) -> Vec<(GroupKind, Vec<Vec<InvocationTemplate>>)> {
        let file = |t: &str| InvocationTemplate::new(t, Channel::File);

        let single: Vec<Vec<InvocationTemplate>> = self
            .single_flag_candidates()
            .iter()
            .map(|flag| {
                OUTPUT_SUFFIXES
                    .iter()
                    .map(|suffix| file(&format!("{flag}{suffix}")))
                    .collect()
            })
            .collect();

        let mut dependent = Vec::with_capacity(single.len() * AUXILIARY_FLAGS.len());
        for alternatives in &single {
            for aux in AUXILIARY_FLAGS {
                dependent.push(
                    alternatives
                        .iter()
                        .map(|t| file(&format!("{} {aux}", t.template)))
                        .collect(),
                );
            }
        }

        vec![
            (
                GroupKind::Placeholder,
                vec![vec![
                    file(FILE_PLACEHOLDER),
                    file(&format!("{FILE_PLACEHOLDER} /dev/null")),
                ]],
            ),
            (
                GroupKind::Stdin,
                vec![vec![
                    InvocationTemplate::new("", Channel::Stdin),
                    InvocationTemplate::new("-", Channel::Stdin),
                ]],
            ),
            (
                GroupKind::Network,
                vec![vec![
                    InvocationTemplate::new("localhost:80", Channel::Network),
                    InvocationTemplate::new("localhost 80", Channel::Network),
                ]],
            ),
            (GroupKind::SingleFlag, single),
            (GroupKind::DependentFlag, dependent),
        ]
    }

    /// All groups in search order: every group without a subcommand first,
    /// then the same groups under each subcommand prefix.
    pub fn groups(&self) -> Vec<CandidateGroup> {
        let base = self.base_groups();
        let mut groups = Vec::with_capacity(base.len() * SUBCOMMANDS.len());
        for subcommand in SUBCOMMANDS {
            for (kind, alternatives) in &base {
                groups.push(CandidateGroup {
                    kind: *kind,
                    subcommand: subcommand.to_string(),
                    alternatives: alternatives
                        .iter()
                        .map(|alts| alts.iter().map(|t| t.with_subcommand(subcommand)).collect())
                        .collect(),
                });
            }
        }
        groups
    }
}

fn strip_trailing_comma(flag: &str) -> &str {
    flag.strip_suffix(',').unwrap_or(flag)
}

/// Extracts placeholder-form flag candidates (`-r @@`, `--include=@@`) from a
/// program's help text.
pub fn flags_from_help_output(output: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if candidate.contains(FILE_PLACEHOLDER) && !found.contains(&candidate) {
            found.push(candidate);
        }
    };
    for line in output.lines() {
        for caps in SPACE_FILE_PATTERN.captures_iter(line) {
            let flag = strip_trailing_comma(&caps[1]);
            push(format!("{flag} {FILE_PLACEHOLDER}"));
        }
        for caps in INLINE_FILE_PATTERN.captures_iter(line) {
            let flag = strip_trailing_comma(&caps[1]);
            let flag = ANGLE_FILE.replace_all(flag, FILE_PLACEHOLDER);
            let flag = EQUALS_FILE.replace_all(&flag, format!("={FILE_PLACEHOLDER}").as_str());
            push(flag.into_owned());
        }
    }
    found
}

/// Runs the binary with each help flag and returns whatever it printed. A
/// non-zero exit or a timeout still yields output; a spawn failure yields none.
pub fn read_help_texts(
    executor: &CommandExecutor,
    binary: &Path,
    timeout: Duration,
) -> Vec<String> {
    let mut texts = Vec::new();
    for flag in HELP_FLAGS {
        let result = executor.execute(&CommandSpec::new(binary, timeout).arg(flag));
        if let ExecutionStatus::Other(msg) = &result.status {
            debug!("Help flag {flag} unavailable for {}: {msg}", binary.display());
            continue;
        }
        texts.push(result.output);
    }
    texts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::get_test_target_path;

    #[test]
    fn help_output_space_separated_file_flags() {
        let help = "Usage: tool [options]\n  -r <infile>     read from infile\n  -k, --keyfile file   key file\n  -v              verbose\n";
        let flags = flags_from_help_output(help);
        assert!(flags.contains(&"-r @@".to_string()), "{flags:?}");
        assert!(flags.contains(&"-k @@".to_string()), "{flags:?}");
        assert!(!flags.iter().any(|f| f.starts_with("-v")));
    }

    #[test]
    fn help_output_inline_file_flags_are_normalized() {
        let help = "  --include=<file>   include it\n  --input=FILE   input\n";
        let flags = flags_from_help_output(help);
        assert!(flags.contains(&"--include=@@".to_string()), "{flags:?}");
        assert!(flags.contains(&"--input=@@".to_string()), "{flags:?}");
    }

    #[test]
    fn help_output_matching_is_case_insensitive() {
        let flags = flags_from_help_output("  -C CONFIG_FILE   use this\n");
        assert_eq!(flags, vec!["-C @@".to_string()]);
    }

    #[test]
    fn help_output_without_file_mentions_yields_nothing() {
        assert!(flags_from_help_output("  -v  verbose\n  -q  quiet\n").is_empty());
    }

    #[test]
    fn groups_follow_priority_and_subcommand_order() {
        let groups = CandidateGenerator::new().groups();
        assert_eq!(groups.len(), 5 * SUBCOMMANDS.len());
        let kinds: Vec<GroupKind> = groups.iter().take(5).map(|g| g.kind).collect();
        assert_eq!(
            kinds,
            vec![
                GroupKind::Placeholder,
                GroupKind::Stdin,
                GroupKind::Network,
                GroupKind::SingleFlag,
                GroupKind::DependentFlag
            ]
        );
        assert_eq!(groups[0].alternatives[0][0].template, "@@");
        assert_eq!(groups[0].alternatives[0][1].template, "@@ /dev/null");
        assert_eq!(groups[5].subcommand, "convert");
        assert_eq!(groups[5].alternatives[0][0].template, "convert @@");
        assert_eq!(groups[6].alternatives[0][0].template, "convert");
        assert_eq!(groups[6].alternatives[0][0].channel, Channel::Stdin);
    }

    #[test]
    fn single_flags_carry_output_discarding_variants() {
        let groups = CandidateGenerator::new().groups();
        let single = &groups[3];
        assert_eq!(single.alternatives.len(), COMMON_FLAGS.len());
        let templates: Vec<&str> = single.alternatives[0]
            .iter()
            .map(|t| t.template.as_str())
            .collect();
        assert_eq!(
            templates,
            vec!["-a @@", "-a @@ /dev/null", "-a @@ -o /dev/null", "-a @@ -w /dev/null"]
        );
    }

    #[test]
    fn dependent_flags_pair_every_single_candidate() {
        let groups = CandidateGenerator::new().groups();
        let dependent = &groups[4];
        assert_eq!(
            dependent.alternatives.len(),
            COMMON_FLAGS.len() * AUXILIARY_FLAGS.len()
        );
        assert_eq!(dependent.alternatives[0][0].template, "-a @@ -t");
        assert_eq!(dependent.alternatives[1][3].template, "-a @@ -w /dev/null -c");
    }

    #[test]
    fn help_flags_extend_single_flag_group_without_duplicates() {
        let generator = CandidateGenerator::new()
            .with_help_output(["  -f file   input file\n", "  --config=<file>\n  -f FILE\n"]);
        assert_eq!(generator.help_flags(), ["-f @@", "--config=@@"]);
        let groups = generator.groups();
        assert_eq!(groups[3].alternatives.len(), COMMON_FLAGS.len() + 1);
        assert_eq!(groups[3].alternatives.last().unwrap()[0].template, "--config=@@");
    }

    #[test]
    fn args_substitute_placeholder_only_for_file_channel() {
        let path = Path::new("/tmp/dummyfile_x");
        let file = InvocationTemplate::new("-f @@ -o /dev/null", Channel::File);
        assert_eq!(file.args_for(path), vec!["-f", "/tmp/dummyfile_x", "-o", "/dev/null"]);
        let inline = InvocationTemplate::new("--in=@@", Channel::File);
        assert_eq!(inline.args_for(path), vec!["--in=/tmp/dummyfile_x"]);
        let stdin = InvocationTemplate::new("", Channel::Stdin);
        assert!(stdin.args_for(path).is_empty());
    }

    #[test]
    fn read_help_texts_collects_output_even_on_failure() {
        let script = get_test_target_path("test_target_help.sh");
        let texts = read_help_texts(&CommandExecutor::new(), &script, Duration::from_secs(5));
        assert_eq!(texts.len(), HELP_FLAGS.len());
        assert!(texts[0].contains("-i <file>"));
        let flags = flags_from_help_output(&texts[0]);
        assert!(flags.contains(&"-i @@".to_string()));
    }

    #[test]
    fn read_help_texts_tolerates_missing_binary() {
        let texts = read_help_texts(
            &CommandExecutor::new(),
            Path::new("/nonexistent/argprobe/bin"),
            Duration::from_secs(1),
        );
        assert!(texts.is_empty());
    }
}
