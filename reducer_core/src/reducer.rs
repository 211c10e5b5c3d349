//! Locating and invoking the external test-case reducer (cvise or creduce).

use crate::command::DEFAULT_DIALECT;
use crate::executor::{Executor, Invocation};
use crate::sandbox::{SCRIPT_NAME, Sandbox};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Reducers tried, in order, when none is configured.
pub const REDUCER_CANDIDATES: [&str; 2] = ["cvise", "creduce"];

const DIALECT_FLAG: &str = "--clang-delta-std {";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerKind {
    CVise,
    CReduce,
    /// Anything else; invoked with the common options only.
    Generic,
}

impl ReducerKind {
    /// Guesses the kind from the binary's file name.
    pub fn from_binary(binary: &Path) -> Self {
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.contains("cvise") {
            ReducerKind::CVise
        } else if name.contains("creduce") {
            ReducerKind::CReduce
        } else {
            ReducerKind::Generic
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducerBinary {
    pub path: PathBuf,
    pub kind: ReducerKind,
}

impl ReducerBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = ReducerKind::from_binary(&path);
        Self { path, kind }
    }
}

/// Resolves the configured reducer, or the first of [`REDUCER_CANDIDATES`] on `PATH`.
pub fn discover_reducer(configured: Option<&str>) -> Option<ReducerBinary> {
    match configured {
        Some(name) => match which::which(name) {
            Ok(path) => Some(ReducerBinary::new(path)),
            Err(e) => {
                debug!(%name, "reducer not on PATH: {e}");
                let path = Path::new(name);
                path.is_file().then(|| ReducerBinary::new(path))
            }
        },
        None => REDUCER_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(ReducerBinary::new),
    }
}

/// Dialects listed in `--clang-delta-std {a,b,c}` of a reducer's help text.
pub fn parse_supported_dialects(help: &str) -> Vec<String> {
    let Some(start) = help.find(DIALECT_FLAG) else {
        return Vec::new();
    };
    let rest = &help[start + DIALECT_FLAG.len()..];
    let Some(end) = rest.find('}') else {
        return Vec::new();
    };
    rest[..end]
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

/// The requested dialect if supported, else the newest advertised one, else the default.
pub fn choose_dialect(requested: &str, supported: &[String]) -> String {
    if supported.iter().any(|d| d == requested) {
        return requested.to_string();
    }
    supported
        .last()
        .cloned()
        .unwrap_or_else(|| DEFAULT_DIALECT.to_string())
}

/// Asks the reducer which dialects its clang_delta understands.
pub fn probe_dialect(executor: &mut dyn Executor, binary: &Path, requested: &str) -> String {
    let invocation = Invocation::new(binary.to_string_lossy(), vec!["--help".to_string()]);
    let result = executor.execute(&invocation);
    let supported = parse_supported_dialects(&result.output.stdout_lossy());
    let chosen = choose_dialect(requested, &supported);
    if chosen != requested {
        info!(%requested, %chosen, "reducer does not support requested dialect");
    }
    chosen
}

/// Everything needed to launch one reducer run in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionSession {
    pub binary: ReducerBinary,
    pub jobs: usize,
    /// Only passed to cvise.
    pub dialect: Option<String>,
    pub timeout_secs: Option<u64>,
    pub script_name: String,
    pub target: String,
}

impl ReductionSession {
    /// Builds a session, probing the dialect when the reducer is cvise.
    pub fn prepare(
        binary: ReducerBinary,
        jobs: Option<usize>,
        timeout_secs: Option<u64>,
        sandbox: &Sandbox,
        executor: &mut dyn Executor,
    ) -> Self {
        let dialect = (binary.kind == ReducerKind::CVise).then(|| {
            probe_dialect(executor, &binary.path, &sandbox.compile_command().dialect())
        });
        Self {
            binary,
            jobs: jobs.unwrap_or_else(num_cpus::get),
            dialect,
            timeout_secs,
            script_name: SCRIPT_NAME.to_string(),
            target: sandbox.source_name().to_string(),
        }
    }

    /// `<bin> [--clang-delta-std=<d> --to-utf8] --n=<jobs> [--timeout=<s>] test.sh <name>`
    pub fn arguments(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(dialect) = &self.dialect {
            args.push(format!("--clang-delta-std={dialect}"));
            args.push("--to-utf8".to_string());
        }
        args.push(format!("--n={}", self.jobs));
        if let Some(secs) = self.timeout_secs {
            args.push(format!("--timeout={secs}"));
        }
        args.push(self.script_name.clone());
        args.push(self.target.clone());
        args
    }

    /// The run itself; output goes straight to the terminal.
    pub fn invocation(&self, sandbox_root: &Path) -> Invocation {
        Invocation::new(self.binary.path.to_string_lossy(), self.arguments())
            .in_dir(sandbox_root)
            .inherit_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionResult, ExecutionStatus, ProcessOutput};

    const CVISE_HELP: &str = "usage: cvise [-h] [--n N]\n  --clang-delta-std {c++98,c++11,c++14,c++17,c++20,c++2b}\n                        Specify clang_delta C++ standard\n";

    #[test]
    fn kind_from_binary_name() {
        assert_eq!(
            ReducerKind::from_binary(Path::new("/usr/bin/cvise")),
            ReducerKind::CVise
        );
        assert_eq!(
            ReducerKind::from_binary(Path::new("creduce")),
            ReducerKind::CReduce
        );
        assert_eq!(
            ReducerKind::from_binary(Path::new("/opt/halfempty")),
            ReducerKind::Generic
        );
    }

    #[test]
    fn dialects_are_parsed_from_help() {
        assert_eq!(
            parse_supported_dialects(CVISE_HELP),
            vec!["c++98", "c++11", "c++14", "c++17", "c++20", "c++2b"]
        );
        assert!(parse_supported_dialects("usage: creduce").is_empty());
        assert!(parse_supported_dialects("--clang-delta-std {c++11").is_empty());
    }

    #[test]
    fn dialect_choice_falls_back_to_newest_then_default() {
        let supported = parse_supported_dialects(CVISE_HELP);
        assert_eq!(choose_dialect("c++17", &supported), "c++17");
        assert_eq!(choose_dialect("c++23", &supported), "c++2b");
        assert_eq!(choose_dialect("c++23", &[]), DEFAULT_DIALECT);
    }

    #[test]
    fn probe_reads_help_output() {
        struct Help;
        impl Executor for Help {
            fn execute(&mut self, invocation: &Invocation) -> ExecutionResult {
                assert_eq!(invocation.args, vec!["--help".to_string()]);
                ExecutionResult {
                    status: ExecutionStatus::Ok,
                    output: ProcessOutput {
                        stdout: CVISE_HELP.as_bytes().to_vec(),
                        ..ProcessOutput::default()
                    },
                }
            }
        }
        assert_eq!(probe_dialect(&mut Help, Path::new("cvise"), "c++26"), "c++2b");
    }

    #[test]
    fn cvise_arguments_carry_dialect_and_timeout() {
        let session = ReductionSession {
            binary: ReducerBinary::new("/usr/bin/cvise"),
            jobs: 8,
            dialect: Some("c++17".to_string()),
            timeout_secs: Some(60),
            script_name: SCRIPT_NAME.to_string(),
            target: "main.cpp".to_string(),
        };
        assert_eq!(
            session.arguments(),
            vec![
                "--clang-delta-std=c++17",
                "--to-utf8",
                "--n=8",
                "--timeout=60",
                "test.sh",
                "main.cpp"
            ]
        );
        let invocation = session.invocation(Path::new("/sb"));
        assert_eq!(invocation.program, "/usr/bin/cvise");
        assert_eq!(invocation.working_dir.as_deref(), Some(Path::new("/sb")));
    }

    #[test]
    fn creduce_arguments_are_minimal() {
        let session = ReductionSession {
            binary: ReducerBinary::new("creduce"),
            jobs: 2,
            dialect: None,
            timeout_secs: None,
            script_name: SCRIPT_NAME.to_string(),
            target: "a.cpp".to_string(),
        };
        assert_eq!(session.arguments(), vec!["--n=2", "test.sh", "a.cpp"]);
    }

    #[test]
    fn missing_configured_reducer_is_none() {
        assert!(discover_reducer(Some("/definitely/not/a/reducer-binary")).is_none());
    }
}
