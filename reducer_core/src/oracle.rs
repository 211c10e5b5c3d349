use crate::executor::{ExecutionStatus, Executor, Invocation};
use crate::sandbox::{SCRIPT_NAME, Sandbox};
use tracing::debug;

/// Whether the current sandbox source still exhibits the behaviour being reduced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Interesting,
    /// Carries a short description of what the predicate run ended with.
    NotInteresting(String),
}

impl Verdict {
    pub fn is_interesting(&self) -> bool {
        matches!(self, Verdict::Interesting)
    }
}

/// An `Oracle` decides whether the working copy of the source is interesting.
///
/// The preprocessing step consults it after every mutation it makes, so any
/// implementation must be side-effect free with respect to the source file.
pub trait Oracle {
    fn examine(&self, sandbox: &Sandbox, executor: &mut dyn Executor) -> Verdict;
}

/// Runs the sandbox's `test.sh` and maps exit status 0 to interesting.
///
/// Steps inside the script carry their own timeouts, so the run itself is unbounded.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptOracle;

impl ScriptOracle {
    pub fn new() -> Self {
        ScriptOracle
    }
}

impl Oracle for ScriptOracle {
    fn examine(&self, sandbox: &Sandbox, executor: &mut dyn Executor) -> Verdict {
        let invocation =
            Invocation::new("sh", vec![SCRIPT_NAME.to_string()]).in_dir(sandbox.root());
        let result = executor.execute(&invocation);
        debug!(status = ?result.status, "interestingness test finished");
        match result.status {
            ExecutionStatus::Ok => Verdict::Interesting,
            ExecutionStatus::Timeout => Verdict::NotInteresting("Timed out".to_string()),
            ExecutionStatus::Crash(description) | ExecutionStatus::Other(description) => {
                Verdict::NotInteresting(description)
            }
        }
    }
}
