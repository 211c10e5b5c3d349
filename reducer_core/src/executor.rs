use crate::command::join_shell;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of one external process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exit code 0.
    Ok,
    /// Killed after exceeding the invocation's timeout.
    Timeout,
    /// Nonzero exit or termination by signal.
    Crash(String),
    /// The process could not be run at all.
    Other(String),
}

impl ExecutionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionStatus::Ok)
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, ExecutionStatus::Crash(_))
    }
}

/// Whether the child's output is captured or passed through to our terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Capture,
    Inherit,
}

/// A fully described external process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub output: OutputMode,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            timeout: None,
            output: OutputMode::Capture,
        }
    }

    /// Builds an invocation from a token list whose first element is the program.
    pub fn from_tokens(tokens: &[String]) -> Option<Self> {
        let (program, args) = tokens.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.output = OutputMode::Inherit;
        self
    }

    /// Shell-quoted rendering, used for logging.
    pub fn display(&self) -> String {
        let mut tokens = Vec::with_capacity(self.args.len() + 1);
        tokens.push(self.program.as_str());
        tokens.extend(self.args.iter().map(String::as_str));
        join_shell(&tokens)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: ProcessOutput,
}

impl ExecutionResult {
    pub fn from_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            output: ProcessOutput::default(),
        }
    }
}

/// Runs external processes. Every tool the pipeline touches goes through this seam.
pub trait Executor {
    fn execute(&mut self, invocation: &Invocation) -> ExecutionResult;
}

/// Blocking [`Executor`] backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        CommandExecutor
    }

    fn wait_with_timeout(
        &self,
        child: &mut Child,
        timeout: Option<Duration>,
    ) -> Result<ExitStatus, ExecutionStatus> {
        let Some(timeout) = timeout else {
            return child
                .wait()
                .map_err(|e| ExecutionStatus::Other(format!("Error waiting for child: {e}")));
        };
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        debug!(?timeout, "target timed out, killing");
                        if let Err(e) = child.kill() {
                            warn!("failed to kill child process: {e}");
                            return Err(ExecutionStatus::Other(format!(
                                "Failed to kill timed-out process: {e}",
                            )));
                        }
                        let _ = child.wait();
                        return Err(ExecutionStatus::Timeout);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(ExecutionStatus::Other(format!(
                        "Error waiting for child: {e}",
                    )));
                }
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn describe_failure(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("Exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Terminated by signal {signal}");
        }
    }
    "Exited abnormally".to_string()
}

impl Executor for CommandExecutor {
    fn execute(&mut self, invocation: &Invocation) -> ExecutionResult {
        debug!(command = %invocation.display(), "spawning");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).stdin(Stdio::null());
        if let Some(cwd) = &invocation.working_dir {
            cmd.current_dir(cwd);
        }
        match invocation.output {
            OutputMode::Capture => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error_msg = format!("Failed to spawn command '{}': {e}", invocation.program);
                warn!("{error_msg}");
                return ExecutionResult::from_status(ExecutionStatus::Other(error_msg));
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let waited = self.wait_with_timeout(&mut child, invocation.timeout);

        let mut output = ProcessOutput {
            stdout: collect(stdout),
            stderr: collect(stderr),
            ..ProcessOutput::default()
        };

        let status = match waited {
            Ok(exit) => {
                output.exit_code = exit.code();
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    output.signal = exit.signal();
                }
                if exit.success() {
                    ExecutionStatus::Ok
                } else {
                    ExecutionStatus::Crash(describe_failure(&exit))
                }
            }
            Err(status) => status,
        };

        ExecutionResult { status, output }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn test_target(name: &str) -> Invocation {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let script = manifest_dir.join("../test_targets").join(name);
        if !script.exists() {
            panic!("Test target missing: {script:?}");
        }
        Invocation::new("sh", vec![script.to_string_lossy().into_owned()])
    }

    #[test]
    fn successful_run_captures_stdout() {
        let result = CommandExecutor::new().execute(&test_target("target_ok.sh"));
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.output.exit_code, Some(0));
        assert!(result.output.stdout_lossy().contains("all good"));
    }

    #[test]
    fn nonzero_exit_is_a_crash_with_stderr() {
        let result = CommandExecutor::new().execute(&test_target("target_fail.sh"));
        match &result.status {
            ExecutionStatus::Crash(desc) => assert!(desc.contains("code 3"), "{desc}"),
            other => panic!("Expected Crash status, got {other:?}"),
        }
        assert!(
            result
                .output
                .stderr_lossy()
                .contains("ASTMatcher: Processing 'bugprone-use-after-move'")
        );
    }

    #[test]
    fn signal_is_reported() {
        let result = CommandExecutor::new().execute(&test_target("target_crash.sh"));
        match result.status {
            ExecutionStatus::Crash(desc) => assert!(
                desc.contains("code 139") || desc.contains("signal 11"),
                "Unexpected crash desc: {desc}",
            ),
            other => panic!("Expected Crash status, got {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_the_child() {
        let invocation =
            test_target("target_timeout.sh").with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let result = CommandExecutor::new().execute(&invocation);
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn working_dir_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let invocation = Invocation::new("sh", vec!["-c".into(), "pwd".into()]).in_dir(dir.path());
        let result = CommandExecutor::new().execute(&invocation);
        assert!(result.status.is_ok());
        let printed = PathBuf::from(result.output.stdout_lossy().trim());
        assert_eq!(
            printed.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn invalid_command_is_other() {
        let invocation = Invocation::new("./this_command_does_not_exist_ever_12345.sh", vec![]);
        let result = CommandExecutor::new().execute(&invocation);
        match result.status {
            ExecutionStatus::Other(msg) => assert!(msg.contains("Failed to spawn command")),
            other => panic!("Expected Other status for invalid command, got {other:?}"),
        }
    }

    #[test]
    fn display_quotes_arguments() {
        let invocation = Invocation::new("grep", vec!["-e".into(), "a b".into()]);
        assert_eq!(invocation.display(), "grep -e 'a b'");
    }
}
