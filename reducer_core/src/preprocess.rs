//! Preprocess the working source and keep the result only if it stays interesting.

use crate::command::PreprocessOutput;
use crate::executor::{Executor, Invocation};
use crate::oracle::Oracle;
use crate::sandbox::{Sandbox, SandboxError};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreprocessOutcome {
    /// The preprocessed file replaced the source and is still interesting.
    Accepted,
    /// The preprocessed file lost the behaviour; the backup was restored.
    Reverted,
    /// Preprocessing produced the same bytes as the current source.
    Unchanged,
    /// The preprocessor itself failed; the source was not touched.
    PreprocessorFailed(String),
}

/// Replaces the sandbox source with its preprocessed form, rolling back unless the
/// oracle still finds it interesting.
///
/// Running this twice in a row is a no-op the second time.
pub fn preprocess_and_validate(
    sandbox: &Sandbox,
    executor: &mut dyn Executor,
    oracle: &dyn Oracle,
    timeout: Option<Duration>,
) -> Result<PreprocessOutcome, SandboxError> {
    sandbox.backup()?;

    let candidate_name = sandbox.preprocessed_name();
    let candidate = sandbox.root().join(&candidate_name);
    let command = sandbox
        .compile_command()
        .rewrite(&[&PreprocessOutput::new(candidate_name.as_str())]);
    let Some(invocation) = Invocation::from_tokens(command.tokens()) else {
        return Ok(PreprocessOutcome::PreprocessorFailed(
            "empty compile command".to_string(),
        ));
    };
    let result = executor.execute(&invocation.in_dir(sandbox.root()).with_timeout(timeout));

    if !result.status.is_ok() || !candidate.is_file() {
        discard(&candidate);
        let reason = format!("{:?}", result.status);
        warn!(%reason, stderr = %result.output.stderr_lossy(), "preprocessing failed");
        return Ok(PreprocessOutcome::PreprocessorFailed(reason));
    }

    let preprocessed = fs::read(&candidate)
        .map_err(|e| SandboxError::Io(format!("reading {candidate:?}: {e}")))?;
    if md5::compute(&preprocessed).0 == sandbox.source_digest()? {
        discard(&candidate);
        debug!("preprocessing left the source unchanged");
        return Ok(PreprocessOutcome::Unchanged);
    }

    let source = sandbox.source_path();
    fs::rename(&candidate, &source)
        .map_err(|e| SandboxError::Io(format!("replacing {source:?}: {e}")))?;

    let verdict = oracle.examine(sandbox, executor);
    if verdict.is_interesting() {
        info!("preprocessed source is still interesting");
        Ok(PreprocessOutcome::Accepted)
    } else {
        sandbox.restore()?;
        info!(?verdict, "preprocessed source is not interesting, reverted");
        Ok(PreprocessOutcome::Reverted)
    }
}

fn discard(candidate: &Path) {
    if candidate.exists() {
        if let Err(e) = fs::remove_file(candidate) {
            warn!(path = %candidate.display(), "could not remove preprocessor output: {e}");
        }
    }
}
