//! clang-tidy invocation building and configuration discovery.

use crate::bisect::CheckSet;
use crate::command::split_shell;
use crate::config::TidySettings;
use crate::executor::{Executor, Invocation};
use crate::sandbox::{Sandbox, SandboxError, TIDY_CONFIG};
use crate::script::relocate_command_string;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Token list of the tidy run the predicate and the bisector use.
///
/// An explicit invocation is taken verbatim apart from path relocation into the
/// sandbox; otherwise `<binary> -p <sandbox> [--checks=-*,<check>] <source>` is derived.
pub fn build_invocation(
    settings: &TidySettings,
    sandbox: &Sandbox,
    build_dir: &Path,
    original_source: &Path,
) -> Vec<String> {
    if let Some(explicit) = &settings.invocation {
        let relocated = relocate_command_string(explicit, build_dir, original_source, sandbox);
        return split_shell(&relocated);
    }
    let mut tokens = vec![
        settings.binary.clone(),
        "-p".to_string(),
        sandbox.root().to_string_lossy().into_owned(),
    ];
    if let Some(check) = &settings.check {
        tokens.push(format!("--checks=-*,{check}"));
    }
    tokens.push(sandbox.source_name().to_string());
    tokens
}

/// Inserts `arg` in front of a `--` separator, or appends it when there is none.
pub fn insert_option(tokens: &[String], arg: &str) -> Vec<String> {
    let mut out = tokens.to_vec();
    let pos = out.iter().position(|t| t == "--").unwrap_or(out.len());
    out.insert(pos, arg.to_string());
    out
}

/// Restricts an invocation to exactly `checks`.
///
/// clang-tidy accepts `--checks` only once, so an existing `--checks=...`,
/// `-checks=...` or `--checks <value>` ahead of `--` is replaced in place.
pub fn with_checks(tokens: &[String], checks: &CheckSet) -> Vec<String> {
    let arg = checks.to_checks_arg();
    let mut out = Vec::with_capacity(tokens.len() + 1);
    let mut replaced = false;
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        if token == "--" {
            if !replaced {
                out.push(arg.clone());
                replaced = true;
            }
            out.push(token.clone());
            out.extend(iter.by_ref().cloned());
            break;
        }
        let option = token.trim_start_matches('-');
        let dashes = token.len() - option.len();
        if !(dashes == 1 || dashes == 2) {
            out.push(token.clone());
            continue;
        }
        if option == "checks" {
            iter.next();
        } else if !option.starts_with("checks=") {
            out.push(token.clone());
            continue;
        }
        if !replaced {
            out.push(arg.clone());
            replaced = true;
        }
    }
    if !replaced {
        out.push(arg);
    }
    out
}

/// Makes the invocation apply its fixes, unless it already does.
pub fn with_fixes(tokens: &[String]) -> Vec<String> {
    if tokens.iter().any(|t| t == "--fix" || t == "--fix-errors") {
        tokens.to_vec()
    } else {
        insert_option(tokens, "--fix")
    }
}

/// Nearest `.clang-tidy` at or above `start`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(TIDY_CONFIG))
        .find(|candidate| candidate.is_file())
}

/// Dumps the effective configuration found above `build_dir` into the sandbox so
/// tidy runs inside it see the same checks the project does.
///
/// Returns whether a configuration was written.
pub fn dump_config(
    executor: &mut dyn Executor,
    tokens: &[String],
    build_dir: &Path,
    sandbox: &Sandbox,
) -> Result<bool, SandboxError> {
    let Some(config) = find_config(build_dir) else {
        return Ok(false);
    };
    let dump = insert_option(
        &insert_option(tokens, &format!("--config-file={}", config.display())),
        "--dump-config",
    );
    let Some(invocation) = Invocation::from_tokens(&dump) else {
        return Ok(false);
    };
    let result = executor.execute(&invocation.in_dir(sandbox.root()));
    if !result.status.is_ok() || result.output.stdout.is_empty() {
        warn!(
            config = %config.display(),
            status = ?result.status,
            "could not dump clang-tidy config"
        );
        return Ok(false);
    }
    let target = sandbox.root().join(TIDY_CONFIG);
    fs::write(&target, &result.output.stdout)
        .map_err(|e| SandboxError::Io(format!("writing {target:?}: {e}")))?;
    info!(from = %config.display(), "copied clang-tidy config into sandbox");
    Ok(true)
}
