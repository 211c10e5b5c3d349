//! Interestingness test synthesis.
//!
//! A [`ScriptPlan`] is an ordered list of shell steps, each of which must either
//! succeed or fail, followed by grep checks. Rendering turns it into a POSIX `sh`
//! script that exits 0 exactly when one of `repeat` attempts reproduces every step.

use crate::bisect::CheckSet;
use crate::command::{
    DiagnosticsHygiene, RelocateSource, VerifierCompat, join_shell, quote, resolve, split_shell,
};
use crate::config::{PredicateSettings, ReducerConfig, TestMode};
use crate::sandbox::{POST_FIX_LOG, PRIMARY_LOG, Sandbox, SandboxError, VERIFY_LOG};
use crate::tidy;
use regex::{NoExpand, Regex};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static PROJECT_SELECTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|\s)-p(?:=|\s+)\S+").expect("static -p selector pattern is valid")
});

/// Exit status a step needs for the attempt to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Succeeds,
    /// Any failure, timeouts included, counts.
    Fails,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Truncate(String),
    Append(String),
}

impl LogTarget {
    fn redirect(&self) -> String {
        match self {
            LogTarget::Truncate(file) => format!("> {} 2>&1", quote(file)),
            LogTarget::Append(file) => format!(">> {} 2>&1", quote(file)),
        }
    }
}

/// One command line of the predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub command: String,
    pub expect: Expectation,
    pub log: LogTarget,
}

impl Step {
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S], expect: Expectation, log: LogTarget) -> Self {
        Self {
            command: join_shell(tokens),
            expect,
            log,
        }
    }

    /// Wraps free-form shell text so redirections and timeouts cover all of it.
    pub fn from_shell(text: &str, expect: Expectation, log: LogTarget) -> Self {
        Self {
            command: format!("sh -c {}", quote(text)),
            expect,
            log,
        }
    }

    fn render(&self, timeout_secs: Option<u64>) -> String {
        let mut line = String::new();
        if self.expect == Expectation::Fails {
            line.push_str("! ");
        }
        if let Some(secs) = timeout_secs {
            let _ = write!(line, "timeout {secs} ");
        }
        let _ = write!(line, "{} {}", self.command, self.log.redirect());
        line
    }
}

/// A pattern that must match somewhere in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepCheck {
    pub pattern: String,
    pub file: String,
}

impl GrepCheck {
    fn render(&self) -> String {
        format!("grep -q -E -- {} {}", quote(&self.pattern), quote(&self.file))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPlan {
    pub mode: &'static str,
    pub source_name: String,
    pub steps: Vec<Step>,
    pub greps: Vec<GrepCheck>,
    /// Steps that run after the grep checks, e.g. the post-fix compile.
    pub trailing: Vec<Step>,
    pub timeout_secs: Option<u64>,
    pub repeat: u32,
    /// Where the source is parked while steps that rewrite it run. Each attempt
    /// restores the source afterwards, whatever its outcome.
    pub preserve_as: Option<String>,
}

impl ScriptPlan {
    pub fn render(&self) -> String {
        let timeout = self.timeout_secs;
        let mut lines: Vec<String> = self.steps.iter().map(|s| s.render(timeout)).collect();
        lines.extend(self.greps.iter().map(GrepCheck::render));
        lines.extend(self.trailing.iter().map(|s| s.render(timeout)));
        if lines.is_empty() {
            lines.push("true".to_string());
        }

        let mut out = String::from("#!/bin/sh\n");
        let _ = writeln!(
            out,
            "# interestingness test for {} ({} mode)",
            self.source_name, self.mode
        );
        out.push_str("reproduce() {\n");
        let body = lines
            .iter()
            .map(|l| format!("    {l}"))
            .collect::<Vec<_>>()
            .join(" &&\n");
        out.push_str(&body);
        out.push_str("\n}\n\n");

        let entry = match &self.preserve_as {
            Some(parked) => {
                let (source, parked) = (quote(&self.source_name), quote(parked));
                out.push_str("attempt_once() {\n");
                let _ = writeln!(out, "    cp -p {source} {parked} || return 1");
                out.push_str("    reproduce\n    status=$?\n");
                let _ = writeln!(out, "    mv -f {parked} {source}");
                out.push_str("    return $status\n}\n\n");
                "attempt_once"
            }
            None => "reproduce",
        };
        let _ = writeln!(out, "attempt=0");
        let _ = writeln!(out, "while [ \"$attempt\" -lt {} ]; do", self.repeat.max(1));
        let _ = writeln!(out, "    if {entry}; then\n        exit 0\n    fi");
        out.push_str("    attempt=$((attempt + 1))\ndone\nexit 1\n");
        out
    }
}

/// Where the sandbox came from; used to rewrite user-supplied command strings.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisContext<'a> {
    pub sandbox: &'a Sandbox,
    pub build_dir: &'a Path,
    pub original_source: &'a Path,
    /// Checks a crashing tidy run is restricted to. Empty means unrestricted.
    pub crash_checks: &'a CheckSet,
}

/// Builds the predicate for `config` against the sandbox in `ctx`.
pub fn plan(config: &ReducerConfig, ctx: &SynthesisContext<'_>) -> ScriptPlan {
    let sandbox = ctx.sandbox;
    let predicate = &config.predicate;
    let compile = sandbox.compile_command().rewrite(&[&DiagnosticsHygiene]);
    let mut steps = Vec::new();
    let mut trailing = Vec::new();
    let mut preserve_as = None;

    match &config.mode {
        TestMode::Plain => {
            steps.push(Step::from_tokens(
                compile.tokens(),
                Expectation::Succeeds,
                LogTarget::Truncate(PRIMARY_LOG.to_string()),
            ));
        }
        TestMode::CompilerCrash(settings) => {
            match &settings.verifying_compiler {
                Some(verifier) => {
                    let mut tokens = vec![verifier.clone()];
                    match &settings.verifying_compiler_args {
                        Some(args) => tokens.extend(split_shell(&relocate_command_string(
                            args,
                            ctx.build_dir,
                            ctx.original_source,
                            sandbox,
                        ))),
                        None => tokens.extend(
                            sandbox
                                .compile_command()
                                .rewrite(&[&VerifierCompat])
                                .args()
                                .iter()
                                .cloned(),
                        ),
                    }
                    steps.push(Step::from_tokens(
                        &tokens,
                        Expectation::Succeeds,
                        LogTarget::Truncate(VERIFY_LOG.to_string()),
                    ));
                }
                None => warn!("no verifying compiler; reduced input may become invalid code"),
            }
            steps.push(Step::from_tokens(
                compile.tokens(),
                Expectation::Fails,
                LogTarget::Truncate(PRIMARY_LOG.to_string()),
            ));
        }
        TestMode::Tidy(settings) => {
            steps.push(Step::from_tokens(
                compile.tokens(),
                Expectation::Succeeds,
                LogTarget::Truncate(PRIMARY_LOG.to_string()),
            ));
            let mut tokens = tidy::build_invocation(
                settings,
                sandbox,
                ctx.build_dir,
                ctx.original_source,
            );
            if settings.crash && !ctx.crash_checks.is_empty() {
                tokens = tidy::with_checks(&tokens, ctx.crash_checks);
            }
            if settings.post_fix_compile {
                tokens = tidy::with_fixes(&tokens);
                preserve_as = Some(sandbox.pre_fix_name());
            }
            let expect = if settings.crash {
                Expectation::Fails
            } else {
                Expectation::Succeeds
            };
            steps.push(Step::from_tokens(
                &tokens,
                expect,
                LogTarget::Truncate(PRIMARY_LOG.to_string()),
            ));
            if settings.post_fix_compile {
                trailing.push(Step::from_tokens(
                    compile.tokens(),
                    Expectation::Succeeds,
                    LogTarget::Truncate(POST_FIX_LOG.to_string()),
                ));
            }
        }
    }

    if let Some(command) = &predicate.interesting_command {
        let relocated =
            relocate_command_string(command, ctx.build_dir, ctx.original_source, sandbox);
        steps.push(Step::from_shell(
            &relocated,
            Expectation::Succeeds,
            LogTarget::Append(PRIMARY_LOG.to_string()),
        ));
    }

    ScriptPlan {
        mode: config.mode.name(),
        source_name: sandbox.source_name().to_string(),
        steps,
        greps: grep_checks(predicate, sandbox.source_name()),
        trailing,
        timeout_secs: predicate.timeout_secs,
        repeat: predicate.repeat,
        preserve_as,
    }
}

fn grep_checks(predicate: &PredicateSettings, source_name: &str) -> Vec<GrepCheck> {
    let log = predicate.grep.iter().map(|pattern| GrepCheck {
        pattern: pattern.clone(),
        file: PRIMARY_LOG.to_string(),
    });
    let source = predicate.grep_file.iter().map(|pattern| GrepCheck {
        pattern: pattern.clone(),
        file: source_name.to_string(),
    });
    log.chain(source).collect()
}

/// Rewrites a user command so it works inside the sandbox.
///
/// Spellings of the original source become its base name, the build directory
/// becomes the sandbox root, and a `-p <dir>` / `-p=<dir>` selector is pointed at
/// the sandbox. Only a standalone `-p` token is touched.
pub fn relocate_command_string(
    command: &str,
    build_dir: &Path,
    original_source: &Path,
    sandbox: &Sandbox,
) -> String {
    let text = RelocateSource::for_file(original_source).relocate_str(command);
    let root = sandbox.root().to_string_lossy().into_owned();

    let mut variants: Vec<String> = [
        std::path::absolute(build_dir).ok(),
        Some(resolve(build_dir)),
    ]
    .into_iter()
    .flatten()
    .map(|p| p.to_string_lossy().trim_end_matches('/').to_string())
    .filter(|s| !s.is_empty())
    .collect();
    variants.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    variants.dedup();

    let text = if variants.is_empty() {
        text
    } else {
        let alternation = variants
            .iter()
            .map(|v| regex::escape(v))
            .collect::<Vec<_>>()
            .join("|");
        match Regex::new(&alternation) {
            Ok(re) => re.replace_all(&text, NoExpand(&root)).into_owned(),
            Err(e) => {
                debug!("could not build build-dir pattern: {e}");
                text
            }
        }
    };

    let selector = quote(&root);
    PROJECT_SELECTOR
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            format!("{}-p {selector}", &caps[1])
        })
        .into_owned()
}

/// Atomically replaces the sandbox's `test.sh` with `contents`, mode 0755.
pub fn write_script(sandbox: &Sandbox, contents: &str) -> Result<(), SandboxError> {
    let target = sandbox.script_path();
    let mut tmp = tempfile::NamedTempFile::new_in(sandbox.root())
        .map_err(|e| SandboxError::Io(format!("creating temporary script: {e}")))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.flush())
        .map_err(|e| SandboxError::Io(format!("writing temporary script: {e}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755))
            .map_err(|e| SandboxError::Io(format!("marking script executable: {e}")))?;
    }
    tmp.persist(&target)
        .map_err(|e| SandboxError::Io(format!("installing {target:?}: {}", e.error)))?;
    info!(script = %target.display(), "wrote interestingness test");
    Ok(())
}

/// Plans, renders and installs the predicate in one go.
pub fn synthesize(
    config: &ReducerConfig,
    ctx: &SynthesisContext<'_>,
) -> Result<ScriptPlan, SandboxError> {
    let plan = plan(config, ctx);
    write_script(ctx.sandbox, &plan.render())?;
    Ok(plan)
}
