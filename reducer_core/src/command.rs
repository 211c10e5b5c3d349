use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::trace;

/// Fixed object name every relocated compile command writes to.
pub const OUTPUT_OBJECT: &str = "output.cpp.o";
/// Dialect assumed when a command carries no usable `-std=` flag.
pub const DEFAULT_DIALECT: &str = "c++20";

static WERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-Werror(=.*)?$").expect("static -Werror pattern is valid")
});

/// A compile command modelled as a token sequence.
///
/// All transformations go through [`RewriteRule`]s which map a token sequence to a new one,
/// so a command is never patched by substring surgery on a flat string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileCommand {
    tokens: Vec<String>,
}

impl CompileCommand {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Splits a shell-style command string into tokens.
    pub fn parse(command: &str) -> Self {
        Self::new(split_shell(command))
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn program(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    /// Every token after the program name.
    pub fn args(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or(&[])
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// Renders the command as a single shell-safe string.
    pub fn render(&self) -> String {
        join_shell(&self.tokens)
    }

    /// Applies each rule in turn and returns the rewritten command.
    pub fn rewrite(&self, rules: &[&dyn RewriteRule]) -> Self {
        let tokens = rules.iter().fold(self.tokens.clone(), |tokens, rule| {
            let rewritten = rule.apply(tokens.clone());
            if rewritten != tokens {
                trace!(rule = rule.name(), "rewrote command");
            }
            rewritten
        });
        Self { tokens }
    }

    /// The C++ dialect requested by the first `-std=` flag, normalized to `c++NN`.
    pub fn dialect(&self) -> String {
        self.tokens
            .iter()
            .find_map(|t| t.strip_prefix("-std="))
            .and_then(|value| {
                let value = value
                    .strip_prefix("gnu")
                    .map_or_else(|| value.to_string(), |rest| format!("c{rest}"));
                value.starts_with("c++").then_some(value)
            })
            .unwrap_or_else(|| DEFAULT_DIALECT.to_string())
    }
}

impl fmt::Display for CompileCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A named, pure rewrite of a command's token sequence.
///
/// Rules touch disjoint sets of tokens, so the result of applying a set of rules
/// does not depend on the order they are listed in.
pub trait RewriteRule: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, tokens: Vec<String>) -> Vec<String>;
}

/// Replaces every spelling of the source path with its base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocateSource {
    variants: Vec<String>,
    base_name: String,
}

impl RelocateSource {
    /// Collects the literal, absolute and resolved spellings of `source`.
    pub fn for_file(source: &Path) -> Self {
        let mut variants: Vec<String> = path_variants(source)
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a shorter spelling never eats part of a longer one.
        variants.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        variants.dedup();
        let base_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            variants,
            base_name,
        }
    }

    /// Rewrites every spelling of the source path inside a free-form string.
    pub fn relocate_str(&self, text: &str) -> String {
        self.variants
            .iter()
            .filter(|v| **v != self.base_name)
            .fold(text.to_string(), |acc, v| acc.replace(v.as_str(), &self.base_name))
    }
}

impl RewriteRule for RelocateSource {
    fn name(&self) -> &'static str {
        "relocate-source"
    }

    fn apply(&self, tokens: Vec<String>) -> Vec<String> {
        tokens.into_iter().map(|t| self.relocate_str(&t)).collect()
    }
}

/// Forces `-o <obj>.o` to write [`OUTPUT_OBJECT`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedObjectOutput;

impl RewriteRule for FixedObjectOutput {
    fn name(&self) -> &'static str {
        "fixed-object-output"
    }

    fn apply(&self, tokens: Vec<String>) -> Vec<String> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut iter = tokens.into_iter().peekable();
        while let Some(token) = iter.next() {
            if token == "-o" && iter.peek().is_some_and(|next| next.ends_with(".o")) {
                iter.next();
                out.push(token);
                out.push(OUTPUT_OBJECT.to_string());
            } else if token.len() > 2 && token.starts_with("-o") && token.ends_with(".o") {
                out.push("-o".to_string());
                out.push(OUTPUT_OBJECT.to_string());
            } else {
                out.push(token);
            }
        }
        out
    }
}

/// Injects `-I<dir>` and `-Wfatal-errors` in front of `-c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFlagInjection {
    include_flag: String,
}

impl CompileFlagInjection {
    pub fn new(include_dir: &Path) -> Self {
        Self {
            include_flag: format!("-I{}", include_dir.display()),
        }
    }
}

impl RewriteRule for CompileFlagInjection {
    fn name(&self) -> &'static str {
        "compile-flag-injection"
    }

    fn apply(&self, mut tokens: Vec<String>) -> Vec<String> {
        let Some(pos) = tokens.iter().position(|t| t == "-c") else {
            return tokens;
        };
        let mut injected = Vec::new();
        if !tokens.contains(&self.include_flag) {
            injected.push(self.include_flag.clone());
        }
        if !tokens.iter().any(|t| t == "-Wfatal-errors") {
            injected.push("-Wfatal-errors".to_string());
        }
        tokens.splice(pos..pos, injected);
        tokens
    }
}

/// Drops `-Werror` and `-Werror=<group>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripWerror;

impl RewriteRule for StripWerror {
    fn name(&self) -> &'static str {
        "strip-werror"
    }

    fn apply(&self, tokens: Vec<String>) -> Vec<String> {
        tokens.into_iter().filter(|t| !WERROR.is_match(t)).collect()
    }
}

/// Keeps compiler logs free of terminal colour codes so they can be grepped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsHygiene;

impl RewriteRule for DiagnosticsHygiene {
    fn name(&self) -> &'static str {
        "diagnostics-hygiene"
    }

    fn apply(&self, tokens: Vec<String>) -> Vec<String> {
        let mut out: Vec<String> = tokens
            .into_iter()
            .filter(|t| t != "-fcolor-diagnostics" && !t.starts_with("-fdiagnostics-color"))
            .collect();
        if !out.iter().any(|t| t == "-fno-color-diagnostics") {
            out.push("-fno-color-diagnostics".to_string());
        }
        out
    }
}

/// Removes clang-only spellings a verifying compiler (often GCC) would reject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifierCompat;

impl RewriteRule for VerifierCompat {
    fn name(&self) -> &'static str {
        "verifier-compat"
    }

    fn apply(&self, tokens: Vec<String>) -> Vec<String> {
        tokens
            .into_iter()
            .filter(|t| t != "-fcolor-diagnostics" && t != "-Wdocumentation")
            .map(|t| {
                if t == "-fopenmp=libomp" {
                    "-fopenmp".to_string()
                } else {
                    t
                }
            })
            .collect()
    }
}

/// Turns a relocated compile into a preprocessing run writing `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessOutput {
    target: String,
}

impl PreprocessOutput {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl RewriteRule for PreprocessOutput {
    fn name(&self) -> &'static str {
        "preprocess-output"
    }

    fn apply(&self, tokens: Vec<String>) -> Vec<String> {
        let mut out = Vec::with_capacity(tokens.len() + 3);
        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            if token == "-o" {
                iter.next();
                continue;
            }
            out.push(token);
        }
        out.extend([
            "-E".to_string(),
            "-P".to_string(),
            "-o".to_string(),
            self.target.clone(),
        ]);
        out
    }
}

/// The rule set that makes a database entry location independent.
pub fn relocation_rules(source: &Path) -> Vec<Box<dyn RewriteRule>> {
    let include_dir = resolve(source)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    vec![
        Box::new(RelocateSource::for_file(source)),
        Box::new(FixedObjectOutput),
        Box::new(CompileFlagInjection::new(&include_dir)),
        Box::new(StripWerror),
    ]
}

/// Best-effort resolved form of `path`: canonical if it exists, else absolute.
pub fn resolve(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn path_variants(path: &Path) -> Vec<PathBuf> {
    let mut variants = vec![path.to_path_buf()];
    if let Ok(abs) = std::path::absolute(path) {
        variants.push(abs);
    }
    if let Ok(canonical) = path.canonicalize() {
        variants.push(canonical);
    }
    variants
}

/// Splits a command line the way a POSIX shell would, minus expansions.
pub fn split_shell(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '"' => {
                in_token = true;
                while let Some(q) = chars.next() {
                    match q {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
                            Some(e) => {
                                current.push('\\');
                                current.push(e);
                            }
                            None => current.push('\\'),
                        },
                        _ => current.push(q),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(e) = chars.next() {
                    current.push(e);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            _ => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Quotes a single token for a POSIX shell, leaving plain tokens untouched.
pub fn quote(token: &str) -> String {
    let plain = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-+=/.,:@%^".contains(c));
    if plain {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

pub fn join_shell<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| quote(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
