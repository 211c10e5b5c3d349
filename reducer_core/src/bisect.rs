//! Finds the minimal set of clang-tidy checks that still crashes the tool.

use crate::executor::{ExecutionResult, Executor, Invocation};
use crate::tidy::{insert_option, with_checks};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

static CRASH_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ASTMatcher: Processing '([^']*)'").expect("static crash marker pattern is valid")
});

static CHECK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w+(?:-[\w.]+)+$").expect("static check name pattern is valid")
});

/// Ordered check identifiers without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSet {
    checks: Vec<String>,
}

impl CheckSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `check` unless it is already present.
    pub fn push(&mut self, check: impl Into<String>) {
        let check = check.into();
        if !self.checks.contains(&check) {
            self.checks.push(check);
        }
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.checks
    }

    /// `--checks=-*,a,b`: everything disabled except this set.
    pub fn to_checks_arg(&self) -> String {
        let mut arg = String::from("--checks=-*");
        for check in &self.checks {
            arg.push(',');
            arg.push_str(check);
        }
        arg
    }
}

impl<S: Into<String>> FromIterator<S> for CheckSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut set = CheckSet::new();
        for check in iter {
            set.push(check);
        }
        set
    }
}

impl fmt::Display for CheckSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checks.join(","))
    }
}

/// Name of the check clang-tidy was running when it crashed, if it said so.
pub fn parse_crash_marker(stderr: &str) -> Option<String> {
    CRASH_MARKER
        .captures(stderr)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| !name.is_empty())
}

/// Check names from `--list-checks` output, in order, without duplicates.
pub fn parse_check_list(stdout: &str) -> CheckSet {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| CHECK_NAME.is_match(line))
        .collect()
}

/// Divide-and-conquer search for the checks a tidy crash depends on.
///
/// Every probe runs the base invocation restricted with `--checks=-*,...`. A probe
/// counts as crashing only when the tool exits unsuccessfully; timeouts and spawn
/// failures do not.
pub struct CrashCheckBisector<'e> {
    executor: &'e mut dyn Executor,
    invocation: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    probes: usize,
}

impl<'e> CrashCheckBisector<'e> {
    pub fn new(
        executor: &'e mut dyn Executor,
        invocation: Vec<String>,
        working_dir: &Path,
    ) -> Self {
        Self {
            executor,
            invocation,
            working_dir: working_dir.to_path_buf(),
            timeout: None,
            probes: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of tool runs issued so far.
    pub fn probes(&self) -> usize {
        self.probes
    }

    /// Returns the crashing checks, or an empty set when they cannot be determined.
    pub fn deduce(&mut self) -> CheckSet {
        if let Some(check) = self.crash_marker() {
            info!(%check, "crash output names the failing check");
            return std::iter::once(check).collect();
        }

        let enabled = self.enabled_checks();
        if enabled.is_empty() {
            warn!("clang-tidy reported no enabled checks");
            return CheckSet::new();
        }
        if !self.crashes(enabled.as_slice(), &[]) {
            warn!(checks = enabled.len(), "no crash with all enabled checks");
            return CheckSet::new();
        }
        let found: CheckSet = self.minimize(enabled.as_slice(), &[]).into_iter().collect();
        info!(checks = %found, probes = self.probes, "bisected crashing checks");
        found
    }

    fn run(&mut self, tokens: &[String]) -> Option<ExecutionResult> {
        let invocation = Invocation::from_tokens(tokens)?
            .in_dir(&self.working_dir)
            .with_timeout(self.timeout);
        self.probes += 1;
        Some(self.executor.execute(&invocation))
    }

    fn crash_marker(&mut self) -> Option<String> {
        let tokens = self.invocation.clone();
        let result = self.run(&tokens)?;
        parse_crash_marker(&result.output.stderr_lossy())
    }

    /// Checks the invocation enables, as reported by `--list-checks`.
    pub fn enabled_checks(&mut self) -> CheckSet {
        let tokens = insert_option(&self.invocation, "--list-checks");
        match self.run(&tokens) {
            Some(result) => parse_check_list(&result.output.stdout_lossy()),
            None => CheckSet::new(),
        }
    }

    fn crashes(&mut self, checks: &[String], context: &[String]) -> bool {
        let set: CheckSet = context.iter().chain(checks).cloned().collect();
        let tokens = with_checks(&self.invocation, &set);
        let crashed = self
            .run(&tokens)
            .is_some_and(|result| result.status.is_crash());
        debug!(checks = %set, crashed, "probe");
        crashed
    }

    /// Smallest sublist of `candidates` that, together with `context`, still crashes.
    ///
    /// Requires `candidates + context` to crash and `context` alone not to.
    fn minimize(&mut self, candidates: &[String], context: &[String]) -> Vec<String> {
        if candidates.len() <= 1 {
            return candidates.to_vec();
        }
        let (left, right) = candidates.split_at(candidates.len() / 2);
        if self.crashes(left, context) {
            return self.minimize(left, context);
        }
        if self.crashes(right, context) {
            return self.minimize(right, context);
        }
        let with_right: Vec<String> = context.iter().chain(right).cloned().collect();
        let needed_left = self.minimize(left, &with_right);
        let with_left: Vec<String> = context.iter().chain(&needed_left).cloned().collect();
        let needed_right = self.minimize(right, &with_left);
        needed_left.into_iter().chain(needed_right).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::split_shell;
    use crate::executor::{ExecutionStatus, ProcessOutput};

    const REPEATED_OPTION: &str =
        "clang-tidy: for the --checks option: may only occur zero or one times!\n";

    /// Pretends to be clang-tidy: crashes iff every check in `needed` is enabled, and
    /// rejects a repeated `--checks` like the real option parser.
    struct FakeTidy {
        all: Vec<String>,
        needed: Vec<String>,
        marker: Option<String>,
    }

    impl FakeTidy {
        fn new(n: usize, needed: &[usize]) -> Self {
            let all: Vec<String> = (0..n).map(|i| format!("check-{i}")).collect();
            let needed = needed.iter().map(|&i| all[i].clone()).collect();
            Self {
                all,
                needed,
                marker: None,
            }
        }
    }

    impl Executor for FakeTidy {
        fn execute(&mut self, invocation: &Invocation) -> ExecutionResult {
            if invocation.args.iter().any(|a| a == "--list-checks") {
                let mut stdout = String::from("Enabled checks:\n");
                for check in &self.all {
                    stdout.push_str(&format!("    {check}\n"));
                }
                stdout.push('\n');
                return ExecutionResult {
                    status: ExecutionStatus::Ok,
                    output: ProcessOutput {
                        stdout: stdout.into_bytes(),
                        ..ProcessOutput::default()
                    },
                };
            }
            let options: Vec<&str> = invocation
                .args
                .iter()
                .filter_map(|a| a.strip_prefix("--checks="))
                .collect();
            if options.len() > 1 {
                return ExecutionResult {
                    status: ExecutionStatus::Crash("Exited with code 1".to_string()),
                    output: ProcessOutput {
                        stderr: REPEATED_OPTION.as_bytes().to_vec(),
                        exit_code: Some(1),
                        ..ProcessOutput::default()
                    },
                };
            }
            let enabled: Vec<String> = match options.first().and_then(|o| o.strip_prefix("-*")) {
                Some(list) => list
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => self.all.clone(),
            };
            let crashed =
                !self.needed.is_empty() && self.needed.iter().all(|n| enabled.contains(n));
            if !crashed {
                return ExecutionResult::from_status(ExecutionStatus::Ok);
            }
            let stderr = match &self.marker {
                Some(check) => format!(
                    "Stack dump:\n0. Program arguments: clang-tidy\n1. ASTMatcher: Processing '{check}' against:\n"
                ),
                None => "Stack dump:\n".to_string(),
            };
            ExecutionResult {
                status: ExecutionStatus::Crash("Exited with code 1".to_string()),
                output: ProcessOutput {
                    stderr: stderr.into_bytes(),
                    exit_code: Some(1),
                    ..ProcessOutput::default()
                },
            }
        }
    }

    fn deduce(fake: &mut FakeTidy) -> CheckSet {
        let invocation = split_shell("clang-tidy -p /sandbox main.cpp");
        CrashCheckBisector::new(fake, invocation, Path::new("/sandbox")).deduce()
    }

    fn expected(fake: &FakeTidy) -> CheckSet {
        fake.all
            .iter()
            .filter(|c| fake.needed.contains(c))
            .cloned()
            .collect()
    }

    #[test]
    fn single_check_is_found_for_every_size() {
        for n in [1usize, 2, 7, 100] {
            for culprit in [0, n / 2, n - 1] {
                let mut fake = FakeTidy::new(n, &[culprit]);
                assert_eq!(deduce(&mut fake), expected(&fake), "n={n} culprit={culprit}");
            }
        }
    }

    #[test]
    fn pair_of_checks_is_found_for_every_size() {
        for n in [2usize, 7, 100] {
            for (a, b) in [(0, 1), (0, n - 1), (n / 2 - 1, n / 2), (1, n / 3)] {
                if a == b || b >= n {
                    continue;
                }
                let mut fake = FakeTidy::new(n, &[a, b]);
                assert_eq!(deduce(&mut fake), expected(&fake), "n={n} pair=({a},{b})");
            }
        }
    }

    #[test]
    fn check_a_and_b_crash_only_together() {
        let mut fake = FakeTidy {
            all: vec!["check-a".into(), "check-b".into(), "check-c".into()],
            needed: vec!["check-a".into(), "check-b".into()],
            marker: None,
        };
        let found = deduce(&mut fake);
        assert_eq!(found.to_checks_arg(), "--checks=-*,check-a,check-b");
    }

    #[test]
    fn preset_checks_option_is_narrowed_in_place() {
        let mut fake = FakeTidy::new(7, &[2, 5]);
        let all = fake.all.join(",");
        let invocation = split_shell(&format!("clang-tidy -p /sandbox --checks=-*,{all} main.cpp"));
        let found = CrashCheckBisector::new(&mut fake, invocation, Path::new("/sandbox")).deduce();
        assert_eq!(found.as_slice(), ["check-2".to_string(), "check-5".to_string()]);
    }

    #[test]
    fn crash_marker_short_circuits() {
        let mut fake = FakeTidy::new(7, &[3]);
        fake.marker = Some("bugprone-use-after-move".to_string());
        let mut bisector = CrashCheckBisector::new(
            &mut fake,
            split_shell("clang-tidy main.cpp"),
            Path::new("/sandbox"),
        );
        let found = bisector.deduce();
        assert_eq!(found.as_slice(), ["bugprone-use-after-move".to_string()]);
        assert_eq!(bisector.probes(), 1);
    }

    #[test]
    fn no_crash_and_empty_list_yield_nothing() {
        let mut quiet = FakeTidy::new(5, &[]);
        assert!(deduce(&mut quiet).is_empty());

        let mut empty = FakeTidy::new(0, &[]);
        let mut bisector = CrashCheckBisector::new(
            &mut empty,
            split_shell("clang-tidy main.cpp"),
            Path::new("/sandbox"),
        );
        assert!(bisector.deduce().is_empty());
        assert_eq!(bisector.probes(), 2);
    }

    #[test]
    fn spawn_failure_is_not_a_crash() {
        struct Missing;
        impl Executor for Missing {
            fn execute(&mut self, _: &Invocation) -> ExecutionResult {
                ExecutionResult::from_status(ExecutionStatus::Other("Failed to spawn".into()))
            }
        }
        let mut missing = Missing;
        let mut bisector = CrashCheckBisector::new(
            &mut missing,
            split_shell("clang-tidy main.cpp"),
            Path::new("/sandbox"),
        );
        assert!(bisector.deduce().is_empty());
    }

    #[test]
    fn parses_marker_anywhere_in_stderr() {
        let stderr = "PLEASE submit a bug report\nStack dump:\n1.\t<eof> parser\n2.\tASTMatcher: Processing 'modernize-use-nullptr' against:\n";
        assert_eq!(
            parse_crash_marker(stderr),
            Some("modernize-use-nullptr".to_string())
        );
        assert_eq!(parse_crash_marker("Stack dump:\n"), None);
    }

    #[test]
    fn parses_check_list_output() {
        let stdout = "Enabled checks:\n    bugprone-foo\n    clang-analyzer-core.NullDereference\n    bugprone-foo\n\nSuppressed 3 warnings\n";
        let checks = parse_check_list(stdout);
        assert_eq!(
            checks.as_slice(),
            [
                "bugprone-foo".to_string(),
                "clang-analyzer-core.NullDereference".to_string()
            ]
        );
    }
}
