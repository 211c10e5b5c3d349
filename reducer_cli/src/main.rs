use reducer_core::config::{CompilerCrashSettings, ReducerConfig, TestMode, TidySettings};
use reducer_core::driver::{self, DriverError};
use reducer_core::executor::CommandExecutor;
use reducer_core::prompt::LineConfirm;
use reducer_core::telemetry::{init_tracing, level_for_verbosity};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "reducer.toml";

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Extract a crashing compile from compile_commands.json and reduce it with cvise/creduce",
    long_about = None
)]
struct Cli {
    /// Source file to reduce.
    source_file: Option<PathBuf>,
    /// Build directory holding compile_commands.json.
    #[clap(short, long)]
    build_dir: Option<PathBuf>,
    /// TOML configuration; command-line options override it.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Reducer to run instead of the first of cvise/creduce on PATH.
    #[clap(long)]
    reduce_bin: Option<String>,
    /// Extra command that must succeed for the input to be interesting.
    #[clap(long, allow_hyphen_values = true)]
    interesting_command: Option<String>,
    #[clap(short, long)]
    jobs: Option<usize>,
    /// Seconds each step of the interestingness test may take.
    #[clap(long)]
    timeout: Option<u64>,
    /// Attempts per interestingness check; any success counts.
    #[clap(long)]
    repeat: Option<u32>,
    /// Extended regex that must match the primary log. Repeatable.
    #[clap(long)]
    grep: Vec<String>,
    /// Extended regex that must match the source file. Repeatable.
    #[clap(long)]
    grep_file: Vec<String>,
    #[clap(long)]
    no_preprocess: bool,
    /// Ask whether to run the reducer again after it finishes.
    #[clap(long)]
    prompt_rerun: bool,
    /// Continue in an existing sandbox directory.
    #[clap(long)]
    resume: Option<PathBuf>,
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(long)]
    json_logs: bool,
    #[clap(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Mode {
    /// Keep the file compiling; grep checks or the interesting command decide.
    Plain,
    /// Reduce an input that makes the compiler fail or crash.
    CompilerCrash {
        /// Compiler that checks the reduced code is still valid.
        #[clap(long)]
        verifying_compiler: Option<String>,
        /// Arguments for the verifying compiler instead of the derived ones.
        #[clap(long, allow_hyphen_values = true)]
        verifying_compiler_args: Option<String>,
    },
    /// Reduce an input for clang-tidy.
    Tidy {
        #[clap(long, default_value = "clang-tidy")]
        clang_tidy_binary: String,
        /// Complete clang-tidy command line to use instead of the derived one.
        #[clap(long, allow_hyphen_values = true)]
        clang_tidy_invocation: Option<String>,
        #[clap(long)]
        clang_tidy_check: Option<String>,
        /// clang-tidy must crash.
        #[clap(long)]
        crash: bool,
        /// Apply fixes and require the result to compile.
        #[clap(long)]
        post_fix_compile: bool,
    },
}

impl From<Mode> for TestMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Plain => TestMode::Plain,
            Mode::CompilerCrash {
                verifying_compiler,
                verifying_compiler_args,
            } => TestMode::CompilerCrash(CompilerCrashSettings {
                verifying_compiler,
                verifying_compiler_args,
            }),
            Mode::Tidy {
                clang_tidy_binary,
                clang_tidy_invocation,
                clang_tidy_check,
                crash,
                post_fix_compile,
            } => TestMode::Tidy(TidySettings {
                binary: clang_tidy_binary,
                invocation: clang_tidy_invocation,
                check: clang_tidy_check,
                crash,
                post_fix_compile,
            }),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ReducerConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            ReducerConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG);
            if default_config_path.exists() {
                info!("Loading default configuration {default_config_path:?}");
                ReducerConfig::load_from_file(&default_config_path)
            } else {
                Ok(ReducerConfig::default())
            }
        }
    }
}

/// Command-line values win over the configuration file.
fn apply_overrides(cli: Cli, config: &mut ReducerConfig) {
    if cli.source_file.is_some() {
        config.source_file = cli.source_file;
    }
    if cli.build_dir.is_some() {
        config.build_dir = cli.build_dir;
    }
    if cli.resume.is_some() {
        config.resume = cli.resume;
    }
    if cli.no_preprocess {
        config.preprocess = false;
    }
    if cli.reduce_bin.is_some() {
        config.reducer.binary = cli.reduce_bin;
    }
    if cli.jobs.is_some() {
        config.reducer.jobs = cli.jobs;
    }
    if cli.prompt_rerun {
        config.reducer.prompt_rerun = true;
    }
    if cli.timeout.is_some() {
        config.predicate.timeout_secs = cli.timeout;
    }
    if let Some(repeat) = cli.repeat {
        config.predicate.repeat = repeat;
    }
    config.predicate.grep.extend(cli.grep);
    config.predicate.grep_file.extend(cli.grep_file);
    if cli.interesting_command.is_some() {
        config.predicate.interesting_command = cli.interesting_command;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs, level_for_verbosity(cli.verbose));

    let mut config = load_config(cli.config.as_ref())?;
    apply_overrides(cli, &mut config);
    config.validate()?;

    let mut executor = CommandExecutor::new();
    let mut confirm = LineConfirm::stdin();
    let mut rng = rand::rng();

    match driver::run(&config, &mut executor, &mut confirm, &mut rng) {
        Ok(summary) => {
            info!(
                sandbox = %summary.sandbox.display(),
                passes = summary.passes,
                "reduced file at {}",
                summary.reduced_file.display()
            );
            Ok(())
        }
        Err(DriverError::ReducerFailed { status, sandbox }) => {
            error!(%status, "reducer failed");
            Err(anyhow::anyhow!(
                "Reduction failed; inspect or resume with --resume {}",
                sandbox.display()
            ))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("reducer").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn subcommand_after_positional() {
        let cli = parse(&[
            "src/main.cpp",
            "--build-dir",
            "build",
            "compiler-crash",
            "--verifying-compiler",
            "g++",
        ]);
        assert_eq!(cli.source_file, Some(PathBuf::from("src/main.cpp")));
        assert_eq!(
            cli.mode,
            Some(Mode::CompilerCrash {
                verifying_compiler: Some("g++".to_string()),
                verifying_compiler_args: None,
            })
        );
    }

    #[test]
    fn flags_override_file_values() {
        let mut config = ReducerConfig {
            preprocess: true,
            ..ReducerConfig::default()
        };
        config.predicate.grep = vec!["from-file".to_string()];
        let cli = parse(&[
            "a.cpp",
            "-b",
            "out",
            "--no-preprocess",
            "--grep",
            "one",
            "--grep",
            "two",
            "--timeout",
            "15",
            "-vv",
            "tidy",
            "--crash",
        ]);
        assert_eq!(cli.verbose, 2);
        apply_overrides(cli, &mut config);

        assert!(!config.preprocess);
        assert_eq!(config.build_dir, Some(PathBuf::from("out")));
        assert_eq!(config.predicate.grep, vec!["from-file", "one", "two"]);
        assert_eq!(config.predicate.timeout_secs, Some(15));
        match config.mode {
            TestMode::Tidy(tidy) => {
                assert!(tidy.crash);
                assert_eq!(tidy.binary, "clang-tidy");
            }
            other => panic!("Expected tidy mode, got {other:?}"),
        }
    }

    #[test]
    fn no_subcommand_keeps_configured_mode() {
        let mut config = ReducerConfig {
            mode: TestMode::CompilerCrash(CompilerCrashSettings::default()),
            ..ReducerConfig::default()
        };
        apply_overrides(parse(&["--resume", "build/reducer/abc"]), &mut config);
        assert_eq!(config.resume, Some(PathBuf::from("build/reducer/abc")));
        assert_eq!(config.mode.name(), "compiler-crash");
    }
}
