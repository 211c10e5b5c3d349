use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required option: {0}")]
    Missing(&'static str),
    #[error("Option {option} requires {requires}")]
    Requires {
        option: &'static str,
        requires: &'static str,
    },
    #[error("Invalid value for {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReducerSettings {
    /// Reducer binary name or path. Auto-detected when absent.
    pub binary: Option<String>,
    /// Parallelism handed to the reducer. Defaults to the number of CPUs.
    pub jobs: Option<usize>,
    /// Ask whether to keep reducing after the reducer halts.
    #[serde(default)]
    pub prompt_rerun: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PredicateSettings {
    /// Seconds each predicate step may run for.
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Patterns that must appear in the primary log.
    #[serde(default)]
    pub grep: Vec<String>,
    /// Patterns that must appear in the source file.
    #[serde(default)]
    pub grep_file: Vec<String>,
    pub interesting_command: Option<String>,
}

pub fn default_repeat() -> u32 {
    1
}

impl Default for PredicateSettings {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            repeat: default_repeat(),
            grep: Vec::new(),
            grep_file: Vec::new(),
            interesting_command: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CompilerCrashSettings {
    /// Compiler that asserts the reduced input is still valid code.
    pub verifying_compiler: Option<String>,
    /// Replaces the arguments derived from the crashing command.
    pub verifying_compiler_args: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TidySettings {
    #[serde(default = "default_tidy_binary")]
    pub binary: String,
    /// Full invocation used verbatim instead of the derived one.
    pub invocation: Option<String>,
    /// Check enabled on the derived invocation.
    pub check: Option<String>,
    /// The tool must crash for the input to be interesting.
    #[serde(default)]
    pub crash: bool,
    /// Apply fixes and require the fixed file to compile.
    #[serde(default)]
    pub post_fix_compile: bool,
}

pub fn default_tidy_binary() -> String {
    "clang-tidy".to_string()
}

impl Default for TidySettings {
    fn default() -> Self {
        Self {
            binary: default_tidy_binary(),
            invocation: None,
            check: None,
            crash: false,
            post_fix_compile: false,
        }
    }
}

/// What the interestingness test checks for.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum TestMode {
    /// Compilation must succeed; grep checks or the interesting command carry the signal.
    #[default]
    Plain,
    CompilerCrash(CompilerCrashSettings),
    Tidy(TidySettings),
}

impl TestMode {
    pub fn name(&self) -> &'static str {
        match self {
            TestMode::Plain => "plain",
            TestMode::CompilerCrash(_) => "compiler-crash",
            TestMode::Tidy(_) => "tidy",
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReducerConfig {
    pub source_file: Option<PathBuf>,
    pub build_dir: Option<PathBuf>,
    /// Existing sandbox to continue reducing in.
    pub resume: Option<PathBuf>,
    #[serde(default = "default_preprocess")]
    pub preprocess: bool,
    #[serde(default)]
    pub reducer: ReducerSettings,
    #[serde(default)]
    pub predicate: PredicateSettings,
    #[serde(default)]
    pub mode: TestMode,
}

pub fn default_preprocess() -> bool {
    true
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            source_file: None,
            build_dir: None,
            resume: None,
            preprocess: default_preprocess(),
            reducer: ReducerSettings::default(),
            predicate: PredicateSettings::default(),
            mode: TestMode::default(),
        }
    }
}

impl ReducerConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: ReducerConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Rejects option combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resume.is_none() {
            if self.source_file.is_none() {
                return Err(ConfigError::Missing("source file"));
            }
            if self.build_dir.is_none() {
                return Err(ConfigError::Missing("build directory"));
            }
        }
        if self.predicate.repeat == 0 {
            return Err(ConfigError::Invalid {
                option: "repeat",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.reducer.jobs == Some(0) {
            return Err(ConfigError::Invalid {
                option: "jobs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.predicate.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid {
                option: "timeout",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if let TestMode::CompilerCrash(settings) = &self.mode {
            if settings.verifying_compiler_args.is_some() && settings.verifying_compiler.is_none()
            {
                return Err(ConfigError::Requires {
                    option: "verifying-compiler-args",
                    requires: "verifying-compiler",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_toml() {
        let text = r#"
            source-file = "src/main.cpp"
            build-dir = "build"
            preprocess = false

            [reducer]
            binary = "cvise"
            jobs = 4
            prompt-rerun = true

            [predicate]
            timeout-secs = 30
            repeat = 3
            grep = ["internal compiler error"]

            [mode]
            kind = "compiler-crash"
            verifying-compiler = "g++"
        "#;
        let config: ReducerConfig = toml::from_str(text).unwrap();
        assert!(!config.preprocess);
        assert_eq!(config.reducer.jobs, Some(4));
        assert_eq!(config.predicate.repeat, 3);
        assert_eq!(
            config.mode,
            TestMode::CompilerCrash(CompilerCrashSettings {
                verifying_compiler: Some("g++".to_string()),
                verifying_compiler_args: None,
            })
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tidy_mode_defaults() {
        let config: ReducerConfig = toml::from_str(
            r#"
            source-file = "a.cpp"
            build-dir = "b"
            [mode]
            kind = "tidy"
            crash = true
            "#,
        )
        .unwrap();
        match config.mode {
            TestMode::Tidy(tidy) => {
                assert_eq!(tidy.binary, "clang-tidy");
                assert!(tidy.crash);
                assert!(!tidy.post_fix_compile);
            }
            other => panic!("Expected tidy mode, got {other:?}"),
        }
        assert!(config.preprocess);
        assert_eq!(config.predicate.repeat, 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ReducerConfig, _> = toml::from_str("no-such-option = 1");
        assert!(result.is_err());
    }

    #[test]
    fn verifier_args_require_verifier() {
        let config = ReducerConfig {
            source_file: Some("a.cpp".into()),
            build_dir: Some("b".into()),
            mode: TestMode::CompilerCrash(CompilerCrashSettings {
                verifying_compiler: None,
                verifying_compiler_args: Some("-c a.cpp".into()),
            }),
            ..ReducerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Requires {
                option: "verifying-compiler-args",
                requires: "verifying-compiler",
            })
        );
    }

    #[test]
    fn new_runs_need_source_and_build_dir() {
        let config = ReducerConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::Missing("source file")));

        let resumed = ReducerConfig {
            resume: Some("build/reducer/abc".into()),
            ..ReducerConfig::default()
        };
        assert!(resumed.validate().is_ok());
    }

    #[test]
    fn zero_repeat_is_invalid() {
        let mut config = ReducerConfig {
            source_file: Some("a.cpp".into()),
            build_dir: Some("b".into()),
            ..ReducerConfig::default()
        };
        config.predicate.repeat = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { option: "repeat", .. })
        ));
    }
}
