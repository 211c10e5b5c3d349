//! Orchestrates one reduction: sandbox, predicate, preprocessing and reducer runs.

use crate::bisect::{CheckSet, CrashCheckBisector};
use crate::command::resolve;
use crate::compdb::{CompDbError, CompilationDatabase};
use crate::config::{ConfigError, ReducerConfig, TestMode};
use crate::executor::Executor;
use crate::oracle::ScriptOracle;
use crate::preprocess::{PreprocessOutcome, preprocess_and_validate};
use crate::prompt::Confirm;
use crate::reducer::{REDUCER_CANDIDATES, ReducerBinary, ReductionSession, discover_reducer};
use crate::sandbox::{SANDBOX_PARENT, Sandbox, SandboxError};
use crate::script::{SynthesisContext, synthesize};
use crate::tidy;
use rand_core::RngCore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{Span, error, info, info_span, warn};

const CONTINUE_QUESTION: &str = "Continue reduction?";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    CompDb(#[from] CompDbError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Could not find reducer {0}")]
    ReducerNotFound(String),

    #[error("Reducer failed ({status}); sandbox kept at {sandbox:?}")]
    ReducerFailed { status: String, sandbox: PathBuf },

    #[error("Illegal driver transition from {from:?} on {event:?}")]
    IllegalTransition {
        from: DriverState,
        event: DriverEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    SandboxReady,
    Validated,
    Reducing,
    ReducingAgain,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Sandbox created or reopened and the predicate is in place.
    Prepared,
    /// Preprocess-and-validate finished (or was skipped).
    Validated,
    /// The reducer was launched.
    Started,
    /// The reducer exited successfully; `again` says whether to run another pass.
    Halted { again: bool },
}

/// The driver's transition function. Anything not listed is illegal.
pub fn transition(state: DriverState, event: DriverEvent) -> Result<DriverState, DriverError> {
    use DriverEvent as E;
    use DriverState as S;
    match (state, event) {
        (S::Init, E::Prepared) => Ok(S::SandboxReady),
        (S::SandboxReady | S::ReducingAgain, E::Validated) => Ok(S::Validated),
        (S::Validated, E::Started) => Ok(S::Reducing),
        (S::Reducing, E::Halted { again: true }) => Ok(S::ReducingAgain),
        (S::Reducing, E::Halted { again: false }) => Ok(S::Done),
        (from, event) => Err(DriverError::IllegalTransition { from, event }),
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub sandbox: PathBuf,
    pub reduced_file: PathBuf,
    /// Number of reducer runs.
    pub passes: u32,
    pub snapshots: Vec<PathBuf>,
    pub preprocessing: Vec<PreprocessOutcome>,
    pub crash_checks: CheckSet,
}

/// State threaded through every step of a run.
pub struct ReductionContext<'a> {
    pub config: &'a ReducerConfig,
    pub sandbox: Sandbox,
    pub executor: &'a mut dyn Executor,
    pub build_dir: PathBuf,
    pub original_source: PathBuf,
    pub resumed: bool,
    pub span: Span,
}

impl<'a> ReductionContext<'a> {
    /// Creates a fresh sandbox, or reopens the one named by `resume`.
    pub fn prepare<R: RngCore + ?Sized>(
        config: &'a ReducerConfig,
        executor: &'a mut dyn Executor,
        rng: &mut R,
    ) -> Result<Self, DriverError> {
        let (sandbox, build_dir, original_source, resumed) = match &config.resume {
            Some(dir) => {
                let sandbox = Sandbox::open(dir)?;
                let build_dir = dir
                    .parent()
                    .filter(|p| p.ends_with(SANDBOX_PARENT))
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| dir.clone());
                let original_source = sandbox.source_path();
                (sandbox, build_dir, original_source, true)
            }
            None => {
                let source = config
                    .source_file
                    .as_deref()
                    .ok_or(ConfigError::Missing("source file"))?;
                let build_dir = config
                    .build_dir
                    .as_deref()
                    .ok_or(ConfigError::Missing("build directory"))?;
                let source = resolve(source);
                let build_dir = resolve(build_dir);
                if !source.is_file() {
                    return Err(SandboxError::NotFound(source).into());
                }
                let entry = CompilationDatabase::load(&build_dir)?.extract_single(&source)?;
                let sandbox = Sandbox::create(&build_dir, &source, &entry, rng)?;
                (sandbox, build_dir, source, false)
            }
        };
        let span = info_span!("reduction", sandbox = %sandbox.id(), mode = config.mode.name());
        Ok(Self {
            config,
            sandbox,
            executor,
            build_dir,
            original_source,
            resumed,
            span,
        })
    }

    fn step_timeout(&self) -> Option<Duration> {
        self.config.predicate.timeout_secs.map(Duration::from_secs)
    }

    /// Copies the project's clang-tidy config in and, for crashes, narrows the checks.
    pub fn prepare_tidy(&mut self) -> Result<CheckSet, DriverError> {
        let config = self.config;
        let TestMode::Tidy(settings) = &config.mode else {
            return Ok(CheckSet::new());
        };
        if self.resumed && self.sandbox.script_path().is_file() {
            return Ok(CheckSet::new());
        }
        let tokens = tidy::build_invocation(
            settings,
            &self.sandbox,
            &self.build_dir,
            &self.original_source,
        );
        if !self.resumed {
            tidy::dump_config(self.executor, &tokens, &self.build_dir, &self.sandbox)?;
        }
        if !settings.crash {
            return Ok(CheckSet::new());
        }
        let timeout = self.step_timeout();
        let checks = CrashCheckBisector::new(self.executor, tokens, self.sandbox.root())
            .with_timeout(timeout)
            .deduce();
        if checks.is_empty() {
            error!("failed to deduce the check that crashes clang-tidy");
        } else {
            info!(checks = %checks, "deduced crashing checks");
        }
        Ok(checks)
    }

    /// Writes `test.sh`. A resumed sandbox keeps the script it already has.
    pub fn write_predicate(&mut self, crash_checks: &CheckSet) -> Result<(), DriverError> {
        if self.resumed && self.sandbox.script_path().is_file() {
            info!("keeping existing interestingness test");
            return Ok(());
        }
        let ctx = SynthesisContext {
            sandbox: &self.sandbox,
            build_dir: &self.build_dir,
            original_source: &self.original_source,
            crash_checks,
        };
        synthesize(self.config, &ctx)?;
        Ok(())
    }

    pub fn validate(&mut self) -> Result<Option<PreprocessOutcome>, DriverError> {
        if !self.config.preprocess {
            return Ok(None);
        }
        let timeout = self.step_timeout();
        let outcome =
            preprocess_and_validate(&self.sandbox, self.executor, &ScriptOracle::new(), timeout)?;
        info!(?outcome, "preprocessing finished");
        Ok(Some(outcome))
    }

    pub fn reduce_once(&mut self, session: &ReductionSession) -> Result<(), DriverError> {
        let invocation = session.invocation(self.sandbox.root());
        info!(command = %invocation.display(), "running reducer");
        let result = self.executor.execute(&invocation);
        if result.status.is_ok() {
            Ok(())
        } else {
            Err(DriverError::ReducerFailed {
                status: format!("{:?}", result.status),
                sandbox: self.sandbox.root().to_path_buf(),
            })
        }
    }
}

/// Runs a complete reduction as described by `config`.
///
/// Configuration and reducer discovery are checked before any sandbox exists.
pub fn run<R: RngCore + ?Sized>(
    config: &ReducerConfig,
    executor: &mut dyn Executor,
    confirm: &mut dyn Confirm,
    rng: &mut R,
) -> Result<RunSummary, DriverError> {
    config.validate()?;
    let reducer = find_reducer(config.reducer.binary.as_deref())?;

    let mut state = DriverState::Init;
    let mut ctx = ReductionContext::prepare(config, executor, rng)?;
    let span = ctx.span.clone();
    let _entered = span.enter();

    let crash_checks = ctx.prepare_tidy()?;
    ctx.write_predicate(&crash_checks)?;
    state = transition(state, DriverEvent::Prepared)?;

    let session = ReductionSession::prepare(
        reducer,
        config.reducer.jobs,
        config.predicate.timeout_secs,
        &ctx.sandbox,
        ctx.executor,
    );

    let mut summary = RunSummary {
        sandbox: ctx.sandbox.root().to_path_buf(),
        reduced_file: ctx.sandbox.source_path(),
        passes: 0,
        snapshots: Vec::new(),
        preprocessing: Vec::new(),
        crash_checks,
    };

    loop {
        if let Some(outcome) = ctx.validate()? {
            summary.preprocessing.push(outcome);
        }
        state = transition(state, DriverEvent::Validated)?;

        state = transition(state, DriverEvent::Started)?;
        ctx.reduce_once(&session)?;
        summary.passes += 1;

        let again = config.reducer.prompt_rerun && confirm.confirm(CONTINUE_QUESTION);
        state = transition(state, DriverEvent::Halted { again })?;
        if state == DriverState::Done {
            break;
        }
        summary.snapshots.push(ctx.sandbox.snapshot()?);
    }

    info!(
        file = %summary.reduced_file.display(),
        passes = summary.passes,
        "reduction finished"
    );
    Ok(summary)
}

fn find_reducer(configured: Option<&str>) -> Result<ReducerBinary, DriverError> {
    discover_reducer(configured).ok_or_else(|| {
        let searched = configured.map_or_else(|| REDUCER_CANDIDATES.join(" or "), str::to_string);
        warn!(%searched, "no reducer available");
        DriverError::ReducerNotFound(searched)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut state = DriverState::Init;
        for event in [
            DriverEvent::Prepared,
            DriverEvent::Validated,
            DriverEvent::Started,
            DriverEvent::Halted { again: true },
            DriverEvent::Validated,
            DriverEvent::Started,
            DriverEvent::Halted { again: false },
        ] {
            state = transition(state, event).unwrap();
        }
        assert_eq!(state, DriverState::Done);
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let cases = [
            (DriverState::Init, DriverEvent::Started),
            (DriverState::SandboxReady, DriverEvent::Started),
            (DriverState::Validated, DriverEvent::Halted { again: false }),
            (DriverState::Reducing, DriverEvent::Validated),
            (DriverState::ReducingAgain, DriverEvent::Started),
            (DriverState::Done, DriverEvent::Validated),
        ];
        for (from, event) in cases {
            match transition(from, event) {
                Err(DriverError::IllegalTransition { from: f, event: e }) => {
                    assert_eq!((f, e), (from, event));
                }
                other => {
                    panic!("Expected illegal transition for {from:?}/{event:?}, got {other:?}")
                }
            }
        }
    }

    #[test]
    fn missing_reducer_is_reported_by_name() {
        let err = find_reducer(Some("/no/such/reducer")).unwrap_err();
        assert_eq!(err.to_string(), "Could not find reducer /no/such/reducer");
    }

    #[test]
    fn invalid_config_fails_before_anything_else() {
        struct Unused;
        impl Executor for Unused {
            fn execute(
                &mut self,
                _: &crate::executor::Invocation,
            ) -> crate::executor::ExecutionResult {
                panic!("nothing should run for an invalid config");
            }
        }
        let config = ReducerConfig::default();
        let mut rng = rand::rng();
        let err = run(
            &config,
            &mut Unused,
            &mut crate::prompt::FixedConfirm(false),
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::Config(ConfigError::Missing(_))));
    }
}
