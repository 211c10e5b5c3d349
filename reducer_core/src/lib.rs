pub mod bisect;
pub mod command;
pub mod compdb;
pub mod config;
pub mod driver;
pub mod executor;
pub mod oracle;
pub mod preprocess;
pub mod prompt;
pub mod reducer;
pub mod sandbox;
pub mod script;
pub mod telemetry;
pub mod tidy;

pub use bisect::{CheckSet, CrashCheckBisector};
pub use command::{CompileCommand, RewriteRule};
pub use compdb::{CompDbError, CompilationDatabase, CompilationEntry};
pub use config::{ConfigError, ReducerConfig, TestMode};
pub use driver::{DriverError, DriverEvent, DriverState, ReductionContext, RunSummary, run};
pub use executor::{CommandExecutor, ExecutionStatus, Executor, Invocation};
pub use oracle::{Oracle, ScriptOracle, Verdict};
pub use preprocess::{PreprocessOutcome, preprocess_and_validate};
pub use prompt::{Confirm, FixedConfirm, LineConfirm};
pub use reducer::{ReducerBinary, ReducerKind, ReductionSession};
pub use sandbox::{Sandbox, SandboxError};
pub use script::ScriptPlan;
