use crate::command::CompileCommand;
use crate::compdb::{COMPILE_COMMANDS, CompDbError, CompilationDatabase, CompilationEntry};
use rand_core::RngCore;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Directory under the build tree that holds every sandbox.
pub const SANDBOX_PARENT: &str = "reducer";
pub const SCRIPT_NAME: &str = "test.sh";
pub const PRIMARY_LOG: &str = "log.txt";
pub const POST_FIX_LOG: &str = "log_fix.txt";
pub const VERIFY_LOG: &str = "verify.log";
pub const TIDY_CONFIG: &str = ".clang-tidy";

const BACKUP_SUFFIX: &str = "bckp";
const PREPROCESSED_SUFFIX: &str = "preprocessed";
const PRE_FIX_SUFFIX: &str = "orig";
const ID_BYTES: usize = 16;
const MAX_CREATE_ATTEMPTS: usize = 8;

/// Errors raised while creating, opening or mutating a sandbox.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A filesystem operation inside the sandbox failed.
    #[error("Sandbox I/O error: {0}")]
    Io(String),

    /// The source file or resume directory does not exist.
    #[error("Path not found: {0:?}")]
    NotFound(PathBuf),

    /// Several random ids in a row collided with existing directories.
    #[error("Could not create a fresh sandbox directory under {0:?}")]
    NoFreshDirectory(PathBuf),

    /// The database inside a resumed sandbox does not describe exactly one file.
    #[error("Sandbox database {path:?} must hold exactly one entry, found {found}")]
    InvalidDatabase { path: PathBuf, found: usize },

    #[error(transparent)]
    CompDb(#[from] CompDbError),
}

fn io_error(context: impl std::fmt::Display) -> impl FnOnce(std::io::Error) -> SandboxError {
    move |e| SandboxError::Io(format!("{context}: {e}"))
}

/// An isolated working directory for one reduction.
///
/// Everything below [`Sandbox::root`] is owned by the sandbox. After creation the
/// source is addressed purely by its base name, so the reducer can rewrite it in
/// place without touching the original project tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
    id: String,
    entry: CompilationEntry,
    source_name: String,
}

impl Sandbox {
    /// Creates `<build_dir>/reducer/<hex id>`, copies `source` into it and writes the
    /// relocated single-entry database.
    ///
    /// `source` is checked before anything is created, so a missing file leaves no
    /// directory behind.
    pub fn create<R: RngCore + ?Sized>(
        build_dir: &Path,
        source: &Path,
        entry: &CompilationEntry,
        rng: &mut R,
    ) -> Result<Self, SandboxError> {
        if !source.is_file() {
            return Err(SandboxError::NotFound(source.to_path_buf()));
        }
        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::NotFound(source.to_path_buf()))?;

        let parent = build_dir.join(SANDBOX_PARENT);
        fs::create_dir_all(&parent).map_err(io_error(format!("creating {parent:?}")))?;

        let (root, id) = create_fresh_dir(&parent, rng)?;
        fs::copy(source, root.join(&source_name))
            .map_err(io_error(format!("copying {source:?} into {root:?}")))?;

        let entry = CompilationEntry {
            file: PathBuf::from(&source_name),
            directory: root.clone(),
            command: entry.command.clone(),
            output: None,
        };
        CompilationDatabase::write(std::slice::from_ref(&entry), &root.join(COMPILE_COMMANDS))?;

        info!(sandbox = %root.display(), "created sandbox");
        Ok(Self {
            root,
            id,
            entry,
            source_name,
        })
    }

    /// Reopens an existing sandbox, re-deriving its state from the database inside it.
    pub fn open(dir: &Path) -> Result<Self, SandboxError> {
        if !dir.is_dir() {
            return Err(SandboxError::NotFound(dir.to_path_buf()));
        }
        let database = CompilationDatabase::load(dir)?;
        if database.len() != 1 {
            return Err(SandboxError::InvalidDatabase {
                path: dir.join(COMPILE_COMMANDS),
                found: database.len(),
            });
        }
        let entry = database.entries()[0].clone();
        let source_name = entry
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::NotFound(entry.file.clone()))?;
        let root = dir.to_path_buf();
        if !root.join(&source_name).is_file() {
            return Err(SandboxError::NotFound(root.join(&source_name)));
        }
        let id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(sandbox = %root.display(), "opened existing sandbox");
        Ok(Self {
            root,
            id,
            entry,
            source_name,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entry(&self) -> &CompilationEntry {
        &self.entry
    }

    pub fn compile_command(&self) -> &CompileCommand {
        &self.entry.command
    }

    /// Base name of the source file being reduced.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn source_path(&self) -> PathBuf {
        self.root.join(&self.source_name)
    }

    pub fn script_path(&self) -> PathBuf {
        self.root.join(SCRIPT_NAME)
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(COMPILE_COMMANDS)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(PRIMARY_LOG)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.root.join(format!("{}.{BACKUP_SUFFIX}", self.source_name))
    }

    /// Name (relative to the root) the preprocessor writes its candidate to.
    pub fn preprocessed_name(&self) -> String {
        format!("{}.{PREPROCESSED_SUFFIX}", self.source_name)
    }

    /// Name (relative to the root) the predicate parks the source under while fixes run.
    pub fn pre_fix_name(&self) -> String {
        format!("{}.{PRE_FIX_SUFFIX}", self.source_name)
    }

    pub fn snapshot_path(&self, generation: u32) -> PathBuf {
        self.root.join(format!("{}.{generation}", self.source_name))
    }

    pub fn read_source(&self) -> Result<Vec<u8>, SandboxError> {
        let path = self.source_path();
        fs::read(&path).map_err(io_error(format!("reading {path:?}")))
    }

    /// MD5 of the current working copy of the source.
    pub fn source_digest(&self) -> Result<[u8; 16], SandboxError> {
        Ok(md5::compute(self.read_source()?).0)
    }

    /// Checkpoints the working source before a mutation.
    pub fn backup(&self) -> Result<(), SandboxError> {
        let (from, to) = (self.source_path(), self.backup_path());
        fs::copy(&from, &to).map_err(io_error(format!("backing up {from:?}")))?;
        Ok(())
    }

    /// Rolls the working source back to the last checkpoint.
    pub fn restore(&self) -> Result<(), SandboxError> {
        let (from, to) = (self.backup_path(), self.source_path());
        fs::copy(&from, &to).map_err(io_error(format!("restoring {to:?} from {from:?}")))?;
        Ok(())
    }

    /// Lowest generation without a snapshot, counting those of earlier sessions.
    pub fn next_generation(&self) -> u32 {
        (0..)
            .find(|&n| !self.snapshot_path(n).exists())
            .unwrap_or(u32::MAX)
    }

    /// Copies the current source to the next free `<name>.<n>` and returns that path.
    ///
    /// Existing snapshots are never overwritten.
    pub fn snapshot(&self) -> Result<PathBuf, SandboxError> {
        let contents = self.read_source()?;
        let target = self.snapshot_path(self.next_generation());
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(io_error(format!("creating snapshot {target:?}")))?;
        file.write_all(&contents)
            .map_err(io_error(format!("writing snapshot {target:?}")))?;
        info!(snapshot = %target.display(), "kept reduced file");
        Ok(target)
    }
}

fn create_fresh_dir<R: RngCore + ?Sized>(
    parent: &Path,
    rng: &mut R,
) -> Result<(PathBuf, String), SandboxError> {
    for _ in 0..MAX_CREATE_ATTEMPTS {
        let id = generate_id(rng);
        let candidate = parent.join(&id);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok((candidate, id)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(%id, "sandbox id collision, retrying");
            }
            Err(e) => return Err(io_error(format!("creating {candidate:?}"))(e)),
        }
    }
    Err(SandboxError::NoFreshDirectory(parent.to_path_buf()))
}

/// Random lowercase hex id.
pub fn generate_id<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; ID_BYTES];
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
