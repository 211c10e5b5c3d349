use crate::command::{CompileCommand, RelocateSource, RewriteRule, relocation_rules};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of a compilation database inside a build or sandbox directory.
pub const COMPILE_COMMANDS: &str = "compile_commands.json";

#[derive(Error, Debug)]
pub enum CompDbError {
    #[error("Failed to read compilation database {path:?}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse compilation database {path:?}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to write compilation database {path:?}: {message}")]
    Write { path: PathBuf, message: String },

    #[error("Entry for {0:?} has neither `command` nor `arguments`")]
    MissingCommand(PathBuf),

    #[error("No compilation database entry matches {0:?}")]
    NoEntry(PathBuf),

    #[error("{} compilation database entries match {file:?}: {candidates:?}", .candidates.len())]
    Ambiguous {
        file: PathBuf,
        candidates: Vec<PathBuf>,
    },
}

/// One build invocation for one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationEntry {
    pub file: PathBuf,
    pub directory: PathBuf,
    pub command: CompileCommand,
    pub output: Option<String>,
}

/// On-disk shape of an entry; accepts both `command` and `arguments`.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct RawEntry {
    directory: PathBuf,
    file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

impl TryFrom<RawEntry> for CompilationEntry {
    type Error = CompDbError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let command = match (raw.arguments, raw.command) {
            (Some(arguments), _) => CompileCommand::new(arguments),
            (None, Some(command)) => CompileCommand::parse(&command),
            (None, None) => return Err(CompDbError::MissingCommand(raw.file)),
        };
        Ok(Self {
            file: raw.file,
            directory: raw.directory,
            command,
            output: raw.output,
        })
    }
}

impl From<&CompilationEntry> for RawEntry {
    fn from(entry: &CompilationEntry) -> Self {
        Self {
            directory: entry.directory.clone(),
            file: entry.file.clone(),
            command: Some(entry.command.render()),
            arguments: None,
            output: entry.output.clone(),
        }
    }
}

impl CompilationEntry {
    /// The entry's file as an absolute, lexically normalized path.
    pub fn normalized_file(&self) -> PathBuf {
        normalize_lexically(&self.directory.join(&self.file))
    }

    /// Returns a copy whose command no longer depends on where `source` lives.
    pub fn relocated(&self, source: &Path) -> Self {
        let mut rules = relocation_rules(source);
        // The entry may spell the file relative to its directory.
        if self.file != source {
            rules.push(Box::new(RelocateSource::for_file(&self.file)));
        }
        let rules: Vec<&dyn RewriteRule> = rules.iter().map(|r| r.as_ref()).collect();
        Self {
            command: self.command.rewrite(&rules),
            ..self.clone()
        }
    }
}

/// A parsed `compile_commands.json`. Never written back to its origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationDatabase {
    entries: Vec<CompilationEntry>,
}

impl CompilationDatabase {
    /// Loads a database from a directory containing [`COMPILE_COMMANDS`] or from the file itself.
    pub fn load(location: &Path) -> Result<Self, CompDbError> {
        let path = database_path(location);
        let text = fs::read_to_string(&path).map_err(|e| CompDbError::Read {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Self::parse(&text, &path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self, CompDbError> {
        let raw: Vec<RawEntry> = serde_json::from_str(text).map_err(|e| CompDbError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        let entries = raw
            .into_iter()
            .map(CompilationEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(entries = entries.len(), path = ?origin, "loaded compilation database");
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CompilationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose file has the same base name as `target`.
    ///
    /// A cheap substring test on the base name picks candidates, which are then
    /// narrowed to those whose normalized file name component is exactly the base name.
    /// Byte-identical duplicates collapse into one.
    pub fn matching(&self, target: &Path) -> Vec<&CompilationEntry> {
        let Some(base_name) = target.file_name() else {
            return Vec::new();
        };
        let needle = base_name.to_string_lossy();
        let mut found: Vec<&CompilationEntry> = Vec::new();
        for entry in &self.entries {
            if !entry.file.to_string_lossy().contains(needle.as_ref()) {
                continue;
            }
            if entry.normalized_file().file_name() != Some(base_name) {
                continue;
            }
            if !found.contains(&entry) {
                found.push(entry);
            }
        }
        found
    }

    /// All matching entries, relocated for a sandbox.
    pub fn extract(&self, target: &Path) -> Vec<CompilationEntry> {
        self.matching(target)
            .into_iter()
            .map(|entry| entry.relocated(target))
            .collect()
    }

    /// The single matching entry, relocated. Zero or several matches are errors.
    pub fn extract_single(&self, target: &Path) -> Result<CompilationEntry, CompDbError> {
        let mut matches = self.extract(target);
        match matches.len() {
            0 => Err(CompDbError::NoEntry(target.to_path_buf())),
            1 => Ok(matches.remove(0)),
            _ => Err(CompDbError::Ambiguous {
                file: target.to_path_buf(),
                candidates: matches.iter().map(|e| e.normalized_file()).collect(),
            }),
        }
    }

    pub fn write(entries: &[CompilationEntry], path: &Path) -> Result<(), CompDbError> {
        let raw: Vec<RawEntry> = entries.iter().map(RawEntry::from).collect();
        let json = serde_json::to_string_pretty(&raw).map_err(|e| CompDbError::Write {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(|e| CompDbError::Write {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// `location` itself if it names a file, otherwise `location/compile_commands.json`.
pub fn database_path(location: &Path) -> PathBuf {
    if location.is_file() {
        location.to_path_buf()
    } else {
        location.join(COMPILE_COMMANDS)
    }
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
