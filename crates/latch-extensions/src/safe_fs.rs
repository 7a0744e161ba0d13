//! Symlink- and size-safe filesystem access for extension roots and config files.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::diagnostics::DiagnosticLog;

/// Upper bound for extension sources and JSON configuration files.
pub const MAX_EXTENSION_FILE_BYTES: u64 = 1024 * 1024;
pub const EXTENSION_SCRIPT_EXTENSIONS: [&str; 3] = ["js", "mjs", "cjs"];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `ExtensionScope` values.
pub enum ExtensionScope {
    Global,
    Project,
}

impl ExtensionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A scanned extension candidate that passed the filesystem checks.
pub struct ExtensionFile {
    pub path: PathBuf,
    pub name: String,
    pub scope: ExtensionScope,
}

impl ExtensionFile {
    /// Lower-cased name used for trust policy lookups.
    pub fn policy_key(&self) -> String {
        self.name.to_ascii_lowercase()
    }
}

#[derive(Debug, Error)]
pub enum SafeReadError {
    #[error("refusing to read symlinked file")]
    Symlink,
    #[error("not a regular file")]
    NotRegularFile,
    #[error("file is {size} bytes which exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanRejection {
    #[error("extension directory is a symlink; skipping it")]
    SymlinkedDirectory,
    #[error("extension directory path is not a directory; skipping it")]
    NotADirectory,
    #[error("extension file is a symlink")]
    SymlinkedFile,
    #[error("extension file name must not start with '.'")]
    HiddenFile,
    #[error("extension name '{0}' must contain only letters, digits, '-' or '_'")]
    InvalidName(String),
    #[error("extension file is {size} bytes which exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("failed to inspect extension file: {0}")]
    Unreadable(String),
}

pub fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '-' || character == '_')
}

pub fn has_script_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| EXTENSION_SCRIPT_EXTENSIONS.contains(&extension))
}

/// Reads a JSON document that must be a plain regular file no larger than
/// [`MAX_EXTENSION_FILE_BYTES`]. A missing file is `Ok(None)`.
pub fn read_json_file_safely(path: &Path) -> Result<Option<Value>, SafeReadError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    if metadata.file_type().is_symlink() {
        return Err(SafeReadError::Symlink);
    }
    if !metadata.is_file() {
        return Err(SafeReadError::NotRegularFile);
    }
    if metadata.len() > MAX_EXTENSION_FILE_BYTES {
        return Err(SafeReadError::TooLarge {
            size: metadata.len(),
            limit: MAX_EXTENSION_FILE_BYTES,
        });
    }
    let mut raw = Vec::new();
    fs::File::open(path)?
        .take(MAX_EXTENSION_FILE_BYTES + 1)
        .read_to_end(&mut raw)?;
    if raw.len() as u64 > MAX_EXTENSION_FILE_BYTES {
        return Err(SafeReadError::TooLarge {
            size: raw.len() as u64,
            limit: MAX_EXTENSION_FILE_BYTES,
        });
    }
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Checks every directory from `anchor` (exclusive) down to `dir` (inclusive).
/// `Ok(false)` means the directory does not exist.
fn check_directory_chain(anchor: &Path, dir: &Path) -> Result<bool, (PathBuf, ScanRejection)> {
    let relative = dir.strip_prefix(anchor).unwrap_or(dir);
    let mut current = if relative == dir {
        PathBuf::new()
    } else {
        anchor.to_path_buf()
    };
    for component in relative.components() {
        current.push(component);
        let metadata = match fs::symlink_metadata(&current) {
            Ok(metadata) => metadata,
            Err(_) => return Ok(false),
        };
        if metadata.file_type().is_symlink() {
            return Err((current, ScanRejection::SymlinkedDirectory));
        }
        if !metadata.is_dir() {
            return Err((current, ScanRejection::NotADirectory));
        }
    }
    Ok(true)
}

/// True when `dir` exists and no directory between `anchor` and `dir` is a
/// symlink or a non-directory. Per-scope trust and override files are only
/// read from such directories.
pub fn is_safe_extension_dir(anchor: &Path, dir: &Path) -> bool {
    matches!(check_directory_chain(anchor, dir), Ok(true))
}

/// Enumerates `*.{js,mjs,cjs}` candidates directly inside `dir`.
///
/// Every rejected entry is recorded in `log`; the scan never aborts early.
pub fn scan_extension_dir(
    anchor: &Path,
    dir: &Path,
    scope: ExtensionScope,
    log: &mut DiagnosticLog,
) -> Vec<ExtensionFile> {
    match check_directory_chain(anchor, dir) {
        Ok(true) => {}
        Ok(false) => return Vec::new(),
        Err((path, rejection)) => {
            log.record(path.display().to_string(), rejection.to_string());
            return Vec::new();
        }
    }

    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(error) => {
            log.record(
                dir.display().to_string(),
                format!("failed to read extension directory: {error}"),
            );
            return Vec::new();
        }
    };

    let mut candidates = Vec::new();
    for entry in read_dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                log.record(
                    dir.display().to_string(),
                    format!("failed to inspect extension directory entry: {error}"),
                );
                continue;
            }
        };
        let path = entry.path();
        if !has_script_extension(&path) {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(error) => {
                log.record(
                    path.display().to_string(),
                    format!("failed to inspect extension file: {error}"),
                );
                continue;
            }
        };
        if file_type.is_symlink() {
            log.record(
                path.display().to_string(),
                ScanRejection::SymlinkedFile.to_string(),
            );
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        candidates.push(path);
    }
    candidates.sort();

    let mut files = Vec::new();
    for path in candidates {
        match validate_candidate(&path) {
            Ok(name) => files.push(ExtensionFile { path, name, scope }),
            Err(rejection) => log.record(path.display().to_string(), rejection.to_string()),
        }
    }
    files
}

fn validate_candidate(path: &Path) -> Result<String, ScanRejection> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    if file_name.starts_with('.') {
        return Err(ScanRejection::HiddenFile);
    }
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    if !is_valid_extension_name(&name) {
        return Err(ScanRejection::InvalidName(name));
    }
    let size = fs::symlink_metadata(path)
        .map(|metadata| metadata.len())
        .map_err(|error| ScanRejection::Unreadable(error.to_string()))?;
    if size > MAX_EXTENSION_FILE_BYTES {
        return Err(ScanRejection::TooLarge {
            size,
            limit: MAX_EXTENSION_FILE_BYTES,
        });
    }
    Ok(name)
}
