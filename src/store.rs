use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::stub::StubRecord;

#[derive(Debug)]
pub enum StubStoreError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize(serde_json::Error),
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StubStoreError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Parse { .. } => "parse",
            Self::Serialize(_) => "serialize",
            Self::Write { .. } => "write",
        }
    }
}

impl std::fmt::Display for StubStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, .. } => write!(f, "read stub file {}", path.display()),
            Self::Parse { path, .. } => write!(f, "parse stub file {}", path.display()),
            Self::Serialize(_) => write!(f, "serialize stubs"),
            Self::Write { path, .. } => write!(f, "write stub file {}", path.display()),
        }
    }
}

impl std::error::Error for StubStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => Some(source),
            Self::Parse { source, .. } | Self::Serialize(source) => Some(source),
        }
    }
}

/// Reads the stub collection at `path`. A missing file is an empty collection.
pub fn load_stubs(path: &Path) -> Result<Vec<StubRecord>, StubStoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        // A path below a regular file cannot exist either.
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(StubStoreError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    parse_stubs(&text).map_err(|source| StubStoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses stub file contents.
///
/// Empty text and falsy JSON (`null`, `false`, `0`, `""`) are empty collections. A single
/// object is accepted as a one-element collection, which is how older stub files were written.
pub fn parse_stubs(text: &str) -> Result<Vec<StubRecord>, serde_json::Error> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(text)?;
    if is_falsy(&value) {
        return Ok(Vec::new());
    }
    match value {
        Value::Array(_) => serde_json::from_value(value),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Two-space indented JSON array.
pub fn render_stubs(stubs: &[StubRecord]) -> Result<String, StubStoreError> {
    serde_json::to_string_pretty(stubs).map_err(StubStoreError::Serialize)
}

/// Replaces the file at `path` with `stubs`. A reader never sees a partially written file.
pub fn write_stubs(path: &Path, stubs: &[StubRecord]) -> Result<(), StubStoreError> {
    let contents = render_stubs(stubs)?;
    let write_err = |source: std::io::Error| StubStoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    if let Some(permissions) = target_permissions(path)? {
        tmp.as_file().set_permissions(permissions).map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|err| write_err(err.error))?;

    Ok(())
}

/// Permissions the rewritten file should carry: the existing file's, or `0644` for a new one.
fn target_permissions(path: &Path) -> Result<Option<fs::Permissions>, StubStoreError> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.permissions())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(new_file_permissions()),
        Err(source) => Err(StubStoreError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(unix)]
fn new_file_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt as _;

    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_file_permissions() -> Option<fs::Permissions> {
    None
}

/// Per-path locks that serialize load/merge/write cycles against the same stub file.
#[derive(Debug, Default, Clone)]
pub struct StoreLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl StoreLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let key = lock_key(path);
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key).or_default())
    }
}

fn lock_key(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
