//! Filesystem capability surface and the built-in backends.
//!
//! The engine only ever talks to [`Fs`], a small capability set over URI
//! paths: existence, listing, reads, writes, deletes and renames. Two
//! backends are built in:
//!
//! - [`LocalFs`] for plain paths and `file://` URIs,
//! - [`MemoryFs`] for `memory://` URIs, a process-wide in-memory tree.
//!
//! `MemoryFs` reports `atomic_rename() == false`, which makes it double
//! as the stand-in for remote object stores in tests: the journal takes
//! the non-atomic replacement path on it.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::fsutil::path::{normalize_path, split_parent};

/// How a write treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace any existing content
    Overwrite,
    /// Fail with `AlreadyExists` if the path exists; the check and the
    /// create are a single atomic step
    CreateNew,
    /// Append to existing content, creating the file if needed
    Append,
}

/// Uniform filesystem capability set consumed by the engine.
pub trait Fs: Send + Sync {
    /// Protocol identifier, e.g. `"file"` or `"memory"`
    fn protocol(&self) -> &'static str;

    /// Whether `rename` is a single atomic operation on this backend.
    /// Object-store style backends return `false`.
    fn atomic_rename(&self) -> bool;

    fn exists(&self, path: &str) -> Result<bool>;

    fn is_dir(&self, path: &str) -> Result<bool>;

    /// List the child names of a directory, sorted.
    fn list(&self, path: &str) -> Result<Vec<String>>;

    fn read(&self, path: &str) -> Result<Vec<u8>>;

    fn write(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()>;

    /// Create a directory. Parents are created as needed.
    fn mkdir(&self, path: &str) -> Result<()>;

    fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    /// Move a file. On backends without atomic renames this is a
    /// copy-then-delete.
    fn rename(&self, src: &str, dst: &str) -> Result<()>;
}

/// Resolve a URI and its storage options into a backend and an
/// fs-internal path.
///
/// Plain paths and `file://` URIs map to [`LocalFs`]; `memory://` maps
/// to [`MemoryFs`]. Any other protocol is a configuration error: real
/// remote backends plug in behind the same trait but are not part of
/// this crate.
pub fn resolve_fs(
    uri: &str,
    storage_options: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Result<(Arc<dyn Fs>, String)> {
    let (protocol, path) = crate::fsutil::path::split_protocol(uri);
    match protocol {
        None | Some("file") => Ok((Arc::new(LocalFs), path.to_string())),
        Some("memory") => {
            let path = normalize_path(path);
            let path = if path.starts_with('/') {
                path
            } else {
                format!("/{path}")
            };
            Ok((Arc::new(MemoryFs), path))
        }
        Some(other) => {
            // Storage options are only meaningful for remote protocols;
            // report them so the user sees why the URI was rejected.
            let _ = storage_options;
            Err(Error::config(format!(
                "unsupported URI protocol {other:?} in {uri:?}"
            )))
        }
    }
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Backend over the local filesystem via `std::fs`.
pub struct LocalFs;

impl Fs for LocalFs {
    fn protocol(&self) -> &'static str {
        "file"
    }

    fn atomic_rename(&self) -> bool {
        true
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(std::path::Path::new(path).exists())
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(std::path::Path::new(path).is_dir())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(path).map_err(|e| Error::io("list", path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("list", path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| Error::io("read", path, e))
    }

    fn write(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io("write", path, e))?;
            }
        }
        let mut options = std::fs::OpenOptions::new();
        options.write(true);
        match mode {
            WriteMode::Overwrite => options.create(true).truncate(true),
            WriteMode::CreateNew => options.create_new(true),
            WriteMode::Append => options.create(true).append(true),
        };
        let mut file = options.open(path).map_err(|e| Error::io("write", path, e))?;
        file.write_all(data).map_err(|e| Error::io("write", path, e))?;
        file.sync_all().map_err(|e| Error::io("write", path, e))?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| Error::io("mkdir", path, e))
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let p = std::path::Path::new(path);
        let result = if p.is_dir() {
            if recursive {
                std::fs::remove_dir_all(p)
            } else {
                std::fs::remove_dir(p)
            }
        } else {
            std::fs::remove_file(p)
        };
        result.map_err(|e| Error::io("delete", path, e))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        std::fs::rename(src, dst).map_err(|e| Error::io("rename", src, e))
    }
}

// ============================================================================
// In-memory filesystem
// ============================================================================

#[derive(Debug, Clone)]
enum MemEntry {
    File(Vec<u8>),
    Dir,
}

fn memory_tree() -> &'static Mutex<BTreeMap<String, MemEntry>> {
    static TREE: OnceLock<Mutex<BTreeMap<String, MemEntry>>> = OnceLock::new();
    TREE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such entry: {path}"))
}

/// Process-wide in-memory backend behind `memory://` URIs.
///
/// All instances share one tree, so separate `FileObj` values resolving
/// the same URI see the same content. Tests isolate themselves by using
/// unique path prefixes.
pub struct MemoryFs;

impl MemoryFs {
    fn child_prefix(path: &str) -> String {
        format!("{}/", path.trim_end_matches('/'))
    }
}

impl Fs for MemoryFs {
    fn protocol(&self) -> &'static str {
        "memory"
    }

    fn atomic_rename(&self) -> bool {
        false
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let tree = memory_tree().lock().unwrap();
        if tree.contains_key(path) {
            return Ok(true);
        }
        let prefix = Self::child_prefix(path);
        Ok(tree.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix)))
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        let tree = memory_tree().lock().unwrap();
        match tree.get(path) {
            Some(MemEntry::Dir) => Ok(true),
            Some(MemEntry::File(_)) => Ok(false),
            None => {
                let prefix = Self::child_prefix(path);
                Ok(tree
                    .range(prefix.clone()..)
                    .next()
                    .is_some_and(|(k, _)| k.starts_with(&prefix)))
            }
        }
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let tree = memory_tree().lock().unwrap();
        let prefix = Self::child_prefix(path);
        let mut names: Vec<String> = Vec::new();
        for key in tree.keys() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let name = rest.split('/').next().unwrap_or(rest);
                if !name.is_empty() && names.last().map(String::as_str) != Some(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.dedup();
        Ok(names)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let tree = memory_tree().lock().unwrap();
        match tree.get(path) {
            Some(MemEntry::File(data)) => Ok(data.clone()),
            _ => Err(Error::io("read", path, not_found(path))),
        }
    }

    fn write(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
        let mut tree = memory_tree().lock().unwrap();
        match mode {
            WriteMode::Overwrite => {
                tree.insert(path.to_string(), MemEntry::File(data.to_vec()));
            }
            WriteMode::CreateNew => {
                if tree.contains_key(path) {
                    return Err(Error::io(
                        "write",
                        path,
                        io::Error::new(io::ErrorKind::AlreadyExists, "entry exists"),
                    ));
                }
                tree.insert(path.to_string(), MemEntry::File(data.to_vec()));
            }
            WriteMode::Append => match tree.get_mut(path) {
                Some(MemEntry::File(existing)) => existing.extend_from_slice(data),
                Some(MemEntry::Dir) => {
                    return Err(Error::io(
                        "write",
                        path,
                        io::Error::new(io::ErrorKind::InvalidInput, "is a directory"),
                    ))
                }
                None => {
                    tree.insert(path.to_string(), MemEntry::File(data.to_vec()));
                }
            },
        }
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let mut tree = memory_tree().lock().unwrap();
        tree.entry(path.to_string()).or_insert(MemEntry::Dir);
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let mut tree = memory_tree().lock().unwrap();
        let prefix = Self::child_prefix(path);
        let has_children = tree
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix));
        if !tree.contains_key(path) && !has_children {
            return Err(Error::io("delete", path, not_found(path)));
        }
        if has_children && !recursive {
            return Err(Error::io(
                "delete",
                path,
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, "directory not empty"),
            ));
        }
        tree.remove(path);
        if recursive {
            let keys: Vec<String> = tree
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                tree.remove(&key);
            }
        }
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        // Copy-then-delete; deliberately not atomic.
        let data = self.read(src)?;
        self.write(dst, &data, WriteMode::Overwrite)?;
        self.delete(src, false)
    }
}

// ============================================================================
// Dry-run wrapper
// ============================================================================

/// Wrapper that logs mutations instead of performing them.
///
/// Reads pass through to the wrapped backend so a dry run can still
/// inspect existing state.
pub struct DryRunFs {
    inner: Arc<dyn Fs>,
}

impl DryRunFs {
    pub fn new(inner: Arc<dyn Fs>) -> Self {
        Self { inner }
    }
}

impl Fs for DryRunFs {
    fn protocol(&self) -> &'static str {
        self.inner.protocol()
    }

    fn atomic_rename(&self) -> bool {
        self.inner.atomic_rename()
    }

    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path)
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        self.inner.is_dir(path)
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        self.inner.list(path)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, data: &[u8], _mode: WriteMode) -> Result<()> {
        tracing::info!("Dry run: would write {} bytes to {}", data.len(), path);
        Ok(())
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        tracing::info!("Dry run: would create directory {}", path);
        Ok(())
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        tracing::info!("Dry run: would delete {} (recursive={})", path, recursive);
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        tracing::info!("Dry run: would move {} to {}", src, dst);
        Ok(())
    }
}

/// Sibling path in the same parent directory, used for the lock file.
pub fn sibling_path(path: &str, suffix: &str) -> String {
    let (parent, name) = split_parent(path);
    let name = format!("{name}{suffix}");
    if parent.is_empty() {
        name
    } else if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
