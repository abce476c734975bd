//! `FileObj`: a URI bound to its filesystem backend.
//!
//! This is the handle the rest of the engine passes around. It keeps
//! the original URI (for messages and lock contents), the backend, and
//! the fs-internal path together, and offers the basic operations with
//! errors that carry operation and path context.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::fsutil::fs::{resolve_fs, sibling_path, DryRunFs, Fs, WriteMode};
use crate::fsutil::path::{join, split_parent};

/// A file or directory in some filesystem.
#[derive(Clone)]
pub struct FileObj {
    uri: String,
    path: String,
    fs: Arc<dyn Fs>,
}

impl fmt::Debug for FileObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObj").field("uri", &self.uri).finish()
    }
}

impl fmt::Display for FileObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl FileObj {
    /// Bind a URI to its backend.
    pub fn new(
        uri: impl Into<String>,
        storage_options: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Self> {
        let uri = uri.into();
        let (fs, path) = resolve_fs(&uri, storage_options)?;
        Ok(Self { uri, path, fs })
    }

    /// The URI this object was created from.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The path within the backend filesystem.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    /// The last path component.
    pub fn filename(&self) -> &str {
        split_parent(&self.path).1
    }

    /// Child object for a relative path.
    pub fn child(&self, rel: &str) -> Self {
        Self {
            uri: join(&self.uri, rel),
            path: join(&self.path, rel),
            fs: Arc::clone(&self.fs),
        }
    }

    /// Parent directory object.
    pub fn parent(&self) -> Result<Self> {
        let (parent_path, _) = split_parent(&self.path);
        if parent_path.is_empty() && self.path.is_empty() {
            return Err(Error::internal(format!(
                "cannot take parent of {:?}",
                self.uri
            )));
        }
        let (uri_parent, _) = split_parent(&self.uri);
        Ok(Self {
            uri: uri_parent.to_string(),
            path: parent_path.to_string(),
            fs: Arc::clone(&self.fs),
        })
    }

    /// Sibling object whose name is this object's name plus `suffix`.
    /// Well-defined even for paths with no parent segment.
    pub fn sibling_with_suffix(&self, suffix: &str) -> Self {
        Self {
            uri: sibling_path(&self.uri, suffix),
            path: sibling_path(&self.path, suffix),
            fs: Arc::clone(&self.fs),
        }
    }

    /// An object on the same filesystem at an absolute fs-internal
    /// path, as recorded in transaction journals.
    pub fn at_path(&self, path: &str) -> Self {
        let uri = match self.fs.protocol() {
            "file" => path.to_string(),
            protocol => format!("{}://{}", protocol, path.trim_start_matches('/')),
        };
        Self {
            uri,
            path: path.to_string(),
            fs: Arc::clone(&self.fs),
        }
    }

    /// Same location, with all mutations replaced by log lines.
    pub fn into_dry_run(self) -> Self {
        Self {
            uri: self.uri,
            path: self.path,
            fs: Arc::new(DryRunFs::new(self.fs)),
        }
    }

    // ------------------------------------------------------------------
    // Basic filesystem operations

    pub fn exists(&self) -> Result<bool> {
        self.fs.exists(&self.path)
    }

    pub fn is_dir(&self) -> Result<bool> {
        self.fs.is_dir(&self.path)
    }

    /// Child objects of this directory, sorted by name.
    pub fn list(&self) -> Result<Vec<FileObj>> {
        let names = self.fs.list(&self.path)?;
        Ok(names.iter().map(|n| self.child(n)).collect())
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        self.fs.read(&self.path)
    }

    pub fn read_to_string(&self) -> Result<String> {
        let data = self.read()?;
        String::from_utf8(data).map_err(|e| {
            Error::io(
                "read",
                &self.uri,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.read()?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::io(
                "read",
                &self.uri,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.fs.write(&self.path, data, WriteMode::Overwrite)
    }

    /// Create-if-absent write; fails with `AlreadyExists` atomically.
    pub fn write_new(&self, data: &[u8]) -> Result<()> {
        self.fs.write(&self.path, data, WriteMode::CreateNew)
    }

    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.fs.write(&self.path, data, WriteMode::Append)
    }

    pub fn write_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::internal(format!("cannot serialize to {}: {e}", self.uri)))?;
        self.write(&data)
    }

    pub fn mkdir(&self) -> Result<()> {
        self.fs.mkdir(&self.path)
    }

    pub fn delete(&self, recursive: bool) -> Result<()> {
        self.fs.delete(&self.path, recursive)
    }

    /// Delete if present; missing paths are not an error.
    pub fn delete_if_exists(&self, recursive: bool) -> Result<bool> {
        if self.exists()? {
            self.delete(recursive)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
