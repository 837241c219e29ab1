//! Abstract filesystem contract backing the WebDAV layer.
//!
//! Backends expose a single-root tree of files and directories addressed
//! by cleaned absolute paths. Operations are synchronous; backends must
//! serialize tree observations with tree mutations themselves.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::time::SystemTime;

use crate::error::DavError;

/// Options steering `FsPath::copy_to`.
#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub overwrite: bool,
    pub move_source: bool,
    pub depth: i32,
}

/// Metadata snapshot of a file or directory.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub created: SystemTime,
    pub last_modified: SystemTime,
    pub size: u64,
}

/// A filesystem that can resolve URL paths into tree handles.
pub trait FileSystem: Send + Sync {
    /// Resolves a URL path; fails with `BadPath` on malformed or
    /// non-absolute input.
    fn for_path(&self, path: &str) -> Result<Box<dyn FsPath>, DavError>;

    /// Diagnostic hook; backends log their current contents.
    fn dump(&self);
}

/// A unique path within a filesystem.
pub trait FsPath: Send + Sync {
    fn as_str(&self) -> &str;

    fn parent(&self) -> Box<dyn FsPath>;

    fn lookup(&self) -> Result<Box<dyn FsFile>, DavError>;

    /// All files included under this path at the given depth, the path
    /// itself first.
    fn lookup_subtree(&self, depth: i32) -> Result<Vec<Box<dyn FsFile>>, DavError>;

    /// Fails `Conflict` if the target exists, `MissingParent` if the
    /// parent directory is absent.
    fn mkdir(&self) -> Result<Box<dyn FsFile>, DavError>;

    /// Same failure modes as `mkdir`; returns the new file with an open
    /// handle for writing.
    fn create(&self) -> Result<(Box<dyn FsFile>, Box<dyn FsHandle>), DavError>;

    /// Copies or moves this subtree onto `dst`; reports whether the
    /// destination was newly created.
    fn copy_to(&self, dst: &dyn FsPath, options: CopyOptions) -> Result<bool, DavError>;

    /// Removes a non-directory file; directories report `IsDir`.
    fn remove(&self) -> Result<(), DavError>;

    /// Removes a directory tree, collecting per-path failures.
    fn recursive_remove(&self) -> HashMap<String, DavError>;

    /// Downcast seam for backend-private cross-path operations.
    fn as_any(&self) -> &dyn Any;
}

/// A file or directory in the tree.
pub trait FsFile: Send + Sync {
    fn path(&self) -> String;

    fn is_directory(&self) -> bool;

    fn stat(&self) -> Result<FileInfo, DavError>;

    fn open(&self) -> Result<Box<dyn FsHandle>, DavError>;

    /// Drops existing content and returns a handle positioned at the
    /// start.
    fn truncate(&self) -> Result<Box<dyn FsHandle>, DavError>;

    /// Applies property sets and removes atomically.
    fn patch_prop(
        &self,
        set: &HashMap<String, String>,
        remove: &HashMap<String, String>,
    ) -> Result<(), DavError>;

    fn get_prop(&self, name: &str) -> Option<String>;

    /// Names of all user properties, for `allprop` and `propname`.
    fn prop_names(&self) -> Vec<String>;
}

/// An open reference to a file for reading or writing.
pub trait FsHandle: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> FsHandle for T {}

impl fmt::Debug for dyn FsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsFile").field("path", &self.path()).finish()
    }
}

impl fmt::Debug for dyn FsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FsHandle")
    }
}
