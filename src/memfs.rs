//! In-memory filesystem backend.
//!
//! Keeps the whole tree in a path-keyed map with no size limits, which
//! makes it suitable for tests and demos rather than real storage. The
//! map is guarded by one filesystem mutex; each file guards its own
//! mutable state.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::info;

use crate::davpath;
use crate::error::DavError;
use crate::fs::{CopyOptions, FileInfo, FileSystem, FsFile, FsHandle, FsPath};

type FileMap = HashMap<String, Arc<MemFile>>;

/// 内存文件系统：以路径为键的单一树。
pub struct MemFs {
    files: Arc<Mutex<FileMap>>,
}

impl MemFs {
    pub fn new() -> Self {
        let mut files = FileMap::new();
        files.insert("/".to_string(), Arc::new(MemFile::new("/", true)));
        Self {
            files: Arc::new(Mutex::new(files)),
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_files(files: &Mutex<FileMap>) -> MutexGuard<'_, FileMap> {
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FileSystem for MemFs {
    fn for_path(&self, path: &str) -> Result<Box<dyn FsPath>, DavError> {
        if !path.starts_with('/') {
            return Err(DavError::BAD_PATH.with_cause(format!("not absolute: {path}")));
        }
        Ok(Box::new(MemPath {
            files: self.files.clone(),
            path: davpath::clean(path),
        }))
    }

    fn dump(&self) {
        let files = lock_files(&self.files);
        let mut names: Vec<&String> = files.keys().collect();
        names.sort();
        info!(count = names.len(), "memfs dump");
        for name in names {
            info!("{name}");
        }
    }
}

struct MemPath {
    files: Arc<Mutex<FileMap>>,
    path: String,
}

impl MemPath {
    fn lookup_in<'f>(files: &'f FileMap, path: &str) -> Result<&'f Arc<MemFile>, DavError> {
        files.get(path).ok_or(DavError::NOT_FOUND)
    }

    fn remove_subtree(files: &mut FileMap, subtree: &str) {
        files.retain(|path, _| !davpath::in_tree(path, subtree));
    }
}

impl FsPath for MemPath {
    fn as_str(&self) -> &str {
        &self.path
    }

    fn parent(&self) -> Box<dyn FsPath> {
        Box::new(MemPath {
            files: self.files.clone(),
            path: davpath::parent(&self.path),
        })
    }

    fn lookup(&self) -> Result<Box<dyn FsFile>, DavError> {
        let files = lock_files(&self.files);
        Ok(Box::new(Self::lookup_in(&files, &self.path)?.clone()))
    }

    fn lookup_subtree(&self, depth: i32) -> Result<Vec<Box<dyn FsFile>>, DavError> {
        let files = lock_files(&self.files);
        Self::lookup_in(&files, &self.path)?;
        let mut found: Vec<(String, Arc<MemFile>)> = files
            .iter()
            .filter(|(path, _)| davpath::included(path, &self.path, depth).is_some())
            .map(|(path, file)| (path.clone(), file.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found
            .into_iter()
            .map(|(_, file)| Box::new(file) as Box<dyn FsFile>)
            .collect())
    }

    fn mkdir(&self) -> Result<Box<dyn FsFile>, DavError> {
        let mut files = lock_files(&self.files);
        if files.contains_key(&self.path) {
            return Err(DavError::CONFLICT);
        }
        if !files.contains_key(&davpath::parent(&self.path)) {
            return Err(DavError::MISSING_PARENT);
        }
        let file = Arc::new(MemFile::new(&self.path, true));
        files.insert(self.path.clone(), file.clone());
        Ok(Box::new(file))
    }

    fn create(&self) -> Result<(Box<dyn FsFile>, Box<dyn FsHandle>), DavError> {
        let mut files = lock_files(&self.files);
        if files.contains_key(&self.path) {
            return Err(DavError::CONFLICT);
        }
        if !files.contains_key(&davpath::parent(&self.path)) {
            return Err(DavError::MISSING_PARENT);
        }
        let file = Arc::new(MemFile::new(&self.path, false));
        files.insert(self.path.clone(), file.clone());
        let handle = file.open()?;
        Ok((Box::new(file), handle))
    }

    fn copy_to(&self, dst: &dyn FsPath, options: CopyOptions) -> Result<bool, DavError> {
        let Some(dst) = dst.as_any().downcast_ref::<MemPath>() else {
            return Err(DavError::BAD_HOST.with_cause("destination on a different filesystem"));
        };
        if self.path == dst.path {
            return Err(DavError::SAME_FILE);
        }

        let mut files = lock_files(&self.files);
        let source = Self::lookup_in(&files, &self.path)?.clone();

        // Directories only move as complete trees.
        if source.is_directory() && options.move_source && options.depth >= 0 {
            return Err(DavError::IS_DIR);
        }
        if !files.contains_key(&davpath::parent(&dst.path)) {
            return Err(DavError::MISSING_PARENT);
        }

        let mut created_new = true;
        if files.contains_key(&dst.path) {
            if !options.overwrite {
                return Err(DavError::DEST_EXISTS);
            }
            created_new = false;
            Self::remove_subtree(&mut files, &dst.path);
        }

        let members: Vec<(String, String, Arc<MemFile>)> = files
            .iter()
            .filter_map(|(path, file)| {
                davpath::included(path, &self.path, options.depth)
                    .map(|rel| (path.clone(), davpath::join(&dst.path, &rel), file.clone()))
            })
            .collect();
        for (orig, target, file) in members {
            if options.move_source {
                file.set_path(&target);
                files.remove(&orig);
                files.insert(target, file);
            } else {
                files.insert(target.clone(), Arc::new(file.clone_at(&target)));
            }
        }
        Ok(created_new)
    }

    fn remove(&self) -> Result<(), DavError> {
        let mut files = lock_files(&self.files);
        let file = Self::lookup_in(&files, &self.path)?;
        if file.is_directory() {
            return Err(DavError::IS_DIR);
        }
        files.remove(&self.path);
        Ok(())
    }

    fn recursive_remove(&self) -> HashMap<String, DavError> {
        let mut files = lock_files(&self.files);
        let mut errors = HashMap::new();
        match Self::lookup_in(&files, &self.path) {
            Err(err) => {
                errors.insert(self.path.clone(), err);
            }
            Ok(file) if !file.is_directory() => {
                errors.insert(self.path.clone(), DavError::IS_NOT_DIR);
            }
            Ok(_) => Self::remove_subtree(&mut files, &self.path),
        }
        errors
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A single file or directory; directories carry no content.
pub struct MemFile {
    dir: bool,
    state: Mutex<MemFileState>,
}

struct MemFileState {
    path: String,
    data: Vec<u8>,
    props: HashMap<String, String>,
    created: SystemTime,
    modified: SystemTime,
}

impl MemFileState {
    /// Bumps the modification time, strictly, so entity tags of
    /// back-to-back writes never collide.
    fn touch(&mut self) {
        let now = SystemTime::now();
        self.modified = if now > self.modified {
            now
        } else {
            self.modified + Duration::from_nanos(1)
        };
    }
}

impl MemFile {
    fn new(path: &str, dir: bool) -> Self {
        let now = SystemTime::now();
        Self {
            dir,
            state: Mutex::new(MemFileState {
                path: path.to_string(),
                data: Vec::new(),
                props: HashMap::new(),
                created: now,
                modified: now,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MemFileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_path(&self, path: &str) {
        self.lock_state().path = path.to_string();
    }

    fn clone_at(&self, path: &str) -> MemFile {
        let state = self.lock_state();
        let now = SystemTime::now();
        MemFile {
            dir: self.dir,
            state: Mutex::new(MemFileState {
                path: path.to_string(),
                data: state.data.clone(),
                props: state.props.clone(),
                created: now,
                modified: now,
            }),
        }
    }
}

impl FsFile for Arc<MemFile> {
    fn path(&self) -> String {
        self.lock_state().path.clone()
    }

    fn is_directory(&self) -> bool {
        self.dir
    }

    fn stat(&self) -> Result<FileInfo, DavError> {
        let state = self.lock_state();
        Ok(FileInfo {
            created: state.created,
            last_modified: state.modified,
            size: state.data.len() as u64,
        })
    }

    fn open(&self) -> Result<Box<dyn FsHandle>, DavError> {
        if self.dir {
            return Err(DavError::IS_DIR);
        }
        Ok(Box::new(MemHandle {
            file: self.clone(),
            pos: 0,
        }))
    }

    fn truncate(&self) -> Result<Box<dyn FsHandle>, DavError> {
        if self.dir {
            return Err(DavError::IS_DIR);
        }
        let mut state = self.lock_state();
        state.data.clear();
        state.touch();
        drop(state);
        Ok(Box::new(MemHandle {
            file: self.clone(),
            pos: 0,
        }))
    }

    fn patch_prop(
        &self,
        set: &HashMap<String, String>,
        remove: &HashMap<String, String>,
    ) -> Result<(), DavError> {
        let mut state = self.lock_state();
        for (name, value) in set {
            state.props.insert(name.clone(), value.clone());
        }
        for name in remove.keys() {
            state.props.remove(name);
        }
        Ok(())
    }

    fn get_prop(&self, name: &str) -> Option<String> {
        self.lock_state().props.get(name).cloned()
    }

    fn prop_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_state().props.keys().cloned().collect();
        names.sort();
        names
    }
}

struct MemHandle {
    file: Arc<MemFile>,
    pos: u64,
}

impl Read for MemHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.file.lock_state();
        let start = self.pos as usize;
        if start >= state.data.len() {
            return Ok(0);
        }
        let end = (start + buf.len()).min(state.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&state.data[start..end]);
        self.pos = end as u64;
        Ok(n)
    }
}

impl Write for MemHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.file.lock_state();
        let start = self.pos as usize;
        let end = start + buf.len();
        if end > state.data.len() {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(buf);
        state.touch();
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.file.lock_state().data.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => len + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                DavError::UNDERRUN,
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etag::file_etag;

    fn fs() -> MemFs {
        MemFs::new()
    }

    fn write_file(fs: &MemFs, path: &str, content: &[u8]) {
        let (_, mut handle) = fs.for_path(path).unwrap().create().unwrap();
        handle.write_all(content).unwrap();
    }

    fn read_file(fs: &MemFs, path: &str) -> Vec<u8> {
        let file = fs.for_path(path).unwrap().lookup().unwrap();
        let mut handle = file.open().unwrap();
        let mut data = Vec::new();
        handle.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(fs().for_path("relative").is_err());
        assert!(fs().for_path("").is_err());
    }

    #[test]
    fn create_requires_parent_and_free_slot() {
        let fs = fs();
        write_file(&fs, "/f", b"data");
        assert_eq!(
            fs.for_path("/f").unwrap().create().unwrap_err().kind(),
            crate::error::DavErrorKind::Conflict
        );
        assert_eq!(
            fs.for_path("/missing/child")
                .unwrap()
                .create()
                .unwrap_err()
                .kind(),
            crate::error::DavErrorKind::MissingParent
        );
        assert_eq!(read_file(&fs, "/f"), b"data");
    }

    #[test]
    fn remove_distinguishes_files_and_directories() {
        let fs = fs();
        write_file(&fs, "/f", b"x");
        fs.for_path("/d").unwrap().mkdir().unwrap();

        assert_eq!(
            fs.for_path("/d").unwrap().remove().unwrap_err().kind(),
            crate::error::DavErrorKind::IsDir
        );
        fs.for_path("/f").unwrap().remove().unwrap();
        assert!(fs.for_path("/f").unwrap().lookup().is_err());

        let errors = fs.for_path("/f").unwrap().recursive_remove();
        assert_eq!(errors.len(), 1);

        fs.for_path("/d/sub").unwrap().mkdir().unwrap();
        write_file(&fs, "/d/sub/f", b"y");
        let errors = fs.for_path("/d").unwrap().recursive_remove();
        assert!(errors.is_empty());
        assert!(fs.for_path("/d/sub/f").unwrap().lookup().is_err());
    }

    #[test]
    fn subtree_listing_respects_depth_and_order() {
        let fs = fs();
        fs.for_path("/d").unwrap().mkdir().unwrap();
        write_file(&fs, "/d/a", b"");
        fs.for_path("/d/b").unwrap().mkdir().unwrap();
        write_file(&fs, "/d/b/deep", b"");

        let paths = |depth| -> Vec<String> {
            fs.for_path("/d")
                .unwrap()
                .lookup_subtree(depth)
                .unwrap()
                .iter()
                .map(|f| f.path())
                .collect()
        };
        assert_eq!(paths(0), vec!["/d"]);
        assert_eq!(paths(1), vec!["/d", "/d/a", "/d/b"]);
        assert_eq!(paths(-1), vec!["/d", "/d/a", "/d/b", "/d/b/deep"]);
    }

    #[test]
    fn copy_keeps_source_and_content() {
        let fs = fs();
        fs.for_path("/src").unwrap().mkdir().unwrap();
        write_file(&fs, "/src/f", b"hello");

        let src = fs.for_path("/src").unwrap();
        let dst = fs.for_path("/dst").unwrap();
        let created = src
            .copy_to(
                dst.as_ref(),
                CopyOptions {
                    overwrite: true,
                    move_source: false,
                    depth: -1,
                },
            )
            .unwrap();
        assert!(created);
        assert_eq!(read_file(&fs, "/src/f"), b"hello");
        assert_eq!(read_file(&fs, "/dst/f"), b"hello");
    }

    #[test]
    fn move_removes_source() {
        let fs = fs();
        fs.for_path("/src").unwrap().mkdir().unwrap();
        write_file(&fs, "/src/f", b"hello");

        let src = fs.for_path("/src").unwrap();
        let dst = fs.for_path("/dst").unwrap();
        src.copy_to(
            dst.as_ref(),
            CopyOptions {
                overwrite: true,
                move_source: true,
                depth: -1,
            },
        )
        .unwrap();
        assert!(fs.for_path("/src").unwrap().lookup().is_err());
        assert_eq!(read_file(&fs, "/dst/f"), b"hello");
    }

    #[test]
    fn move_of_directory_requires_unbounded_depth() {
        let fs = fs();
        fs.for_path("/src").unwrap().mkdir().unwrap();
        let src = fs.for_path("/src").unwrap();
        let dst = fs.for_path("/dst").unwrap();
        let err = src
            .copy_to(
                dst.as_ref(),
                CopyOptions {
                    overwrite: true,
                    move_source: true,
                    depth: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::DavErrorKind::IsDir);
    }

    #[test]
    fn copy_respects_overwrite_and_identity() {
        let fs = fs();
        write_file(&fs, "/a", b"a");
        write_file(&fs, "/b", b"b");

        let src = fs.for_path("/a").unwrap();
        let no_overwrite = CopyOptions {
            overwrite: false,
            move_source: false,
            depth: -1,
        };
        let err = src
            .copy_to(fs.for_path("/b").unwrap().as_ref(), no_overwrite)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::DavErrorKind::DestExists);

        let err = src
            .copy_to(fs.for_path("/a").unwrap().as_ref(), no_overwrite)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::DavErrorKind::SameFile);

        let created = src
            .copy_to(
                fs.for_path("/b").unwrap().as_ref(),
                CopyOptions {
                    overwrite: true,
                    move_source: false,
                    depth: -1,
                },
            )
            .unwrap();
        assert!(!created);
        assert_eq!(read_file(&fs, "/b"), b"a");
    }

    #[test]
    fn writes_always_change_the_etag() {
        let fs = fs();
        write_file(&fs, "/f", b"one");
        let file = fs.for_path("/f").unwrap().lookup().unwrap();
        let before = file_etag(&file.stat().unwrap());

        let mut handle = file.truncate().unwrap();
        handle.write_all(b"one").unwrap();
        let after = file_etag(&file.stat().unwrap());
        assert_ne!(before, after);
        assert!(before.starts_with("3-"));
    }

    #[test]
    fn properties_patch_and_read_back() {
        let fs = fs();
        write_file(&fs, "/f", b"");
        let file = fs.for_path("/f").unwrap().lookup().unwrap();

        let set = HashMap::from([("urn:x:color".to_string(), "blue".to_string())]);
        file.patch_prop(&set, &HashMap::new()).unwrap();
        assert_eq!(file.get_prop("urn:x:color").as_deref(), Some("blue"));
        assert_eq!(file.prop_names(), vec!["urn:x:color"]);

        let remove = HashMap::from([("urn:x:color".to_string(), String::new())]);
        file.patch_prop(&HashMap::new(), &remove).unwrap();
        assert_eq!(file.get_prop("urn:x:color"), None);
    }

    #[test]
    fn handle_seek_and_partial_read() {
        let fs = fs();
        write_file(&fs, "/f", b"0123456789");
        let file = fs.for_path("/f").unwrap().lookup().unwrap();
        let mut handle = file.open().unwrap();
        handle.seek(SeekFrom::Start(4)).unwrap();
        let mut buf = [0u8; 3];
        handle.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"456");
        assert!(handle.seek(SeekFrom::Current(-100)).is_err());
    }
}
