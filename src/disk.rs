//! Access to file timestamps and contents, behind a trait so the staleness
//! engine, cleaner, and logs can run against an in-memory filesystem in tests.

use anyhow::{anyhow, bail};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::time::UNIX_EPOCH;

/// File modification time, in nanoseconds since the epoch.
/// 0 means the file does not exist; comparisons are the only other meaningful
/// operations.  A real mtime of 0 is reported as 1 to keep the sentinel clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp(pub i64);

impl TimeStamp {
    pub const MISSING: TimeStamp = TimeStamp(0);

    pub fn exists(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The parent directory of a path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    let mut slash = path.rfind('/')?;
    while slash > 0 && path.as_bytes()[slash - 1] == b'/' {
        slash -= 1;
    }
    if slash == 0 {
        return None; // "/foo": the parent is the root, assume it's there.
    }
    Some(&path[..slash])
}

pub trait DiskInterface {
    /// stat() a path.  Missing files are `TimeStamp::MISSING`, not an error.
    fn stat(&self, path: &str) -> anyhow::Result<TimeStamp>;

    /// Read a file's contents.  NotFound is distinguishable via `io::ErrorKind`.
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;

    fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()>;

    fn make_dir(&self, path: &str) -> anyhow::Result<()>;

    /// Create a directory and any missing parents.  Succeeds if the path
    /// already exists as a directory.
    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        if self.stat(path)?.exists() {
            return Ok(());
        }
        if let Some(parent) = parent_dir(path) {
            self.make_dirs(parent)?;
        }
        self.make_dir(path)
    }

    /// Remove a file: Ok(true) if removed, Ok(false) if it did not exist.
    fn remove_file(&self, path: &str) -> anyhow::Result<bool>;

    /// Forget any cached stat for a path that was just written.
    fn invalidate(&self, _path: &str) {}
}

/// Disk access backed by the real filesystem, with an optional memoized stat
/// cache keyed by path.
pub struct RealDisk {
    stat_cache: Option<RefCell<HashMap<String, TimeStamp>>>,
}

impl RealDisk {
    pub fn new() -> Self {
        RealDisk { stat_cache: None }
    }

    pub fn with_stat_cache() -> Self {
        RealDisk {
            stat_cache: Some(RefCell::new(HashMap::new())),
        }
    }

    fn stat_uncached(&self, path: &str) -> anyhow::Result<TimeStamp> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(TimeStamp::MISSING);
            }
            #[cfg(unix)]
            Err(err) if err.raw_os_error() == Some(libc::ENOTDIR) => {
                return Ok(TimeStamp::MISSING);
            }
            Err(err) => return Err(anyhow!("stat({}): {}", path, err)),
        };
        let mtime = meta
            .modified()
            .map_err(|err| anyhow!("stat({}): {}", path, err))?;
        let nanos = match mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            Err(_) => 0, // Pre-epoch mtime; clamp.
        };
        // Some environments set mtime to 0, which would collide with our
        // "missing" sentinel.
        Ok(TimeStamp(if nanos == 0 { 1 } else { nanos }))
    }
}

impl Default for RealDisk {
    fn default() -> Self {
        RealDisk::new()
    }
}

impl DiskInterface for RealDisk {
    fn stat(&self, path: &str) -> anyhow::Result<TimeStamp> {
        if let Some(cache) = &self.stat_cache {
            if let Some(&mtime) = cache.borrow().get(path) {
                return Ok(mtime);
            }
            let mtime = self.stat_uncached(path)?;
            cache.borrow_mut().insert(path.to_owned(), mtime);
            return Ok(mtime);
        }
        self.stat_uncached(path)
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        std::fs::write(path, contents).map_err(|err| anyhow!("write({}): {}", path, err))
    }

    fn make_dir(&self, path: &str) -> anyhow::Result<()> {
        match std::fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(anyhow!("mkdir({}): {}", path, err)),
        }
    }

    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(path).map_err(|err| anyhow!("mkdir({}): {}", path, err))
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow!("remove({}): {}", path, err)),
        }
    }

    fn invalidate(&self, path: &str) {
        if let Some(cache) = &self.stat_cache {
            cache.borrow_mut().remove(path);
        }
    }
}

#[derive(Default, Clone)]
struct VirtualFile {
    mtime: TimeStamp,
    contents: Vec<u8>,
    stat_error: Option<String>,
}

/// An in-memory filesystem with a manually advanced clock, for tests.
/// Records the reads, removals, and directory creations performed on it.
#[derive(Default)]
pub struct VirtualDisk {
    now: Cell<i64>,
    files: RefCell<HashMap<String, VirtualFile>>,
    pub dirs_made: RefCell<Vec<String>>,
    pub files_read: RefCell<Vec<String>>,
    pub files_removed: RefCell<HashSet<String>>,
}

impl VirtualDisk {
    pub fn new() -> Self {
        let disk = VirtualDisk::default();
        disk.now.set(1);
        disk
    }

    /// Advance the clock, so subsequent writes get fresh mtimes.
    pub fn tick(&self) -> i64 {
        self.now.set(self.now.get() + 1);
        self.now.get()
    }

    pub fn create(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.borrow_mut().insert(
            path.to_owned(),
            VirtualFile {
                mtime: TimeStamp(self.now.get()),
                contents: contents.into(),
                stat_error: None,
            },
        );
    }

    pub fn create_at(&self, path: &str, mtime: i64) {
        self.files.borrow_mut().insert(
            path.to_owned(),
            VirtualFile {
                mtime: TimeStamp(mtime),
                contents: Vec::new(),
                stat_error: None,
            },
        );
    }

    /// Make stat of a path fail, for error-path tests.
    pub fn set_stat_error(&self, path: &str, message: &str) {
        let mut files = self.files.borrow_mut();
        let file = files.entry(path.to_owned()).or_default();
        file.stat_error = Some(message.to_owned());
    }

    pub fn mtime(&self, path: &str) -> TimeStamp {
        self.files
            .borrow()
            .get(path)
            .map(|f| f.mtime)
            .unwrap_or(TimeStamp::MISSING)
    }
}

impl DiskInterface for VirtualDisk {
    fn stat(&self, path: &str) -> anyhow::Result<TimeStamp> {
        match self.files.borrow().get(path) {
            Some(file) => {
                if let Some(err) = &file.stat_error {
                    bail!("stat({}): {}", path, err);
                }
                Ok(file.mtime)
            }
            None => Ok(TimeStamp::MISSING),
        }
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        self.files_read.borrow_mut().push(path.to_owned());
        match self.files.borrow().get(path) {
            Some(file) => Ok(file.contents.clone()),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        self.create(path, contents);
        Ok(())
    }

    fn make_dir(&self, path: &str) -> anyhow::Result<()> {
        self.dirs_made.borrow_mut().push(path.to_owned());
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        if self.dirs_made.borrow().iter().any(|d| d == path) {
            bail!("remove({}): is a directory", path);
        }
        if self.files.borrow_mut().remove(path).is_some() {
            self.files_removed.borrow_mut().insert(path.to_owned());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
