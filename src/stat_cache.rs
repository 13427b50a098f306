use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use dashmap::DashMap;

/// Cached filesystem facts for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mtime_ns: i128,
    pub is_dir: bool,
}

/// Lazy `exists`/mtime cache, invalidated explicitly around actions and
/// around the engine's own file modifications.
///
/// Phony targets are not files; their synthetic modification times live in a
/// separate overlay consulted before the filesystem.
#[derive(Debug)]
pub struct StatCache {
    root: PathBuf,
    entries: DashMap<String, Option<Stat>>,
    synthetic: DashMap<String, i128>,
}

impl StatCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: DashMap::new(),
            synthetic: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abs(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn read(&self, path: &str) -> Option<Stat> {
        let meta = fs::metadata(self.abs(path)).ok()?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i128)
            .unwrap_or(0);
        Some(Stat {
            mtime_ns,
            is_dir: meta.is_dir(),
        })
    }

    pub fn stat(&self, path: &str) -> Option<Stat> {
        if let Some(entry) = self.entries.get(path) {
            return *entry;
        }
        let stat = self.read(path);
        self.entries.insert(path.to_string(), stat);
        stat
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_some()
    }

    /// Modification time in nanoseconds, with synthetic (phony) times taking
    /// precedence over the filesystem.
    pub fn mtime_ns(&self, path: &str) -> Option<i128> {
        if let Some(synthetic) = self.synthetic.get(path) {
            return Some(*synthetic);
        }
        self.stat(path).map(|s| s.mtime_ns)
    }

    pub fn set_synthetic(&self, path: &str, mtime_ns: i128) {
        self.synthetic.insert(path.to_string(), mtime_ns);
    }

    pub fn invalidate(&self, path: &str) {
        self.entries.remove(path);
    }

    pub fn invalidate_all<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for path in paths {
            self.invalidate(path.as_ref());
        }
    }
}
