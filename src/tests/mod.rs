mod failures;
mod resources;

use std::path::Path;

use crate::{Build, BuildReport, ParamStore, Result, StepRegistry};

/// A throwaway build root; paths are relative to it, state lives in its
/// `.dynamake` directory.
pub(crate) struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, content: &str) {
        let path = self.root().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.root().join(path)).unwrap()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.root().join(path).exists()
    }

    /// Push a file's mtime forward so coarse filesystem timestamps cannot
    /// order it before files written just ahead of it.
    pub fn push_mtime(&self, path: &str, secs: u64) {
        let full = self.root().join(path);
        let base = std::fs::metadata(&full).unwrap().modified().unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&full).unwrap();
        file.set_modified(base + std::time::Duration::from_secs(secs))
            .unwrap();
    }

    /// Make `path` strictly newer than `reference` without relying on clock
    /// granularity.
    pub fn touch_after(&self, path: &str, reference: &str) {
        let base = std::fs::metadata(self.root().join(reference))
            .unwrap()
            .modified()
            .unwrap();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.root().join(path))
            .unwrap();
        file.set_modified(base + std::time::Duration::from_nanos(1))
            .unwrap();
    }

    pub fn run(
        &self,
        registry: &StepRegistry,
        store: &ParamStore,
        targets: &[&str],
    ) -> Result<BuildReport> {
        Build::new(registry.clone(), store.clone())?
            .with_root(self.root())
            .run(targets.iter().copied())
    }
}
