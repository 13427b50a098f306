pub use std::env::*;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Root of the persistent state directory, relative to the build root.
pub static DYNAMAKE_PERSISTENT_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    var_os("DYNAMAKE_PERSISTENT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".dynamake"))
});

pub static DYNAMAKE_JOBS: LazyLock<Option<i64>> =
    LazyLock::new(|| var("DYNAMAKE_JOBS").ok().and_then(|v| v.parse().ok()));
