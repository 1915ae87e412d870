use std::path::{Path, PathBuf};
use technic_core::paths;

/// Resolve the installation root.
///
/// Priority:
/// 1. `--root` flag / `TECHNIC_ROOT` env var (passed in as `explicit`)
/// 2. The nearest ancestor of `cwd` containing `.technic/`
/// 3. `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_installation(&cwd).unwrap_or(cwd)
}

fn find_installation(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| paths::technic_dir(dir).is_dir())
        .map(Path::to_path_buf)
}
