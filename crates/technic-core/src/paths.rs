use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TECHNIC_DIR: &str = ".technic";
pub const CONFIG_FILE: &str = ".technic/config.yaml";
pub const DB_FILE: &str = ".technic/requests.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn technic_dir(root: &Path) -> PathBuf {
    root.join(TECHNIC_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let root = Path::new("/srv/technic");
        assert_eq!(technic_dir(root), PathBuf::from("/srv/technic/.technic"));
        assert_eq!(
            config_path(root),
            PathBuf::from("/srv/technic/.technic/config.yaml")
        );
        assert_eq!(
            db_path(root),
            PathBuf::from("/srv/technic/.technic/requests.db")
        );
    }
}
