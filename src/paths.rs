// ── Filesystem Layout ──────────────────────────────────────────────────────
// All persistent state lives under a single home directory:
//
//   <home>/memory/memory.db          — the relational store (WAL mode)
//   <home>/memory/memory-config.json — JSON configuration
//   <home>/memory/index/             — reserved for on-disk index artifacts
//
// The home directory comes from OSAURUS_HOME when set, otherwise
// ~/.osaurus.

use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "OSAURUS_HOME";

/// Resolve the home directory for all memory-core state.
pub fn resolve_home() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".osaurus")
}

pub fn memory_dir(home: &Path) -> PathBuf {
    home.join("memory")
}

pub fn db_path(home: &Path) -> PathBuf {
    memory_dir(home).join("memory.db")
}

pub fn config_path(home: &Path) -> PathBuf {
    memory_dir(home).join("memory-config.json")
}

pub fn index_dir(home: &Path) -> PathBuf {
    memory_dir(home).join("index")
}

/// Create the memory directory tree if it does not exist yet.
pub fn ensure_layout(home: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(memory_dir(home))?;
    std::fs::create_dir_all(index_dir(home))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_nest_under_memory() {
        let home = PathBuf::from("/tmp/osaurus-test");
        assert_eq!(db_path(&home), home.join("memory").join("memory.db"));
        assert_eq!(
            config_path(&home),
            home.join("memory").join("memory-config.json")
        );
        assert_eq!(index_dir(&home), home.join("memory").join("index"));
    }
}
