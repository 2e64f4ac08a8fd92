//! Removal of persisted state, scoped per pipeline stage.
//!
//! Each scope deletes only its own part of the data directory tree. A run
//! lock is taken first so state is never deleted under an active sync run.

use anyhow::Result;

use crate::config::Config;
use crate::pipeline::RunLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    Cache,
    Index,
    Attachments,
    Everything,
}

pub fn run_clean(config: &Config, scope: CleanScope) -> Result<()> {
    let lock = RunLock::acquire(config)?;

    if matches!(scope, CleanScope::Cache | CleanScope::Everything) {
        let path = config.storage.cache_path();
        remove_file_if_exists(&path)?;
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(suffix);
            remove_file_if_exists(std::path::Path::new(&sidecar))?;
        }
        println!("cleaned cache");
    }

    if matches!(scope, CleanScope::Index | CleanScope::Everything) {
        remove_dir_if_exists(&config.storage.index_dir())?;
        println!("cleaned index");
    }

    if matches!(scope, CleanScope::Attachments | CleanScope::Everything) {
        remove_dir_if_exists(&config.storage.attachments_dir())?;
        println!("cleaned attachments");
    }

    drop(lock);

    if scope == CleanScope::Everything {
        // The lock file was the last occupant; take the directory with it
        // when empty.
        let _ = std::fs::remove_dir(&config.storage.data_dir);
        println!("cleaned everything");
    }

    Ok(())
}

fn remove_file_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_dir_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let config_path = dir.path().join("bibmirror.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[storage]
data_dir = "{}"

[remote]
base_url = "http://127.0.0.1:1"
library_id = "1"

[server]
bind = "127.0.0.1:0"
"#,
                dir.path().join("data").display()
            ),
        )
        .unwrap();
        crate::config::load_config(&PathBuf::from(config_path)).unwrap()
    }

    #[test]
    fn clean_scopes_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        std::fs::create_dir_all(config.storage.index_dir()).unwrap();
        std::fs::create_dir_all(config.storage.attachments_dir()).unwrap();
        std::fs::write(config.storage.cache_path(), b"x").unwrap();

        run_clean(&config, CleanScope::Index).unwrap();
        assert!(!config.storage.index_dir().exists());
        assert!(config.storage.cache_path().exists());
        assert!(config.storage.attachments_dir().exists());

        run_clean(&config, CleanScope::Everything).unwrap();
        assert!(!config.storage.cache_path().exists());
        assert!(!config.storage.attachments_dir().exists());
    }

    #[test]
    fn clean_missing_state_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        run_clean(&config, CleanScope::Everything).unwrap();
    }
}
