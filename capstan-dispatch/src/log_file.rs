//! Per-step build log files, sharded as `<logDir>/<base[0..2]>/<base[2..]>`.

use std::path::{Path, PathBuf};

use capstan_store_core::{StoreError, StorePath};

use crate::error::DispatchError;

pub fn log_file_path(log_dir: &Path, drv_path: &StorePath) -> Result<PathBuf, DispatchError> {
    let base = drv_path.base_name();
    match (base.get(..2), base.get(2..)) {
        (Some(prefix), Some(rest)) if !rest.is_empty() => {
            Ok(log_dir.join(prefix).join(rest))
        }
        _ => Err(StoreError::InvalidPath(drv_path.to_string()).into()),
    }
}

/// Create (or truncate) the log file for a step. The open handle becomes
/// the worker's stderr.
pub async fn open_log_file(
    log_dir: &Path,
    drv_path: &StorePath,
) -> Result<(PathBuf, std::fs::File), DispatchError> {
    let path = log_file_path(log_dir, drv_path)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DispatchError::io(format!("creating log directory for {drv_path}"), e))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&path)
        .map_err(|e| DispatchError::io(format!("creating log file '{}'", path.display()), e))?;
    Ok((path, file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharded_by_base_name_prefix() {
        let path = log_file_path(
            Path::new("/var/log/capstan"),
            &StorePath::new("/nix/store/aaaabbbb-foo.drv"),
        )
        .unwrap();
        assert_eq!(path, Path::new("/var/log/capstan/aa/aabbbb-foo.drv"));
    }

    #[test]
    fn rejects_degenerate_names() {
        assert!(log_file_path(Path::new("logs"), &StorePath::new("/nix/store/ab")).is_err());
    }

    #[tokio::test]
    async fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (path, file) = open_log_file(dir.path(), &StorePath::new("/nix/store/ccddeeff-x.drv"))
            .await
            .unwrap();
        drop(file);
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("cc")));
    }
}
