//! Moving closures between stores.

use std::collections::BTreeMap;

use tokio::io::AsyncWriteExt as _;
use tracing::debug;

use crate::error::{IoStoreContext as _, StoreError};
use crate::path_info::ValidPathInfo;
use crate::store::Store;
use crate::store_path::{StorePath, StorePathSet};

/// Order `paths` so that every path appears after all of its references
/// (dependencies first).
///
/// Depth-first post-order. References without an entry in `paths` are not
/// traversed (a substituter may advertise a path that does not exist), and
/// self-references are tolerated.
pub fn reverse_topo_sort_paths(paths: &BTreeMap<StorePath, ValidPathInfo>) -> Vec<StorePath> {
    fn visit(
        path: &StorePath,
        paths: &BTreeMap<StorePath, ValidPathInfo>,
        visited: &mut StorePathSet,
        sorted: &mut Vec<StorePath>,
    ) {
        if !visited.insert(path.clone()) {
            return;
        }
        if let Some(info) = paths.get(path) {
            for reference in &info.references {
                if reference != path && paths.contains_key(reference) {
                    visit(reference, paths, visited, sorted);
                }
            }
        }
        sorted.push(path.clone());
    }

    let mut sorted = Vec::with_capacity(paths.len());
    let mut visited = StorePathSet::new();
    for path in paths.keys() {
        visit(path, paths, &mut visited, &mut sorted);
    }
    sorted
}

/// Copy `paths` from `src` to `dst`, dependencies first, skipping paths the
/// destination already has. No repair, no signature checks, no substitution.
///
/// Returns the number of paths actually streamed.
pub async fn copy_paths(
    src: &dyn Store,
    dst: &dyn Store,
    paths: &StorePathSet,
) -> Result<usize, StoreError> {
    let mut infos = BTreeMap::new();
    for path in paths {
        if let Some(info) = src.query_path_info(path).await? {
            infos.insert(path.clone(), info);
        }
    }

    let mut copied = 0;
    for path in reverse_topo_sort_paths(&infos) {
        if dst.is_valid_path(&path).await? {
            continue;
        }
        let info = &infos[&path];
        debug!(path = %path, nar_size = info.nar_size, "copying path");

        let (tx, mut rx) = tokio::io::duplex(64 * 1024);
        let send = async {
            let mut tx = tx;
            src.nar_from_path(&path, &mut tx).await?;
            tx.shutdown().await.store_context("closing NAR stream")?;
            Ok::<_, StoreError>(())
        };
        let recv = dst.add_to_store(info, &mut rx);
        let (sent, received) = tokio::join!(send, recv);
        sent?;
        received?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Hash;

    fn path(name: &str) -> StorePath {
        StorePath::new(format!("/nix/store/{name}"))
    }

    fn info(name: &str, references: &[&str]) -> (StorePath, ValidPathInfo) {
        let mut info = ValidPathInfo::new(path(name), Hash::digest(name));
        info.references = references.iter().map(|r| path(r)).collect();
        (path(name), info)
    }

    #[test]
    fn references_come_first() {
        let paths: BTreeMap<_, _> = [
            info("cccc-app", &["aaaa-libc", "bbbb-ssl"]),
            info("bbbb-ssl", &["aaaa-libc"]),
            info("aaaa-libc", &[]),
        ]
        .into_iter()
        .collect();

        let sorted = reverse_topo_sort_paths(&paths);
        assert_eq!(sorted.len(), 3);
        for (p, i) in &paths {
            let at = sorted.iter().position(|s| s == p).unwrap();
            for reference in &i.references {
                let ref_at = sorted.iter().position(|s| s == reference).unwrap();
                assert!(ref_at < at, "{reference} must precede {p}");
            }
        }
    }

    #[test]
    fn tolerates_self_reference_and_missing() {
        let paths: BTreeMap<_, _> = [
            info("aaaa-self", &["aaaa-self", "gone-missing"]),
            info("bbbb-user", &["aaaa-self"]),
        ]
        .into_iter()
        .collect();

        let sorted = reverse_topo_sort_paths(&paths);
        assert_eq!(sorted, vec![path("aaaa-self"), path("bbbb-user")]);
    }
}
