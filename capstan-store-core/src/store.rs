use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::derivation::Derivation;
use crate::error::StoreError;
use crate::path_info::ValidPathInfo;
use crate::store_path::{StoreDir, StorePath, StorePathSet};

/// The narrow interface the dispatch core needs from an artifact store.
///
/// Implementations decide the on-disk (or in-memory) format; callers only
/// see NAR byte streams and path metadata.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stable identifier for this store; two stores with the same URI hold
    /// the same artifacts.
    fn uri(&self) -> String;

    fn store_dir(&self) -> &StoreDir;

    async fn query_path_info(&self, path: &StorePath)
        -> Result<Option<ValidPathInfo>, StoreError>;

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, StoreError> {
        Ok(self.query_path_info(path).await?.is_some())
    }

    /// The transitive reference closure of `roots` within this store.
    /// Paths without metadata are skipped rather than reported.
    async fn compute_fs_closure(&self, roots: &StorePathSet) -> Result<StorePathSet, StoreError> {
        let mut closure = StorePathSet::new();
        let mut queue: Vec<StorePath> = roots.iter().cloned().collect();
        while let Some(path) = queue.pop() {
            if !closure.insert(path.clone()) {
                continue;
            }
            if let Some(info) = self.query_path_info(&path).await? {
                for reference in info.references {
                    if reference != path && !closure.contains(&reference) {
                        queue.push(reference);
                    }
                }
            }
        }
        Ok(closure)
    }

    async fn read_derivation(&self, path: &StorePath) -> Result<Derivation, StoreError>;

    /// Ingest a NAR stream as `info.path`.
    ///
    /// The implementation must verify the stream against `info.nar_hash` and
    /// `info.nar_size`, and may skip reading entirely when the path is
    /// already valid.
    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StoreError>;

    /// Write the NAR serialisation of a valid path into `sink`.
    async fn nar_from_path(
        &self,
        path: &StorePath,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StoreError>;
}
