use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use capstan_nar::NarEntry;
use capstan_store_core::{
    Derivation, Hash, HashingReader, IoStoreContext as _, Store, StoreDir, StoreError, StorePath,
    StorePathSet, ValidPathInfo,
};

#[derive(Default)]
struct State {
    paths: BTreeMap<StorePath, (ValidPathInfo, Vec<u8>)>,
    derivations: BTreeMap<StorePath, Derivation>,
}

/// A [`Store`] backed by plain maps. NAR bytes are held verbatim, so
/// `add_to_store` followed by `nar_from_path` is byte-faithful.
pub struct MemoryStore {
    uri: String,
    store_dir: StoreDir,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            store_dir: StoreDir::default(),
            state: Mutex::new(State::default()),
        }
    }

    /// Seed a path from an in-memory tree. Returns the registered info.
    pub fn seed_tree(
        &self,
        path: StorePath,
        references: StorePathSet,
        tree: &NarEntry,
    ) -> ValidPathInfo {
        let nar = tree.dump();
        let mut info = ValidPathInfo::new(path.clone(), Hash::digest(&nar));
        info.nar_size = nar.len() as u64;
        info.references = references;
        self.state
            .lock()
            .unwrap()
            .paths
            .insert(path, (info.clone(), nar));
        info
    }

    pub fn seed_derivation(&self, path: StorePath, drv: Derivation) {
        self.state.lock().unwrap().derivations.insert(path, drv);
    }

    pub fn contains(&self, path: &StorePath) -> bool {
        self.state.lock().unwrap().paths.contains_key(path)
    }

    pub fn nar_bytes(&self, path: &StorePath) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .paths
            .get(path)
            .map(|(_, nar)| nar.clone())
    }

    pub fn path_count(&self) -> usize {
        self.state.lock().unwrap().paths.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    async fn query_path_info(
        &self,
        path: &StorePath,
    ) -> Result<Option<ValidPathInfo>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .paths
            .get(path)
            .map(|(info, _)| info.clone()))
    }

    async fn read_derivation(&self, path: &StorePath) -> Result<Derivation, StoreError> {
        self.state
            .lock()
            .unwrap()
            .derivations
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::MissingDerivation(path.to_string()))
    }

    async fn add_to_store(
        &self,
        info: &ValidPathInfo,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StoreError> {
        // Already valid: elect not to read. A lazy source then transmits
        // nothing at all.
        if self.contains(&info.path) {
            return Ok(());
        }

        let mut source = HashingReader::new(source);
        let mut nar = Vec::new();
        source
            .read_to_end(&mut nar)
            .await
            .store_context("reading NAR stream")?;

        if source.bytes_hashed() != info.nar_size {
            return Err(StoreError::SizeMismatch {
                path: info.path.to_string(),
                expected: info.nar_size,
                actual: source.bytes_hashed(),
            });
        }
        let actual = source.finish();
        if actual != info.nar_hash {
            return Err(StoreError::HashMismatch {
                path: info.path.to_string(),
                expected: info.nar_hash.to_string(),
                actual: actual.to_string(),
            });
        }

        self.state
            .lock()
            .unwrap()
            .paths
            .insert(info.path.clone(), (info.clone(), nar));
        Ok(())
    }

    async fn nar_from_path(
        &self,
        path: &StorePath,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StoreError> {
        let nar = self
            .nar_bytes(path)
            .ok_or_else(|| StoreError::PathNotValid(path.to_string()))?;
        sink.write_all(&nar)
            .await
            .store_context("writing NAR stream")?;
        sink.flush().await.store_context("flushing NAR stream")?;
        Ok(())
    }
}
