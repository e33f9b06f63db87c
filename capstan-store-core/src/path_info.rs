use crate::hash::Hash;
use crate::store_path::{StorePath, StorePathSet};

/// Metadata about an artifact that is present in some store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    pub references: StorePathSet,
    /// Size of the NAR serialisation in bytes.
    pub nar_size: u64,
    /// SHA-256 over the NAR serialisation.
    pub nar_hash: Hash,
    pub content_address: Option<String>,
}

impl ValidPathInfo {
    pub fn new(path: StorePath, nar_hash: Hash) -> Self {
        Self {
            path,
            deriver: None,
            references: StorePathSet::new(),
            nar_size: 0,
            nar_hash,
            content_address: None,
        }
    }
}
