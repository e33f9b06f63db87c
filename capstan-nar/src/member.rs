use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use derive_more::Display;

use capstan_store_core::{Hash, StorePath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NarMemberType {
    #[display("regular")]
    Regular,
    #[display("symlink")]
    Symlink,
    #[display("directory")]
    Directory,
}

/// Filesystem metadata for one member of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarMember {
    pub member_type: NarMemberType,
    pub executable: bool,
    /// Content length; regular files only.
    pub file_size: Option<u64>,
    /// Content digest; regular files only.
    pub sha256: Option<Hash>,
    pub symlink_target: Option<String>,
}

/// Shared collection of member metadata, keyed by store path and the
/// member's path inside the archive (`""` for the root).
///
/// Steps run in parallel and each inserts under fresh keys, so a plain
/// mutex around the map is enough.
#[derive(Clone, Default)]
pub struct NarMemberMap {
    inner: Arc<Mutex<BTreeMap<(StorePath, String), NarMember>>>,
}

impl NarMemberMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, store_path: StorePath, member_path: String, member: NarMember) {
        self.inner
            .lock()
            .unwrap()
            .insert((store_path, member_path), member);
    }

    pub fn get(&self, store_path: &StorePath, member_path: &str) -> Option<NarMember> {
        self.inner
            .lock()
            .unwrap()
            .get(&(store_path.clone(), member_path.to_string()))
            .cloned()
    }

    /// All members recorded for one store path, in archive order.
    pub fn members_of(&self, store_path: &StorePath) -> Vec<(String, NarMember)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .filter(|((p, _), _)| p == store_path)
            .map(|((_, name), member)| (name.clone(), member.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
