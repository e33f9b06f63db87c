use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// An opaque handle to a content-addressed artifact.
///
/// Holds the stable printed form (e.g. `/nix/store/<hash>-<name>`).
/// Equality and ordering are structural over that form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath {
    path: String,
}

impl StorePath {
    /// Wrap an already-validated printed form.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The `<hash>-<name>` component, without the store directory.
    pub fn base_name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, base)) => base,
            None => &self.path,
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePath({})", self.path)
    }
}

pub type StorePathSet = BTreeSet<StorePath>;

/// The absolute prefix under which a store keeps its artifacts.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreDir(String);

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Result<Self, StoreError> {
        let dir = dir.into();
        if !dir.starts_with('/') || dir.ends_with('/') {
            return Err(StoreError::InvalidPath(dir));
        }
        Ok(Self(dir))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The stable printed form of a path in this store.
    pub fn print(&self, path: &StorePath) -> String {
        path.as_str().to_string()
    }

    /// Parse a printed form, checking it lives under this store.
    pub fn parse(&self, s: &str) -> Result<StorePath, StoreError> {
        let rest = s
            .strip_prefix(self.0.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| StoreError::InvalidPath(s.to_string()))?;
        if rest.is_empty() || rest.contains('/') || !rest.contains('-') {
            return Err(StoreError::InvalidPath(s.to_string()));
        }
        Ok(StorePath::new(s))
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        Self("/nix/store".to_string())
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
