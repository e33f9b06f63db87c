//! Store model shared by every capstan crate.
//!
//! This is the bottom layer of the workspace: opaque [`StorePath`] handles,
//! path metadata ([`ValidPathInfo`]), build recipes ([`Derivation`] /
//! [`BasicDerivation`]), SHA-256 hashing with the nix-base32 printed form,
//! and the [`Store`] trait that the dispatch core consumes.

pub mod base32;
pub mod copy;
pub mod derivation;
pub mod error;
pub mod hash;
pub mod path_info;
pub mod store;
pub mod store_path;

pub use copy::{copy_paths, reverse_topo_sort_paths};
pub use derivation::{BasicDerivation, Derivation, DerivationOutput, DerivationOutputs};
pub use error::{IoStoreContext, StoreError};
pub use hash::{Hash, HashContext, HashingReader};
pub use path_info::ValidPathInfo;
pub use store::Store;
pub use store_path::{StoreDir, StorePath, StorePathSet};
