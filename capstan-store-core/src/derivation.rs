use std::collections::{BTreeMap, BTreeSet};

use crate::store_path::{StorePath, StorePathSet};

/// A single declared output of a derivation.
///
/// `hash_algo` and `hash` are non-empty only for fixed-output derivations;
/// the wire format carries them either way.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DerivationOutput {
    pub path: Option<StorePath>,
    pub hash_algo: String,
    pub hash: String,
}

impl DerivationOutput {
    pub fn at(path: StorePath) -> Self {
        Self {
            path: Some(path),
            ..Self::default()
        }
    }
}

pub type DerivationOutputs = BTreeMap<String, DerivationOutput>;

/// A build recipe whose inputs still refer to other derivations.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Derivation {
    pub name: String,
    pub outputs: DerivationOutputs,
    /// Source inputs that are plain store paths.
    pub input_srcs: StorePathSet,
    /// Derivation inputs: drv path to the set of output names consumed.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Derivation {
    /// Start of the resolution into a [`BasicDerivation`]: same recipe, with
    /// `input_drvs` dropped. The caller adds the resolved output paths of
    /// each input derivation to `input_srcs`.
    pub fn to_basic(&self) -> BasicDerivation {
        BasicDerivation {
            name: self.name.clone(),
            outputs: self.outputs.clone(),
            input_srcs: self.input_srcs.clone(),
            platform: self.platform.clone(),
            builder: self.builder.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        }
    }

    /// Declared outputs with their (optional) output paths.
    pub fn outputs_and_opt_paths(&self) -> Vec<(String, Option<StorePath>)> {
        self.outputs
            .iter()
            .map(|(name, out)| (name.clone(), out.path.clone()))
            .collect()
    }
}

/// A self-contained build recipe: every input is a concrete store path.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BasicDerivation {
    pub name: String,
    pub outputs: DerivationOutputs,
    pub input_srcs: StorePathSet,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl BasicDerivation {
    pub fn output_names(&self) -> BTreeSet<String> {
        self.outputs.keys().cloned().collect()
    }
}
