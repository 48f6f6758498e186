//! Stage entry points.
//!
//! A stage is one single-threaded batch step with a single `run` entry point.
//! Everything it depends on is either injected at construction (resolver,
//! schemas, publisher) or passed in a frozen input struct.

use crate::error::{CoreError, CoreResult};
use crate::fingerprint::{ManifestFingerprint, ParameterHash};
use crate::resolve::PathTokens;
use std::path::PathBuf;

pub trait Stage {
    type Input;
    type Output;

    /// Stable stage name for logs.
    fn name(&self) -> &'static str;

    fn run(&self, inputs: &Self::Input) -> CoreResult<Self::Output>;
}

/// Frozen inputs of a post-gate stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInputs {
    pub seed: u64,
    pub manifest_fingerprint: ManifestFingerprint,
    pub parameter_hash: ParameterHash,
    pub run_id: String,
    pub data_root: PathBuf,
}

impl StageInputs {
    pub fn validate(&self) -> CoreResult<()> {
        if self.run_id.is_empty()
            || self.run_id.contains(['/', '\\'])
            || self.run_id.starts_with('.')
        {
            return Err(CoreError::config(format!(
                "run_id '{}' must be a plain path segment",
                self.run_id
            )));
        }
        if !self.data_root.is_dir() {
            return Err(CoreError::precondition("data root does not exist").with_path(&self.data_root));
        }
        Ok(())
    }

    pub fn tokens(&self) -> PathTokens {
        PathTokens {
            seed: Some(self.seed),
            parameter_hash: Some(self.parameter_hash.clone()),
            manifest_fingerprint: Some(self.manifest_fingerprint.clone()),
            run_id: Some(self.run_id.clone()),
        }
    }
}
