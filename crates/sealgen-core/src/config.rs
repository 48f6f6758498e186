//! Engine configuration.
//!
//! Loaded from YAML with unknown fields rejected. Configuration is passed
//! explicitly to the components that need it; there is no process-wide
//! config.

use crate::error::{CoreError, CoreResult};
use crate::resolve::{validate_relative_path, TemplateResolver};
use crate::sealed::AssetRequest;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default bound on alias header fixed-point iterations.
pub const DEFAULT_MAX_HEADER_ITERATIONS: u32 = 8;
pub const DEFAULT_ALIAS_LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub build_id: String,
    /// Logical id → path template relative to `data_root`.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    /// Assets sealed by the gate stage.
    #[serde(default)]
    pub assets: Vec<AssetRequest>,
    /// Upstream segment id → validation bundle directory template.
    #[serde(default)]
    pub upstream_segments: BTreeMap<String, String>,
    #[serde(default)]
    pub rng: RngConfig,
    #[serde(default)]
    pub alias: AliasConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RngConfig {
    /// Blocks any single substream may consume. Unlimited when absent.
    #[serde(default)]
    pub max_blocks_per_substream: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasConfig {
    #[serde(default = "default_layout_version")]
    pub layout_version: u32,
    #[serde(default = "default_max_header_iterations")]
    pub max_header_iterations: u32,
}

fn default_layout_version() -> u32 {
    DEFAULT_ALIAS_LAYOUT_VERSION
}

fn default_max_header_iterations() -> u32 {
    DEFAULT_MAX_HEADER_ITERATIONS
}

impl Default for AliasConfig {
    fn default() -> Self {
        Self {
            layout_version: DEFAULT_ALIAS_LAYOUT_VERSION,
            max_header_iterations: DEFAULT_MAX_HEADER_ITERATIONS,
        }
    }
}

/// Partial overrides, typically from CLI flags. Only `Some` values override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfigOverrides {
    pub data_root: Option<PathBuf>,
    pub build_id: Option<String>,
    pub max_blocks_per_substream: Option<u64>,
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> CoreResult<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| {
            CoreError::config(format!("invalid engine config: {}", e)).with_source(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::io(e, path))?;
        Self::from_yaml_str(&content).map_err(|e| e.with_path(path))
    }

    pub fn apply(self, overrides: EngineConfigOverrides) -> Self {
        Self {
            data_root: overrides.data_root.unwrap_or(self.data_root),
            build_id: overrides.build_id.unwrap_or(self.build_id),
            rng: RngConfig {
                max_blocks_per_substream: overrides
                    .max_blocks_per_substream
                    .or(self.rng.max_blocks_per_substream),
            },
            ..self
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.build_id.trim().is_empty() {
            return Err(CoreError::config("build_id must not be empty"));
        }
        for (id, template) in self.templates.iter().chain(&self.upstream_segments) {
            validate_relative_path(template).map_err(|e| e.with_subject(id.clone()))?;
        }
        for asset in &self.assets {
            if !self.templates.contains_key(&asset.logical_id) {
                return Err(CoreError::config(format!(
                    "asset '{}' has no path template",
                    asset.logical_id
                ))
                .with_subject(asset.logical_id.clone()));
            }
        }
        if self.alias.max_header_iterations == 0 {
            return Err(CoreError::config("alias.max_header_iterations must be >= 1"));
        }
        Ok(())
    }

    /// Resolver over `data_root` with the built-in and configured templates.
    pub fn resolver(&self) -> CoreResult<TemplateResolver> {
        TemplateResolver::new(&self.data_root).with_templates(self.templates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::resolve::{PathResolver, PathTokens};
    use crate::sealed::AssetKind;

    const SAMPLE: &str = r#"
data_root: /srv/sealgen
build_id: git-4f2a9c1
templates:
  hurdle_coefficients: params/hurdle_coefficients.yaml
  country_priors: params/country_priors.json
assets:
  - owner: "1A"
    kind: parameter
    logical_id: hurdle_coefficients
  - owner: "1A"
    kind: parameter
    logical_id: country_priors
upstream_segments:
  "1B": validation/1B/manifest_fingerprint={manifest_fingerprint}
rng:
  max_blocks_per_substream: 1000000
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.assets.len(), 2);
        assert_eq!(cfg.assets[0].kind, AssetKind::Parameter);
        assert_eq!(cfg.rng.max_blocks_per_substream, Some(1_000_000));
        assert_eq!(cfg.alias, AliasConfig::default());

        let resolver = cfg.resolver().unwrap();
        let p = resolver
            .resolve("country_priors", &PathTokens::default())
            .unwrap();
        assert_eq!(p, PathBuf::from("/srv/sealgen/params/country_priors.json"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let bad = format!("{}\nunexpected: true\n", SAMPLE);
        let err = EngineConfig::from_yaml_str(&bad).unwrap_err();
        assert_eq!(err.code, ErrorCode::Config);
    }

    #[test]
    fn test_asset_without_template_rejected() {
        let bad = r#"
data_root: /d
build_id: b
assets:
  - owner: "1A"
    kind: policy
    logical_id: missing
"#;
        let err = EngineConfig::from_yaml_str(bad).unwrap_err();
        assert_eq!(err.subject.as_deref(), Some("missing"));
    }

    #[test]
    fn test_overrides_apply_only_some() {
        let cfg = EngineConfig::from_yaml_str(SAMPLE).unwrap();
        let merged = cfg.clone().apply(EngineConfigOverrides {
            build_id: Some("git-ffff".into()),
            ..Default::default()
        });
        assert_eq!(merged.build_id, "git-ffff");
        assert_eq!(merged.data_root, cfg.data_root);
        assert_eq!(merged.rng.max_blocks_per_substream, Some(1_000_000));
    }
}
