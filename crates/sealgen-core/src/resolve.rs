//! Logical id → concrete path resolution.
//!
//! The core never hard-codes dataset locations. Stages receive a
//! [`PathResolver`] and ask it for paths by logical id plus run tokens.
//! [`TemplateResolver`] is the shipped implementation: `{token}` placeholders
//! in a relative template are substituted and the result is joined onto the
//! data root.

use crate::error::{CoreError, CoreResult};
use crate::fingerprint::{ManifestFingerprint, ParameterHash};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SEALED_INPUTS_ID: &str = "sealed_inputs";
pub const GATE_RECEIPT_ID: &str = "s0_gate_receipt";
pub const RNG_LOGS_ID: &str = "rng_logs";
pub const COUNTRY_SHARES_ID: &str = "country_shares";

/// Token values available to templates. Absent tokens fail resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTokens {
    pub seed: Option<u64>,
    pub parameter_hash: Option<ParameterHash>,
    pub manifest_fingerprint: Option<ManifestFingerprint>,
    pub run_id: Option<String>,
}

impl PathTokens {
    fn lookup(&self, token: &str) -> Option<String> {
        match token {
            "seed" => self.seed.map(|s| s.to_string()),
            "parameter_hash" => self.parameter_hash.as_ref().map(|h| h.to_string()),
            "manifest_fingerprint" => self.manifest_fingerprint.as_ref().map(|h| h.to_string()),
            "run_id" => self.run_id.clone(),
            _ => None,
        }
    }
}

/// Injected path resolution.
pub trait PathResolver {
    fn data_root(&self) -> &Path;

    /// Concrete path of `logical_id` for the given tokens.
    fn resolve(&self, logical_id: &str, tokens: &PathTokens) -> CoreResult<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct TemplateResolver {
    data_root: PathBuf,
    templates: BTreeMap<String, String>,
}

impl TemplateResolver {
    /// Resolver with the built-in templates for core artifacts.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let templates = [
            (
                SEALED_INPUTS_ID,
                "sealed_inputs/manifest_fingerprint={manifest_fingerprint}/sealed_inputs.json",
            ),
            (
                GATE_RECEIPT_ID,
                "receipts/manifest_fingerprint={manifest_fingerprint}/s0_gate_receipt.json",
            ),
            (RNG_LOGS_ID, "logs/rng"),
            (
                COUNTRY_SHARES_ID,
                "data/country_shares/seed={seed}/parameter_hash={parameter_hash}/manifest_fingerprint={manifest_fingerprint}/part-00000.jsonl",
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            data_root: data_root.into(),
            templates,
        }
    }

    /// Add or replace templates. Templates are validated on insert.
    pub fn with_templates(
        mut self,
        templates: impl IntoIterator<Item = (String, String)>,
    ) -> CoreResult<Self> {
        for (id, template) in templates {
            validate_relative_path(&template).map_err(|e| e.with_subject(id.clone()))?;
            self.templates.insert(id, template);
        }
        Ok(self)
    }

    pub fn template(&self, logical_id: &str) -> Option<&str> {
        self.templates.get(logical_id).map(String::as_str)
    }
}

impl PathResolver for TemplateResolver {
    fn data_root(&self) -> &Path {
        &self.data_root
    }

    fn resolve(&self, logical_id: &str, tokens: &PathTokens) -> CoreResult<PathBuf> {
        let template = self.templates.get(logical_id).ok_or_else(|| {
            CoreError::config(format!("no path template for logical id '{}'", logical_id))
                .with_subject(logical_id)
        })?;
        let rel = render_template(template, tokens).map_err(|e| e.with_subject(logical_id))?;
        validate_relative_path(&rel).map_err(|e| e.with_subject(logical_id))?;
        Ok(self.data_root.join(rel))
    }
}

/// Substitute `{token}` placeholders.
pub fn render_template(template: &str, tokens: &PathTokens) -> CoreResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            CoreError::config(format!("unterminated placeholder in template '{}'", template))
        })?;
        let token = &after[..close];
        let value = tokens.lookup(token).ok_or_else(|| {
            CoreError::config(format!(
                "template '{}' needs token '{}' which is not set",
                template, token
            ))
        })?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Accept only relative, `/`-separated paths that stay below their root.
pub fn validate_relative_path(path: &str) -> CoreResult<()> {
    if path.is_empty() {
        return Err(CoreError::config("path must not be empty"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(CoreError::config(format!(
            "path '{}' must be relative and '/'-separated",
            path
        )));
    }
    if path.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(CoreError::config(format!(
            "path '{}' contains '..' or an empty segment",
            path
        )));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(CoreError::config("path contains control characters"));
    }
    Ok(())
}
