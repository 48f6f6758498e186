//! Substream identity: `(module, substream_label, entity key tuple)`.
//!
//! Keys are encoded unambiguously (length-prefixed strings, type-tagged key
//! parts) before hashing, so `("ab", "c")` and `("a", "bc")` never collide.

use serde::{Deserialize, Serialize};

/// One component of an entity key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
    U64(u64),
    Str(String),
}

impl From<u64> for KeyPart {
    fn from(v: u64) -> Self {
        KeyPart::U64(v)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Str(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Str(v)
    }
}

impl std::fmt::Display for KeyPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPart::U64(v) => write!(f, "{}", v),
            KeyPart::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubstreamKey {
    pub module: String,
    pub label: String,
    pub parts: Vec<KeyPart>,
}

const TAG_U64: u8 = 0x01;
const TAG_STR: u8 = 0x02;

impl SubstreamKey {
    pub fn new(module: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            label: label.into(),
            parts: Vec::new(),
        }
    }

    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Entity key rendered for logs, e.g. `1|GB`.
    pub fn entity(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Unambiguous byte encoding fed to the derivation hash.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.module);
        put_str(&mut out, &self.label);
        out.extend_from_slice(&(self.parts.len() as u32).to_le_bytes());
        for part in &self.parts {
            match part {
                KeyPart::U64(v) => {
                    out.push(TAG_U64);
                    out.extend_from_slice(&v.to_le_bytes());
                }
                KeyPart::Str(s) => {
                    out.push(TAG_STR);
                    put_str(&mut out, s);
                }
            }
        }
        out
    }
}

/// Length-prefixed (u32 LE) UTF-8 bytes.
pub(crate) fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_is_unambiguous() {
        let a = SubstreamKey::new("1A", "x").with("ab").with("c");
        let b = SubstreamKey::new("1A", "x").with("a").with("bc");
        assert_ne!(a.encode(), b.encode());

        let c = SubstreamKey::new("1A", "ab");
        let d = SubstreamKey::new("1Aa", "b");
        assert_ne!(c.encode(), d.encode());
    }

    #[test]
    fn test_numeric_and_string_parts_differ() {
        let a = SubstreamKey::new("1A", "x").with(7_u64);
        let b = SubstreamKey::new("1A", "x").with("7");
        assert_ne!(a.encode(), b.encode());
        assert_eq!(a.entity(), b.entity());
    }
}
