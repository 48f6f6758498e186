//! Typed errors with stable codes.
//!
//! Every failure raised by the core carries an [`ErrorClass`], a stable
//! [`ErrorCode`] (the string form is part of the public contract and appears in
//! logs and CLI output), a human message and, where known, the path or subject
//! (segment, logical id, substream) needed to act on it.
//!
//! Nothing in the core retries or swallows a `CoreError`.

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Missing or non-PASS upstream state.
    Precondition,
    /// Published content diverges from its sealed digest.
    Integrity,
    /// Counter monotonicity or draw accounting violated (caller misuse).
    RngInvariant,
    /// Malformed artifact.
    Schema,
    /// Filesystem failure.
    Io,
    /// Invalid configuration.
    Config,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    // Precondition
    S0Precondition,
    UpstreamGate,
    UpstreamMissing,
    SealedDuplicate,
    // Integrity
    FlagHashMismatch,
    Immutability,
    PartitionExistsNonidentical,
    SealedDigestMismatch,
    // RNG
    RngCounter,
    RngBudget,
    DirichletDegenerate,
    // Schema
    Schema,
    // Io / Config
    Io,
    Config,
}

impl ErrorCode {
    /// The stable string form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S0Precondition => "E_S0_PRECONDITION",
            Self::UpstreamGate => "E_UPSTREAM_GATE",
            Self::UpstreamMissing => "E_UPSTREAM_MISSING",
            Self::SealedDuplicate => "E_SEALED_DUPLICATE",
            Self::FlagHashMismatch => "E_FLAG_HASH_MISMATCH",
            Self::Immutability => "E_IMMUTABILITY",
            Self::PartitionExistsNonidentical => "partition_exists_nonidentical",
            Self::SealedDigestMismatch => "sealed_digest_mismatch",
            Self::RngCounter => "E_RNG_COUNTER",
            Self::RngBudget => "E_RNG_BUDGET",
            Self::DirichletDegenerate => "E_DIRICHLET_DEGENERATE",
            Self::Schema => "E_SCHEMA",
            Self::Io => "E_IO",
            Self::Config => "E_CONFIG",
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            Self::S0Precondition
            | Self::UpstreamGate
            | Self::UpstreamMissing
            | Self::SealedDuplicate => ErrorClass::Precondition,
            Self::FlagHashMismatch
            | Self::Immutability
            | Self::PartitionExistsNonidentical
            | Self::SealedDigestMismatch => ErrorClass::Integrity,
            Self::RngCounter | Self::RngBudget | Self::DirichletDegenerate => {
                ErrorClass::RngInvariant
            }
            Self::Schema => ErrorClass::Schema,
            Self::Io => ErrorClass::Io,
            Self::Config => ErrorClass::Config,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed core error with stable code.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}{}", render_context(.path, .subject))]
pub struct CoreError {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
    pub path: Option<PathBuf>,
    pub subject: Option<String>,
    #[source]
    pub source: Option<anyhow::Error>,
}

fn render_context(path: &Option<PathBuf>, subject: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(subject) = subject {
        out.push_str(&format!(" [{}]", subject));
    }
    if let Some(path) = path {
        out.push_str(&format!(" (path: {})", path.display()));
    }
    out
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            class: code.class(),
            code,
            message: message.into(),
            path: None,
            subject: None,
            source: None,
        }
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.message = format!("{}: {}", context.into(), self.message);
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Wrap an IO error raised while touching `path`.
    pub fn io(err: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::new(ErrorCode::Io, err.to_string())
            .with_path(path)
            .with_source(err)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::S0Precondition, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Schema, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    /// Suggested exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self.class {
            ErrorClass::Io | ErrorClass::Config => 2,
            ErrorClass::Precondition => 3,
            ErrorClass::Integrity => 4,
            ErrorClass::RngInvariant => 5,
            ErrorClass::Schema => 6,
        }
    }
}

// Helper for IO errors without a known path
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Schema, err.to_string()).with_source(err)
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
