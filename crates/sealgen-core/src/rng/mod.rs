//! Counter-based deterministic RNG.
//!
//! - [`philox`]: Philox 2x64-10 block function and 128-bit counters
//! - [`key`]: substream identity and its unambiguous encoding
//! - [`engine`]: root state from `(seed, manifest_fingerprint)`, substream derivation
//! - [`substream`]: exclusive counters, transactional draw groups, uniforms
//! - [`dist`]: normal, gamma and Dirichlet on top of draw groups

pub mod dist;
pub mod engine;
pub mod key;
pub mod philox;
pub mod substream;

pub use engine::CounterRngEngine;
pub use key::{KeyPart, SubstreamKey};
pub use philox::{philox2x64_10, Counter};
pub use substream::{u01, DrawCursor, DrawRecord, Substream};
