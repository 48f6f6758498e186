//! Alias-table blob: per-entity weighted sampling tables in one binary file.
//!
//! # Blob layout (all integers little-endian)
//!
//! ```text
//! u64 header_length | header (JCS JSON, header_length bytes) | payload
//! ```
//!
//! The payload is the concatenation of one group per merchant, in ascending
//! merchant id order:
//!
//! ```text
//! u64 merchant_id | u32 n | n × (f64 prob, u32 alias) | n × (u16 len, utf-8 outcome)
//! ```
//!
//! The header records `total_length`, which includes the header's own length.
//! It is computed by a bounded fixed-point loop: serialize, measure, update
//! `total_length`, repeat until the length is stable.
//!
//! # Index
//!
//! Per-merchant rows hold the group's offset in the on-disk blob (already
//! shifted by `8 + header_length`), its length and its SHA-256. The `GLOBAL`
//! row spans the whole blob: offset 0, the full length and the digest of the
//! entire file.

use crate::canonical::jcs_to_vec;
use crate::config::AliasConfig;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::fingerprint::{universe_hash, UniverseHash};
use crate::hashing::sha256_bytes;
use crate::schema::{ArtifactKind, SchemaRegistry};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ENDIANNESS: &str = "little";
const LEN_PREFIX: usize = 8;

/// One weighted outcome of one merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasRow {
    pub merchant_id: u64,
    pub sub_order: u32,
    pub outcome: String,
    pub weight: f64,
}

/// Vose alias table.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasTable {
    prob: Vec<f64>,
    alias: Vec<u32>,
    outcomes: Vec<String>,
}

impl AliasTable {
    /// Build from non-negative weights with a positive finite sum.
    pub fn build(outcomes: Vec<String>, weights: &[f64]) -> CoreResult<Self> {
        let n = weights.len();
        if n == 0 || n != outcomes.len() || n > u32::MAX as usize {
            return Err(CoreError::schema(format!(
                "alias table needs matching non-empty outcomes and weights ({} vs {})",
                outcomes.len(),
                n
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(CoreError::schema("alias weights must be finite and >= 0"));
        }
        let sum: f64 = weights.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            return Err(CoreError::schema("alias weights must have a positive sum"));
        }

        let scale = n as f64 / sum;
        let mut scaled: Vec<f64> = weights.iter().map(|w| w * scale).collect();
        let mut prob = vec![0.0; n];
        let mut alias: Vec<u32> = (0..n as u32).collect();
        let mut small: Vec<usize> = Vec::new();
        let mut large: Vec<usize> = Vec::new();
        for (i, p) in scaled.iter().enumerate() {
            if *p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }
        while let (Some(&s), Some(&l)) = (small.last(), large.last()) {
            small.pop();
            prob[s] = scaled[s];
            alias[s] = l as u32;
            scaled[l] = (scaled[l] + scaled[s]) - 1.0;
            if scaled[l] < 1.0 {
                large.pop();
                small.push(l);
            }
        }
        // Leftovers are 1 up to rounding.
        for i in large.into_iter().chain(small) {
            prob[i] = 1.0;
            alias[i] = i as u32;
        }
        Ok(Self {
            prob,
            alias,
            outcomes,
        })
    }

    pub fn len(&self) -> usize {
        self.prob.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }

    pub fn outcomes(&self) -> &[String] {
        &self.outcomes
    }

    /// O(1) weighted choice for `u` in `[0, 1)`.
    pub fn sample(&self, u: f64) -> &str {
        let n = self.prob.len();
        let x = u.clamp(0.0, 1.0) * n as f64;
        let i = (x as usize).min(n - 1);
        let frac = x - i as f64;
        let j = if frac < self.prob[i] {
            i
        } else {
            self.alias[i] as usize
        };
        &self.outcomes[j]
    }

    fn encode_group(&self, merchant_id: u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&merchant_id.to_le_bytes());
        out.extend_from_slice(&(self.prob.len() as u32).to_le_bytes());
        for (p, a) in self.prob.iter().zip(&self.alias) {
            out.extend_from_slice(&p.to_le_bytes());
            out.extend_from_slice(&a.to_le_bytes());
        }
        for o in &self.outcomes {
            out.extend_from_slice(&(o.len() as u16).to_le_bytes());
            out.extend_from_slice(o.as_bytes());
        }
    }

    fn decode_group(bytes: &[u8]) -> CoreResult<(u64, Self)> {
        let mut r = ByteReader::new(bytes);
        let merchant_id = r.u64()?;
        let n = r.u32()? as usize;
        let mut prob = Vec::with_capacity(n.min(bytes.len() / 12));
        let mut alias = Vec::with_capacity(n.min(bytes.len() / 12));
        for _ in 0..n {
            prob.push(f64::from_le_bytes(r.array()?));
            let a = r.u32()?;
            if a as usize >= n {
                return Err(CoreError::schema(format!("alias index {} out of range", a)));
            }
            alias.push(a);
        }
        let mut outcomes = Vec::with_capacity(n.min(bytes.len() / 2));
        for _ in 0..n {
            let len = u16::from_le_bytes(r.array()?) as usize;
            let raw = r.take(len)?;
            let s = std::str::from_utf8(raw)
                .map_err(|_| CoreError::schema("alias outcome is not utf-8"))?;
            outcomes.push(s.to_string());
        }
        if !r.is_at_end() {
            return Err(CoreError::schema("trailing bytes in alias group"));
        }
        if n == 0 {
            return Err(CoreError::schema("empty alias group"));
        }
        Ok((
            merchant_id,
            Self {
                prob,
                alias,
                outcomes,
            },
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasHeader {
    pub layout_version: u32,
    pub endianness: String,
    pub total_length: u64,
    pub payload_length: u64,
    pub payload_sha256: String,
    pub entity_count: u64,
    pub policy_ids: Vec<String>,
    pub universe_hash: UniverseHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexScope {
    Global,
    Merchant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasIndexEntry {
    pub scope: IndexScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<u64>,
    pub blob_offset: u64,
    pub blob_length: u64,
    pub checksum: String,
    pub universe_hash: UniverseHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasIndex {
    pub layout_version: u32,
    pub header_length: u64,
    pub payload_sha256: String,
    pub universe_hash: UniverseHash,
    /// `GLOBAL` first, then merchants ascending.
    pub entries: Vec<AliasIndexEntry>,
}

impl AliasIndex {
    pub fn global(&self) -> Option<&AliasIndexEntry> {
        self.entries.iter().find(|e| e.scope == IndexScope::Global)
    }

    pub fn merchant(&self, merchant_id: u64) -> Option<&AliasIndexEntry> {
        self.entries
            .iter()
            .find(|e| e.scope == IndexScope::Merchant && e.merchant_id == Some(merchant_id))
    }
}

/// Blob bytes with the header and index that describe them.
#[derive(Debug, Clone)]
pub struct EncodedAlias {
    pub blob: Vec<u8>,
    pub header: AliasHeader,
    pub index: AliasIndex,
}

#[derive(Debug, Clone)]
pub struct AliasBlobEncoder {
    layout_version: u32,
    max_header_iterations: u32,
}

impl AliasBlobEncoder {
    pub fn new(config: &AliasConfig) -> Self {
        Self {
            layout_version: config.layout_version,
            max_header_iterations: config.max_header_iterations,
        }
    }

    /// Encode `rows` into a blob.
    ///
    /// `constituents` are the digests of the inputs the tables derive from
    /// (policy, data); together with the payload digest they form the
    /// universe hash.
    pub fn encode(
        &self,
        rows: &[AliasRow],
        policy_ids: &[String],
        constituents: &[String],
        schemas: &SchemaRegistry,
    ) -> CoreResult<EncodedAlias> {
        if rows.is_empty() {
            return Err(CoreError::schema("no alias rows to encode"));
        }
        let mut sorted: Vec<&AliasRow> = rows.iter().collect();
        sorted.sort_by_key(|r| (r.merchant_id, r.sub_order));
        for pair in sorted.windows(2) {
            if (pair[0].merchant_id, pair[0].sub_order) == (pair[1].merchant_id, pair[1].sub_order)
            {
                return Err(CoreError::schema(format!(
                    "duplicate alias row (merchant {}, sub_order {})",
                    pair[0].merchant_id, pair[0].sub_order
                )));
            }
        }
        if let Some(r) = sorted.iter().find(|r| r.outcome.len() > u16::MAX as usize) {
            return Err(CoreError::schema("alias outcome longer than 65535 bytes")
                .with_subject(r.merchant_id.to_string()));
        }

        let mut payload = Vec::new();
        let mut groups: Vec<(u64, u64, u64, String)> = Vec::new();
        for group in sorted.chunk_by(|a, b| a.merchant_id == b.merchant_id) {
            let merchant_id = group[0].merchant_id;
            let outcomes = group.iter().map(|r| r.outcome.clone()).collect();
            let weights: Vec<f64> = group.iter().map(|r| r.weight).collect();
            let table = AliasTable::build(outcomes, &weights)
                .map_err(|e| e.with_subject(merchant_id.to_string()))?;
            let start = payload.len();
            table.encode_group(merchant_id, &mut payload);
            let bytes = &payload[start..];
            groups.push((
                merchant_id,
                start as u64,
                bytes.len() as u64,
                sha256_bytes(bytes),
            ));
        }

        let payload_sha256 = sha256_bytes(&payload);
        let universe = universe_hash(
            constituents
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(payload_sha256.as_str())),
        )?;

        let mut header = AliasHeader {
            layout_version: self.layout_version,
            endianness: ENDIANNESS.to_string(),
            total_length: 0,
            payload_length: payload.len() as u64,
            payload_sha256: payload_sha256.clone(),
            entity_count: groups.len() as u64,
            policy_ids: policy_ids.to_vec(),
            universe_hash: universe.clone(),
        };
        let header_bytes = self.converge_header(&mut header)?;
        let header_length = header_bytes.len() as u64;

        let mut blob = Vec::with_capacity(header.total_length as usize);
        blob.extend_from_slice(&header_length.to_le_bytes());
        blob.extend_from_slice(&header_bytes);
        blob.extend_from_slice(&payload);
        if blob.len() as u64 != header.total_length {
            return Err(CoreError::schema(format!(
                "blob length {} disagrees with header total_length {}",
                blob.len(),
                header.total_length
            )));
        }

        let shift = LEN_PREFIX as u64 + header_length;
        let mut entries = vec![AliasIndexEntry {
            scope: IndexScope::Global,
            merchant_id: None,
            blob_offset: 0,
            blob_length: blob.len() as u64,
            checksum: sha256_bytes(&blob),
            universe_hash: universe.clone(),
        }];
        entries.extend(
            groups
                .into_iter()
                .map(|(merchant_id, offset, length, checksum)| AliasIndexEntry {
                    scope: IndexScope::Merchant,
                    merchant_id: Some(merchant_id),
                    blob_offset: offset + shift,
                    blob_length: length,
                    checksum,
                    universe_hash: universe.clone(),
                }),
        );
        let index = AliasIndex {
            layout_version: self.layout_version,
            header_length,
            payload_sha256,
            universe_hash: universe,
            entries,
        };
        schemas.validate(ArtifactKind::AliasIndex, &index)?;

        Ok(EncodedAlias {
            blob,
            header,
            index,
        })
    }

    /// Iterate `total_length = 8 + len(header) + payload_length` to a fixed point.
    fn converge_header(&self, header: &mut AliasHeader) -> CoreResult<Vec<u8>> {
        let mut assumed_len = 0_u64;
        for iteration in 1..=self.max_header_iterations {
            header.total_length = LEN_PREFIX as u64 + assumed_len + header.payload_length;
            let bytes = jcs_to_vec(header)?;
            if bytes.len() as u64 == assumed_len {
                debug!(
                    iteration,
                    header_length = assumed_len,
                    total_length = header.total_length,
                    "alias header converged"
                );
                return Ok(bytes);
            }
            assumed_len = bytes.len() as u64;
        }
        Err(CoreError::schema(format!(
            "alias header length did not converge within {} iterations",
            self.max_header_iterations
        )))
    }
}

/// A parsed blob. Header and payload digest are checked on parse.
#[derive(Debug, Clone)]
pub struct AliasBlob<'a> {
    header: AliasHeader,
    header_length: u64,
    bytes: &'a [u8],
}

impl<'a> AliasBlob<'a> {
    pub fn parse(bytes: &'a [u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(bytes);
        let header_length = r.u64()?;
        let header_raw = r.take(usize::try_from(header_length).map_err(|_| {
            CoreError::schema("alias header length does not fit in memory")
        })?)?;
        let header: AliasHeader = serde_json::from_slice(header_raw)?;
        let payload = r.rest();

        if header.endianness != ENDIANNESS {
            return Err(CoreError::schema(format!(
                "unsupported endianness '{}'",
                header.endianness
            )));
        }
        if header.total_length != bytes.len() as u64
            || header.payload_length != payload.len() as u64
        {
            return Err(CoreError::schema(format!(
                "blob is {} bytes with {} payload bytes, header declares {} and {}",
                bytes.len(),
                payload.len(),
                header.total_length,
                header.payload_length
            )));
        }
        let actual = sha256_bytes(payload);
        if actual != header.payload_sha256 {
            return Err(CoreError::new(
                ErrorCode::SealedDigestMismatch,
                format!(
                    "alias payload digest {} does not match header {}",
                    actual, header.payload_sha256
                ),
            ));
        }
        Ok(Self {
            header,
            header_length,
            bytes,
        })
    }

    pub fn header(&self) -> &AliasHeader {
        &self.header
    }

    pub fn header_length(&self) -> u64 {
        self.header_length
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[LEN_PREFIX + self.header_length as usize..]
    }

    /// Decode the table an index row points at, verifying its checksum.
    pub fn table(&self, entry: &AliasIndexEntry) -> CoreResult<(u64, AliasTable)> {
        let slice = self.slice(entry)?;
        if entry.scope != IndexScope::Merchant {
            return Err(CoreError::schema("only merchant rows point at a single table"));
        }
        let (merchant_id, table) = AliasTable::decode_group(slice)?;
        if entry.merchant_id != Some(merchant_id) {
            return Err(CoreError::schema(format!(
                "index row for {:?} points at merchant {}",
                entry.merchant_id, merchant_id
            )));
        }
        Ok((merchant_id, table))
    }

    /// Check every index row against the blob.
    pub fn verify_index(&self, index: &AliasIndex) -> CoreResult<()> {
        if index.payload_sha256 != self.header.payload_sha256
            || index.universe_hash != self.header.universe_hash
        {
            return Err(CoreError::new(
                ErrorCode::SealedDigestMismatch,
                "alias index does not belong to this blob",
            ));
        }
        for entry in &index.entries {
            self.slice(entry)?;
        }
        Ok(())
    }

    fn slice(&self, entry: &AliasIndexEntry) -> CoreResult<&'a [u8]> {
        let start = entry.blob_offset as usize;
        let end = start.checked_add(entry.blob_length as usize);
        let slice = end
            .and_then(|end| self.bytes.get(start..end))
            .ok_or_else(|| {
                CoreError::schema(format!(
                    "index row [{}, +{}) exceeds blob length {}",
                    entry.blob_offset,
                    entry.blob_length,
                    self.bytes.len()
                ))
            })?;
        if sha256_bytes(slice) != entry.checksum {
            return Err(CoreError::new(
                ErrorCode::SealedDigestMismatch,
                "alias index checksum mismatch",
            )
            .with_subject(
                entry
                    .merchant_id
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "GLOBAL".to_string()),
            ));
        }
        Ok(slice)
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| CoreError::schema("alias data truncated"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0_u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        out
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(m: u64, k: u32, outcome: &str, w: f64) -> AliasRow {
        AliasRow {
            merchant_id: m,
            sub_order: k,
            outcome: outcome.into(),
            weight: w,
        }
    }

    fn encode(rows: &[AliasRow]) -> EncodedAlias {
        let schemas = SchemaRegistry::builtin().unwrap();
        AliasBlobEncoder::new(&AliasConfig::default())
            .encode(
                rows,
                &["routing_policy_v1".to_string()],
                &[sha256_bytes(b"policy")],
                &schemas,
            )
            .unwrap()
    }

    #[test]
    fn test_vose_probabilities_recover_weights() {
        let weights = [0.1, 0.2, 0.3, 0.4];
        let outcomes = ["a", "b", "c", "d"].map(String::from).to_vec();
        let table = AliasTable::build(outcomes, &weights).unwrap();
        let n = 10_000;
        let mut counts = [0_u32; 4];
        for i in 0..n {
            let u = (i as f64 + 0.5) / n as f64;
            let idx = ["a", "b", "c", "d"]
                .iter()
                .position(|o| *o == table.sample(u))
                .unwrap();
            counts[idx] += 1;
        }
        for (c, w) in counts.iter().zip(weights) {
            assert!((*c as f64 / n as f64 - w).abs() < 0.01, "{:?}", counts);
        }
    }

    #[test]
    fn test_zero_weight_never_sampled() {
        let table =
            AliasTable::build(vec!["x".into(), "y".into()], &[0.0, 1.0]).unwrap();
        for i in 0..100 {
            assert_eq!(table.sample(i as f64 / 100.0), "y");
        }
    }

    #[test]
    fn test_bad_weights_rejected() {
        assert!(AliasTable::build(vec!["x".into()], &[0.0]).is_err());
        assert!(AliasTable::build(vec!["x".into()], &[f64::NAN]).is_err());
        assert!(AliasTable::build(vec!["x".into(), "y".into()], &[1.0]).is_err());
    }

    #[test]
    fn test_blob_length_invariant_and_roundtrip() {
        let rows = vec![
            row(7, 1, "US", 3.0),
            row(2, 0, "GB", 1.0),
            row(7, 0, "DE", 1.0),
            row(2, 1, "FR", 2.0),
        ];
        let enc = encode(&rows);
        let hl = enc.index.header_length;
        assert_eq!(
            LEN_PREFIX as u64 + hl + enc.header.payload_length,
            enc.header.total_length
        );
        assert_eq!(enc.blob.len() as u64, enc.header.total_length);

        let blob = AliasBlob::parse(&enc.blob).unwrap();
        assert_eq!(sha256_bytes(blob.payload()), enc.header.payload_sha256);
        blob.verify_index(&enc.index).unwrap();

        let global = enc.index.global().unwrap();
        assert_eq!(global.blob_offset, 0);
        assert_eq!(global.blob_length, enc.blob.len() as u64);
        assert_eq!(global.checksum, sha256_bytes(&enc.blob));

        let (m, table) = blob.table(enc.index.merchant(7).unwrap()).unwrap();
        assert_eq!(m, 7);
        assert_eq!(table.outcomes(), ["DE".to_string(), "US".to_string()]);
        let first = enc.index.merchant(2).unwrap();
        assert_eq!(first.blob_offset, LEN_PREFIX as u64 + hl);
    }

    #[test]
    fn test_encoding_is_order_independent() {
        let a = vec![row(1, 0, "GB", 1.0), row(1, 1, "US", 2.0), row(3, 0, "FR", 1.0)];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(encode(&a).blob, encode(&b).blob);
    }

    #[test]
    fn test_payload_tamper_detected() {
        let enc = encode(&[row(1, 0, "GB", 1.0), row(1, 1, "US", 1.0)]);
        let mut bytes = enc.blob.clone();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = AliasBlob::parse(&bytes).unwrap_err();
        assert_eq!(err.code, ErrorCode::SealedDigestMismatch);
    }

    #[test]
    fn test_duplicate_row_rejected() {
        let schemas = SchemaRegistry::builtin().unwrap();
        let err = AliasBlobEncoder::new(&AliasConfig::default())
            .encode(
                &[row(1, 0, "GB", 1.0), row(1, 0, "US", 1.0)],
                &[],
                &[],
                &schemas,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Schema);
    }

    #[test]
    fn test_header_iteration_bound() {
        let schemas = SchemaRegistry::builtin().unwrap();
        let cfg = AliasConfig {
            layout_version: 1,
            max_header_iterations: 1,
        };
        let err = AliasBlobEncoder::new(&cfg)
            .encode(&[row(1, 0, "GB", 1.0)], &[], &[], &schemas)
            .unwrap_err();
        assert!(err.message.contains("did not converge"));
    }
}
