//! RNG audit log: one event per draw group plus running trace totals.
//!
//! # Layout
//!
//! ```text
//! <logs_root>/seed=<seed>/parameter_hash=<ph>/run_id=<run_id>/
//!     events/substream_label=<label>/part-00000.jsonl
//!     trace/rng_trace_log.jsonl
//! ```
//!
//! Every event row carries the counters before and after its draw group and
//! the `(blocks, draws)` it consumed. After each event a trace row with the
//! cumulative totals of its `(module, substream_label)` pair is appended, so
//! the last trace row of a pair always equals the sum over its events.
//!
//! Files are append-only. A partition has exactly one writer; the caller
//! enforces that. Opening a partition that already holds data fails with
//! `E_IMMUTABILITY`.

use crate::canonical::jsonl_line;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::fingerprint::{ManifestFingerprint, ParameterHash};
use crate::hashing::list_files_sorted;
use crate::rng::{Counter, DrawRecord, SubstreamKey};
use crate::schema::{ArtifactKind, SchemaRegistry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const EVENTS_DIR: &str = "events";
pub const TRACE_DIR: &str = "trace";
pub const EVENTS_FILE: &str = "part-00000.jsonl";
pub const TRACE_FILE: &str = "rng_trace_log.jsonl";

/// Identity of one run's log partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngLogContext {
    pub seed: u64,
    pub parameter_hash: ParameterHash,
    pub manifest_fingerprint: ManifestFingerprint,
    pub run_id: String,
}

impl RngLogContext {
    /// `<logs_root>/seed=../parameter_hash=../run_id=..`
    pub fn partition_dir(&self, logs_root: &Path) -> CoreResult<PathBuf> {
        check_segment("run_id", &self.run_id)?;
        Ok(logs_root
            .join(format!("seed={}", self.seed))
            .join(format!("parameter_hash={}", self.parameter_hash))
            .join(format!("run_id={}", self.run_id)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RngEvent {
    pub module: String,
    pub substream_label: String,
    pub entity: String,
    pub seed: u64,
    pub parameter_hash: ParameterHash,
    pub manifest_fingerprint: ManifestFingerprint,
    pub run_id: String,
    pub rng_counter_before_hi: u64,
    pub rng_counter_before_lo: u64,
    pub rng_counter_after_hi: u64,
    pub rng_counter_after_lo: u64,
    pub draws: u64,
    pub blocks: u64,
    pub payload: Value,
}

impl RngEvent {
    pub fn before(&self) -> Counter {
        Counter::new(self.rng_counter_before_hi, self.rng_counter_before_lo)
    }

    pub fn after(&self) -> Counter {
        Counter::new(self.rng_counter_after_hi, self.rng_counter_after_lo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRow {
    pub module: String,
    pub substream_label: String,
    pub seed: u64,
    pub parameter_hash: ParameterHash,
    pub run_id: String,
    pub events_total: u64,
    pub draws_total: u64,
    pub blocks_total: u64,
    pub rng_counter_after_hi: u64,
    pub rng_counter_after_lo: u64,
}

/// Cumulative totals of one `(module, substream_label)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TraceTotals {
    pub events_total: u64,
    pub draws_total: u64,
    pub blocks_total: u64,
}

impl TraceTotals {
    fn add(&mut self, blocks: u64, draws: u64) {
        self.events_total += 1;
        self.blocks_total += blocks;
        self.draws_total += draws;
    }
}

type PairKey = (String, String);

pub struct RngEventWriter<'a> {
    dir: PathBuf,
    context: RngLogContext,
    schemas: &'a SchemaRegistry,
    event_files: BTreeMap<String, BufWriter<File>>,
    trace_file: BufWriter<File>,
    totals: BTreeMap<PairKey, TraceTotals>,
}

impl std::fmt::Debug for RngEventWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RngEventWriter")
            .field("dir", &self.dir)
            .field("context", &self.context)
            .field("totals", &self.totals)
            .finish()
    }
}

impl<'a> RngEventWriter<'a> {
    /// Open the partition rooted at `dir`. The directory must be absent or empty.
    pub fn open(dir: &Path, context: RngLogContext, schemas: &'a SchemaRegistry) -> CoreResult<Self> {
        check_segment("run_id", &context.run_id)?;
        if dir.exists() && !list_files_sorted(dir)?.is_empty() {
            return Err(CoreError::new(
                ErrorCode::Immutability,
                "rng log partition already holds data",
            )
            .with_path(dir));
        }
        let trace_dir = dir.join(TRACE_DIR);
        std::fs::create_dir_all(&trace_dir).map_err(|e| CoreError::io(e, &trace_dir))?;
        let trace_file = open_append(&trace_dir.join(TRACE_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            context,
            schemas,
            event_files: BTreeMap::new(),
            trace_file,
            totals: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append the event for one committed draw group and its trace row.
    pub fn record(
        &mut self,
        key: &SubstreamKey,
        draw: &DrawRecord,
        payload: Value,
    ) -> CoreResult<()> {
        check_segment("substream_label", &key.label)?;
        let event = RngEvent {
            module: key.module.clone(),
            substream_label: key.label.clone(),
            entity: key.entity(),
            seed: self.context.seed,
            parameter_hash: self.context.parameter_hash.clone(),
            manifest_fingerprint: self.context.manifest_fingerprint.clone(),
            run_id: self.context.run_id.clone(),
            rng_counter_before_hi: draw.before.hi,
            rng_counter_before_lo: draw.before.lo,
            rng_counter_after_hi: draw.after.hi,
            rng_counter_after_lo: draw.after.lo,
            draws: draw.draws,
            blocks: draw.blocks,
            payload,
        };
        self.schemas.validate(ArtifactKind::RngEvent, &event)?;

        let totals = self
            .totals
            .entry((key.module.clone(), key.label.clone()))
            .or_default();
        totals.add(draw.blocks, draw.draws);
        let trace = TraceRow {
            module: key.module.clone(),
            substream_label: key.label.clone(),
            seed: self.context.seed,
            parameter_hash: self.context.parameter_hash.clone(),
            run_id: self.context.run_id.clone(),
            events_total: totals.events_total,
            draws_total: totals.draws_total,
            blocks_total: totals.blocks_total,
            rng_counter_after_hi: draw.after.hi,
            rng_counter_after_lo: draw.after.lo,
        };
        self.schemas.validate(ArtifactKind::RngTrace, &trace)?;

        let events_path = self.events_path(&key.label);
        if !self.event_files.contains_key(&key.label) {
            let parent = events_path.parent().unwrap_or(&self.dir);
            std::fs::create_dir_all(parent).map_err(|e| CoreError::io(e, parent))?;
            let file = open_append(&events_path)?;
            self.event_files.insert(key.label.clone(), file);
        }
        if let Some(file) = self.event_files.get_mut(&key.label) {
            file.write_all(&jsonl_line(&event)?)
                .map_err(|e| CoreError::io(e, &events_path))?;
        }
        let trace_path = self.dir.join(TRACE_DIR).join(TRACE_FILE);
        self.trace_file
            .write_all(&jsonl_line(&trace)?)
            .map_err(|e| CoreError::io(e, &trace_path))?;
        Ok(())
    }

    fn events_path(&self, label: &str) -> PathBuf {
        self.dir
            .join(EVENTS_DIR)
            .join(format!("substream_label={}", label))
            .join(EVENTS_FILE)
    }

    /// Flush and fsync every file; returns the final totals per pair.
    pub fn finish(mut self) -> CoreResult<BTreeMap<PairKey, TraceTotals>> {
        let trace_path = self.dir.join(TRACE_DIR).join(TRACE_FILE);
        sync(&mut self.trace_file, &trace_path)?;
        let labels: Vec<String> = self.event_files.keys().cloned().collect();
        for label in labels {
            let path = self.events_path(&label);
            if let Some(file) = self.event_files.get_mut(&label) {
                sync(file, &path)?;
            }
        }
        for ((module, label), t) in &self.totals {
            debug!(
                module = %module,
                substream_label = %label,
                events = t.events_total,
                blocks = t.blocks_total,
                draws = t.draws_total,
                "rng trace totals"
            );
        }
        Ok(self.totals)
    }
}

fn open_append(path: &Path) -> CoreResult<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::io(e, path))?;
    Ok(BufWriter::new(file))
}

fn sync(file: &mut BufWriter<File>, path: &Path) -> CoreResult<()> {
    file.flush().map_err(|e| CoreError::io(e, path))?;
    file.get_ref().sync_all().map_err(|e| CoreError::io(e, path))
}

fn check_segment(name: &str, value: &str) -> CoreResult<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
        || value.chars().any(|c| c.is_control());
    if bad {
        return Err(CoreError::config(format!(
            "{} '{}' is not usable as a path segment",
            name, value
        )));
    }
    Ok(())
}

/// Lazily parsed JSON-lines records. Blank lines are skipped.
pub struct JsonLines<R: BufRead, T> {
    reader: R,
    line_buffer: String,
    line_number: usize,
    _record: PhantomData<T>,
}

impl<R: BufRead, T> JsonLines<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_buffer: String::new(),
            line_number: 0,
            _record: PhantomData,
        }
    }

    /// 1-indexed number of the last line read.
    pub fn line_number(&self) -> usize {
        self.line_number
    }
}

impl<R: BufRead, T: DeserializeOwned> Iterator for JsonLines<R, T> {
    type Item = CoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line_buffer.clear();
            match self.reader.read_line(&mut self.line_buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_number += 1;
                    let line = self.line_buffer.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let result = serde_json::from_str::<T>(line).map_err(|e| {
                        CoreError::schema(format!(
                            "invalid record at line {}: {}",
                            self.line_number, e
                        ))
                    });
                    return Some(result);
                }
                Err(e) => return Some(Err(CoreError::from(e))),
            }
        }
    }
}

/// Read every record of a JSON-lines file.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> CoreResult<Vec<T>> {
    let file = File::open(path).map_err(|e| CoreError::io(e, path))?;
    JsonLines::new(BufReader::new(file))
        .collect::<CoreResult<Vec<T>>>()
        .map_err(|e| e.with_path(path))
}

/// Outcome of a successful partition audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub events: u64,
    pub pairs: BTreeMap<String, TraceTotals>,
}

/// Replay-verify a published partition.
///
/// Checks, per event, that `blocks` equals the counter delta; per substream
/// entity, that counters never move backwards; and per `(module, label)`,
/// that the last trace row equals the sum over its events.
pub fn verify_partition(dir: &Path) -> CoreResult<AuditReport> {
    let events_root = dir.join(EVENTS_DIR);
    let trace_path = dir.join(TRACE_DIR).join(TRACE_FILE);
    if !trace_path.exists() {
        return Err(CoreError::precondition("rng trace log not found").with_path(&trace_path));
    }

    let mut sums: BTreeMap<PairKey, TraceTotals> = BTreeMap::new();
    let mut last_after: BTreeMap<(String, String, String), Counter> = BTreeMap::new();
    let mut events = 0_u64;

    let files = if events_root.exists() {
        list_files_sorted(&events_root)?
    } else {
        Vec::new()
    };
    for (_, path) in files {
        for event in read_jsonl::<RngEvent>(&path)? {
            let subject = format!("{}/{}/{}", event.module, event.substream_label, event.entity);
            let delta = event.before().blocks_until(event.after());
            if delta != Some(event.blocks as u128) {
                return Err(CoreError::new(
                    ErrorCode::RngCounter,
                    format!(
                        "event blocks {} disagree with counters {} -> {}",
                        event.blocks,
                        event.before(),
                        event.after()
                    ),
                )
                .with_subject(subject)
                .with_path(&path));
            }
            let entity_key = (
                event.module.clone(),
                event.substream_label.clone(),
                event.entity.clone(),
            );
            if let Some(prev) = last_after.get(&entity_key) {
                if event.before() < *prev {
                    return Err(CoreError::new(
                        ErrorCode::RngCounter,
                        format!("counter moved backwards: {} < {}", event.before(), prev),
                    )
                    .with_subject(subject)
                    .with_path(&path));
                }
            }
            last_after.insert(entity_key, event.after());
            sums.entry((event.module.clone(), event.substream_label.clone()))
                .or_default()
                .add(event.blocks, event.draws);
            events += 1;
        }
    }

    let mut final_rows: BTreeMap<PairKey, TraceRow> = BTreeMap::new();
    for row in read_jsonl::<TraceRow>(&trace_path)? {
        final_rows.insert((row.module.clone(), row.substream_label.clone()), row);
    }

    if final_rows.len() != sums.len() || final_rows.keys().ne(sums.keys()) {
        return Err(CoreError::new(
            ErrorCode::RngCounter,
            "trace pairs do not match event pairs",
        )
        .with_path(dir));
    }
    let mut pairs = BTreeMap::new();
    for ((module, label), totals) in sums {
        let key = (module, label);
        let row = &final_rows[&key];
        let traced = TraceTotals {
            events_total: row.events_total,
            draws_total: row.draws_total,
            blocks_total: row.blocks_total,
        };
        if traced != totals {
            return Err(CoreError::new(
                ErrorCode::RngCounter,
                format!("trace totals {:?} disagree with event sums {:?}", traced, totals),
            )
            .with_subject(format!("{}/{}", key.0, key.1))
            .with_path(&trace_path));
        }
        pairs.insert(format!("{}/{}", key.0, key.1), totals);
    }

    info!(dir = %dir.display(), events, pairs = pairs.len(), "rng partition verified");
    Ok(AuditReport { events, pairs })
}
