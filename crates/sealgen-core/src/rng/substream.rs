//! Substreams and transactional draw groups.
//!
//! A [`Substream`] owns its counter exclusively. All draws happen inside a
//! draw group ([`Substream::draw_group`]): the closure works on a scratch
//! [`DrawCursor`], and the substream only adopts the new counter and totals
//! when the closure succeeds. A failed group leaves the substream untouched.
//!
//! # Accounting
//!
//! - `blocks`: Philox blocks consumed (counter delta).
//! - `draws`: uniforms consumed. A block carries two lanes; single-uniform
//!   draws use the low lane and discard the high lane.

use super::key::SubstreamKey;
use super::philox::{philox2x64_10, Counter};
use crate::error::{CoreError, CoreResult, ErrorCode};
use serde::{Deserialize, Serialize};

/// Accounting for one committed draw group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRecord {
    pub before: Counter,
    pub after: Counter,
    pub blocks: u64,
    pub draws: u64,
}

#[derive(Debug, Clone)]
pub struct Substream {
    key: SubstreamKey,
    philox_key: u64,
    start: Counter,
    counter: Counter,
    blocks_total: u64,
    draws_total: u64,
    max_blocks: Option<u64>,
}

impl Substream {
    pub(crate) fn new(
        key: SubstreamKey,
        philox_key: u64,
        start: Counter,
        max_blocks: Option<u64>,
    ) -> Self {
        Self {
            key,
            philox_key,
            start,
            counter: start,
            blocks_total: 0,
            draws_total: 0,
            max_blocks,
        }
    }

    pub fn key(&self) -> &SubstreamKey {
        &self.key
    }

    pub fn philox_key(&self) -> u64 {
        self.philox_key
    }

    /// Counter at derivation time.
    pub fn start(&self) -> Counter {
        self.start
    }

    /// Next counter to be consumed.
    pub fn counter(&self) -> Counter {
        self.counter
    }

    pub fn blocks_total(&self) -> u64 {
        self.blocks_total
    }

    pub fn draws_total(&self) -> u64 {
        self.draws_total
    }

    /// Run `f` as one draw group and commit its accounting on success.
    pub fn draw_group<T>(
        &mut self,
        f: impl FnOnce(&mut DrawCursor) -> CoreResult<T>,
    ) -> CoreResult<(T, DrawRecord)> {
        let remaining = self
            .max_blocks
            .map(|max| max.saturating_sub(self.blocks_total));
        let mut cursor = DrawCursor {
            philox_key: self.philox_key,
            counter: self.counter,
            blocks: 0,
            draws: 0,
            budget_remaining: remaining,
            subject: self.subject(),
        };
        let value = f(&mut cursor)?;
        let record = DrawRecord {
            before: self.counter,
            after: cursor.counter,
            blocks: cursor.blocks,
            draws: cursor.draws,
        };
        self.commit(&record)?;
        Ok((value, record))
    }

    fn commit(&mut self, record: &DrawRecord) -> CoreResult<()> {
        let delta = record.before.blocks_until(record.after);
        if record.before != self.counter || delta != Some(record.blocks as u128) {
            return Err(CoreError::new(
                ErrorCode::RngCounter,
                format!(
                    "draw group accounting mismatch: before={} after={} blocks={}",
                    record.before, record.after, record.blocks
                ),
            )
            .with_subject(self.subject()));
        }
        self.counter = record.after;
        self.blocks_total += record.blocks;
        self.draws_total += record.draws;
        Ok(())
    }

    /// Move the counter forward to `target` without drawing (replay alignment).
    ///
    /// Moving backwards is a fatal `E_RNG_COUNTER`.
    pub fn advance_to(&mut self, target: Counter) -> CoreResult<u64> {
        let delta = self.counter.blocks_until(target).ok_or_else(|| {
            CoreError::new(
                ErrorCode::RngCounter,
                format!(
                    "counter may not decrease: current={} target={}",
                    self.counter, target
                ),
            )
            .with_subject(self.subject())
        })?;
        let delta = u64::try_from(delta).map_err(|_| {
            CoreError::new(ErrorCode::RngBudget, "advance exceeds u64 block accounting")
                .with_subject(self.subject())
        })?;
        if let Some(max) = self.max_blocks {
            if self.blocks_total.saturating_add(delta) > max {
                return Err(budget_error(max, &self.subject()));
            }
        }
        self.counter = target;
        self.blocks_total += delta;
        Ok(delta)
    }

    fn subject(&self) -> String {
        format!("{}/{}/{}", self.key.module, self.key.label, self.key.entity())
    }
}

fn budget_error(max: u64, subject: &str) -> CoreError {
    CoreError::new(
        ErrorCode::RngBudget,
        format!("substream exceeded its budget of {} blocks", max),
    )
    .with_subject(subject.to_string())
}

/// Scratch state of an open draw group.
#[derive(Debug)]
pub struct DrawCursor {
    philox_key: u64,
    counter: Counter,
    blocks: u64,
    draws: u64,
    budget_remaining: Option<u64>,
    subject: String,
}

/// 2^-53
const U01_SCALE: f64 = 1.0 / 9_007_199_254_740_992.0;

/// Map 64 random bits to the open interval (0, 1).
#[inline]
pub fn u01(bits: u64) -> f64 {
    ((bits >> 11) as f64 + 0.5) * U01_SCALE
}

impl DrawCursor {
    /// Consume one Philox block.
    pub fn next_block(&mut self) -> CoreResult<[u64; 2]> {
        if let Some(remaining) = self.budget_remaining {
            if remaining == 0 {
                return Err(CoreError::new(
                    ErrorCode::RngBudget,
                    "substream block budget exhausted",
                )
                .with_subject(self.subject.clone()));
            }
            self.budget_remaining = Some(remaining - 1);
        }
        let block = philox2x64_10(self.counter, self.philox_key);
        self.counter = self.counter.checked_add(1).ok_or_else(|| {
            CoreError::new(ErrorCode::RngCounter, "128-bit counter overflow")
                .with_subject(self.subject.clone())
        })?;
        self.blocks += 1;
        Ok(block)
    }

    /// One uniform in (0, 1): one block, low lane.
    pub fn uniform(&mut self) -> CoreResult<f64> {
        let [lo, _] = self.next_block()?;
        self.draws += 1;
        Ok(u01(lo))
    }

    /// Two uniforms in (0, 1) from a single block.
    pub fn uniform_pair(&mut self) -> CoreResult<(f64, f64)> {
        let [lo, hi] = self.next_block()?;
        self.draws += 2;
        Ok((u01(lo), u01(hi)))
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub(crate) fn subject(&self) -> &str {
        &self.subject
    }
}
