//! Byte-stable JSON encodings.
//!
//! Two encodings are used:
//!
//! - [`to_pretty_ascii`]: persisted receipts and index files. Object keys are
//!   sorted bytewise, every non-ASCII char is written as a `\uXXXX` escape,
//!   indentation is two spaces and the document ends with `\n`.
//! - [`jcs_to_vec`]: RFC 8785 canonical bytes (`serde_jcs`) for headers that
//!   are hashed and embedded in binary layouts.
//!
//! JSON-lines records ([`jsonl_line`]) are compact `serde_json` output in
//! struct field order; u64 counters must survive exactly, which RFC 8785
//! number canonicalization does not promise above 2^53.
//!
//! Keys are re-inserted in sorted order before formatting, so the output does
//! not depend on which map type `serde_json` was built with.

use crate::error::{CoreError, CoreResult, ErrorCode};
use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter, Serializer};
use serde_json::{Map, Value};
use std::io::{self, Write};

/// Serialize to sorted-key, ASCII-only, two-space indented JSON.
pub fn to_pretty_ascii<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, AsciiPretty::new());
    value.serialize(&mut ser)?;
    out.push(b'\n');
    Ok(out)
}

/// Serialize to JCS (RFC 8785) canonical JSON bytes.
pub fn jcs_to_vec<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    serde_jcs::to_vec(value).map_err(|e| {
        CoreError::new(ErrorCode::Schema, "failed to serialize canonical json").with_source(e)
    })
}

/// One JSON-lines record: compact JSON plus `\n`.
pub fn jsonl_line<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Rebuild objects with keys inserted in bytewise order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// `PrettyFormatter` with a two-space indent that escapes non-ASCII as `\uXXXX`.
struct AsciiPretty<'a> {
    inner: PrettyFormatter<'a>,
}

impl AsciiPretty<'_> {
    fn new() -> Self {
        Self {
            inner: PrettyFormatter::with_indent(INDENT),
        }
    }
}

impl Formatter for AsciiPretty<'_> {
    fn begin_array<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.begin_array(w)
    }

    fn end_array<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.end_array(w)
    }

    fn begin_array_value<W: ?Sized + Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_array_value(w, first)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.end_array_value(w)
    }

    fn begin_object<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.begin_object(w)
    }

    fn end_object<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.end_object(w)
    }

    fn begin_object_key<W: ?Sized + Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_object_key(w, first)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(w)
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, w: &mut W) -> io::Result<()> {
        self.inner.end_object_value(w)
    }

    fn write_string_fragment<W: ?Sized + Write>(
        &mut self,
        w: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        let mut start = 0;
        for (i, c) in fragment.char_indices() {
            if c.is_ascii() {
                continue;
            }
            w.write_all(fragment[start..i].as_bytes())?;
            let mut units = [0_u16; 2];
            for unit in c.encode_utf16(&mut units) {
                write!(w, "\\u{:04x}", unit)?;
            }
            start = i + c.len_utf8();
        }
        w.write_all(fragment[start..].as_bytes())
    }
}

const INDENT: &[u8] = b"  ";
