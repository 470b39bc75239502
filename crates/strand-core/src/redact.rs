//! Secret masking and output limiting.
//!
//! Every observable byte a step produces flows through here before it is
//! written to the store or shown to anything outside the process:
//!
//! - [`Redactor`] masks known secret values in text and JSON.
//! - [`RedactionBuffer`] redacts a chunked stream without missing secrets
//!   that straddle chunk boundaries.
//! - [`OutputLimiter`] caps accumulated output bytes without ever producing
//!   invalid UTF-8, even when multi-byte sequences are split across chunks.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

/// Replacement for masked values.
pub const REDACTED: &str = "***REDACTED***";

/// Key substrings that force a value to be treated as sensitive.
const SENSITIVE_TERMS: &[&str] = &[
    "api_key",
    "apikey",
    "token",
    "secret",
    "password",
    "passwd",
    "pwd",
    "auth",
    "credential",
    "access_key",
    "private_key",
];

/// Values shorter than this get word-boundary anchors so that masking them
/// does not clobber unrelated substrings.
const BOUNDARY_THRESHOLD: usize = 5;

/// Minimum value length considered maskable at all.
const MIN_SECRET_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Redactor
// ---------------------------------------------------------------------------

/// Masks secret values in text and JSON trees.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Plain substring secrets, longest first so overlapping secrets mask
    /// the longer match.
    plain: Vec<String>,
    /// Boundary-anchored patterns for short secrets.
    bounded: Vec<Regex>,
    /// Length of the longest secret (drives stream hold-back).
    longest: usize,
}

impl Redactor {
    /// Build a redactor from a secrets map plus values forced into masking
    /// regardless of key.
    ///
    /// A value is masked when its key contains a sensitive term or its
    /// length is at least 3 characters.
    pub fn new(secrets: &HashMap<String, String>, forced: &[String]) -> Self {
        let mut values: Vec<&str> = Vec::new();

        for (key, value) in secrets {
            let key_sensitive = {
                let lower = key.to_lowercase();
                SENSITIVE_TERMS.iter().any(|term| lower.contains(term))
            };
            if (key_sensitive || value.len() >= MIN_SECRET_LEN)
                && value.len() >= MIN_SECRET_LEN
            {
                values.push(value.as_str());
            }
        }
        for value in forced {
            if value.len() >= MIN_SECRET_LEN {
                values.push(value.as_str());
            }
        }

        values.sort_unstable();
        values.dedup();
        values.sort_unstable_by_key(|v| std::cmp::Reverse(v.len()));

        let mut plain = Vec::new();
        let mut bounded = Vec::new();
        let mut longest = 0;

        for value in values {
            longest = longest.max(value.len());
            if value.len() < BOUNDARY_THRESHOLD {
                let pattern = format!(r"\b{}\b", regex::escape(value));
                if let Ok(re) = Regex::new(&pattern) {
                    bounded.push(re);
                }
            } else {
                plain.push(value.to_string());
            }
        }

        Self {
            plain,
            bounded,
            longest,
        }
    }

    /// Length of the longest secret value; zero when nothing is masked.
    pub fn longest_secret_len(&self) -> usize {
        self.longest
    }

    /// Mask every secret occurrence in `text`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.plain {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        for re in &self.bounded {
            if re.is_match(&out) {
                out = re.replace_all(&out, REDACTED).into_owned();
            }
        }
        out
    }

    /// Recursively mask string leaves of a JSON value. Object keys are left
    /// alone; arrays and nested objects are walked.
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// RedactionBuffer
// ---------------------------------------------------------------------------

/// Streams chunks through a [`Redactor`] while holding back a tail the
/// length of the longest secret, so a secret split across two chunks is
/// still caught.
#[derive(Debug)]
pub struct RedactionBuffer {
    redactor: Redactor,
    pending: String,
}

impl RedactionBuffer {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            redactor,
            pending: String::new(),
        }
    }

    /// Feed a chunk; returns the redacted prefix that is safe to emit.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);

        let holdback = self.redactor.longest_secret_len().saturating_sub(1);
        if self.pending.len() <= holdback {
            return String::new();
        }

        // Find a char boundary at or before the emit point.
        let mut emit_end = self.pending.len() - holdback;
        while emit_end > 0 && !self.pending.is_char_boundary(emit_end) {
            emit_end -= 1;
        }

        let prefix = self.pending[..emit_end].to_string();
        let rest = self.pending[emit_end..].to_string();

        // A secret spanning the cut would be missed if prefix and rest were
        // redacted independently. Compare the two-halves redaction against a
        // single pass over the whole buffer; on mismatch, keep buffering
        // until the occurrence completes.
        let whole = self.redactor.redact(&self.pending);
        let halves = format!(
            "{}{}",
            self.redactor.redact(&prefix),
            self.redactor.redact(&rest)
        );
        if halves != whole {
            return String::new();
        }

        self.pending = rest;
        self.redactor.redact(&prefix)
    }

    /// Drain whatever is buffered, fully redacted.
    pub fn flush(&mut self) -> String {
        let out = self.redactor.redact(&self.pending);
        self.pending.clear();
        out
    }
}

// ---------------------------------------------------------------------------
// Utf8Chunker
// ---------------------------------------------------------------------------

/// Incremental UTF-8 decoder for byte streams whose chunks may split
/// multi-byte sequences. Carries at most three pending bytes between pushes;
/// truly invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    carry: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of the stream as is complete so far.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or(""));
                    match e.error_len() {
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            // Incomplete trailing sequence: carry it over.
                            self.carry = rest[valid..].to_vec();
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush a dangling incomplete sequence as U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            String::new()
        } else {
            self.carry.clear();
            "\u{FFFD}".to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// OutputLimiter
// ---------------------------------------------------------------------------

/// Truncation marker appended when the cap is hit.
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// Accumulates output up to a byte cap with incremental UTF-8 decoding.
///
/// Chunks may split multi-byte sequences anywhere; up to three trailing bytes
/// are carried between pushes so the accumulated text is always valid UTF-8.
#[derive(Debug)]
pub struct OutputLimiter {
    max_bytes: usize,
    text: String,
    carry: Vec<u8>,
    truncated: bool,
    total_seen: usize,
}

impl OutputLimiter {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            text: String::new(),
            carry: Vec::new(),
            truncated: false,
            total_seen: 0,
        }
    }

    /// Whether the cap has been hit.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Total bytes offered, including dropped ones.
    pub fn total_seen(&self) -> usize {
        self.total_seen
    }

    /// Feed raw bytes.
    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.total_seen += chunk.len();
        if self.truncated {
            return;
        }

        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        // Split off an incomplete trailing sequence (at most 3 bytes).
        let valid_to = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_some() {
                    // Truly invalid byte, not a split sequence: replace it so
                    // the stream keeps flowing.
                    let (head, _) = bytes.split_at(valid);
                    self.append_str(std::str::from_utf8(head).unwrap_or(""));
                    self.append_str("\u{FFFD}");
                    let skip = valid + e.error_len().unwrap_or(1);
                    let rest: Vec<u8> = bytes[skip..].to_vec();
                    self.carry.clear();
                    self.push_bytes_inner(rest);
                    return;
                }
                valid
            }
        };

        let (head, tail) = bytes.split_at(valid_to);
        self.carry = tail.to_vec();
        if let Ok(s) = std::str::from_utf8(head) {
            self.append_str(s);
        }
    }

    fn push_bytes_inner(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        // Recursive tail handling after replacing an invalid byte. The total
        // was already counted by the caller.
        self.total_seen -= bytes.len();
        self.push_bytes(&bytes);
    }

    /// Feed already-decoded text.
    pub fn push_str(&mut self, chunk: &str) {
        self.total_seen += chunk.len();
        if self.truncated {
            return;
        }
        self.append_str(chunk);
    }

    fn append_str(&mut self, chunk: &str) {
        let room = self.max_bytes.saturating_sub(self.text.len());
        if chunk.len() <= room {
            self.text.push_str(chunk);
            return;
        }

        // Cut on a char boundary at or before the remaining room.
        let mut cut = room;
        while cut > 0 && !chunk.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&chunk[..cut]);
        self.text.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }

    /// Final accumulated text (valid UTF-8, capped).
    pub fn into_string(self) -> String {
        self.text
    }

    /// Borrow the accumulated text.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
