//! Result Interpreter
//!
//! Maps raw classifier output to a [`Verdict`].
//!
//! Legacy mode compares the raw bytes against `real` exactly. An exact match
//! produces the "Fake" sentence with `is_fake = false`; every other output
//! (empty, `realistic`, `real\n`, error text) produces the "Real" sentence
//! with `is_fake = true`. Strict mode trims the output and accepts only
//! `real` or `fake`.
//!
//! The classifier contract carries no score, so confidence is always the
//! `0.00` placeholder.

use dfd_common::config::VerdictMode;
use thiserror::Error;

/// Token the classifier emits for a genuine video
pub const REAL_TOKEN: &[u8] = b"real";

/// Token the classifier emits for a manipulated video (strict mode only)
pub const FAKE_TOKEN: &[u8] = b"fake";

pub const FAKE_LABEL: &str = "The video is classified as Fake";
pub const REAL_LABEL: &str = "The video is classified as Real";

/// Confidence reported for every verdict
pub const PLACEHOLDER_CONFIDENCE: f64 = 0.0;

/// Structured classification outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub label: String,
    pub confidence_text: String,
    pub is_fake: bool,
}

impl Verdict {
    fn new(label: &str, is_fake: bool) -> Self {
        Self {
            label: label.to_string(),
            confidence_text: format!("{:.2}", PLACEHOLDER_CONFIDENCE),
            is_fake,
        }
    }
}

/// Strict mode saw something other than `real` or `fake`
#[derive(Debug, Error)]
#[error("unrecognized classifier output: {output:?}")]
pub struct UnrecognizedOutput {
    pub output: String,
}

/// Legacy mapping; total over every byte sequence
pub fn interpret(raw_output: &[u8]) -> Verdict {
    if raw_output == REAL_TOKEN {
        Verdict::new(FAKE_LABEL, false)
    } else {
        Verdict::new(REAL_LABEL, true)
    }
}

/// Trimmed output must be exactly `real` or `fake`
pub fn interpret_strict(raw_output: &[u8]) -> Result<Verdict, UnrecognizedOutput> {
    match trim_whitespace(raw_output) {
        REAL_TOKEN => Ok(Verdict::new(REAL_LABEL, false)),
        FAKE_TOKEN => Ok(Verdict::new(FAKE_LABEL, true)),
        _ => Err(UnrecognizedOutput {
            output: String::from_utf8_lossy(raw_output).into_owned(),
        }),
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Dispatch on the configured mode
pub fn interpret_with(mode: VerdictMode, raw_output: &[u8]) -> Result<Verdict, UnrecognizedOutput> {
    match mode {
        VerdictMode::Legacy => Ok(interpret(raw_output)),
        VerdictMode::Strict => interpret_strict(raw_output),
    }
}
