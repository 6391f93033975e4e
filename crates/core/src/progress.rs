// crates/core/src/progress.rs
//! Progress extraction from the download tool's diagnostic output.
//!
//! The tool's line format is not a contract and drifts between releases, so
//! parsing is a pure, total function: every field is optional and a line that
//! cannot be understood simply yields an empty update.

use serde::Serialize;

// =============================================================================
// Recognised markers
// =============================================================================

/// Percent value ends right before this character.
const PERCENT_MARKER: char = '%';

/// Standalone token that introduces the transfer rate.
const SPEED_MARKER: &str = "at";

/// Substring of the token that ends the transfer rate (`2.3MiB/s`, `B/s`).
const RATE_UNIT_MARKER: &str = "/s";

/// The rate must end within this many tokens after [`SPEED_MARKER`].
const MAX_SPEED_TOKENS: usize = 3;

/// Standalone token that introduces the remaining-time estimate.
const ETA_MARKER: &str = "ETA";

/// Fields recognised in one output line. Absent fields must not overwrite
/// what a job already knows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.percent.is_none() && self.speed.is_none() && self.eta.is_none()
    }
}

/// Parse one line of tool output.
pub fn parse_progress_line(line: &str) -> ProgressUpdate {
    ProgressUpdate {
        percent: parse_percent(line),
        speed: parse_speed(line),
        eta: parse_eta(line),
    }
}

fn parse_percent(line: &str) -> Option<f64> {
    let (before, _) = line.split_once(PERCENT_MARKER)?;
    let token = before.split_whitespace().last()?;
    let value: f64 = token.parse().ok()?;
    (value.is_finite() && (0.0..=100.0).contains(&value)).then_some(value)
}

fn parse_speed(line: &str) -> Option<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == SPEED_MARKER)
        .find_map(|(at, _)| {
            let start = at + 1;
            let window = tokens.get(start..)?;
            let len = window
                .iter()
                .take(MAX_SPEED_TOKENS)
                .position(|t| t.contains(RATE_UNIT_MARKER))?;
            Some(window[..=len].join(" "))
        })
}

fn parse_eta(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    tokens.by_ref().find(|t| *t == ETA_MARKER)?;
    let eta = tokens.collect::<Vec<_>>().join(" ");
    (!eta.is_empty()).then_some(eta)
}
