//! Batch execution
//!
//! A batch is a map of caller keys to read-only commands. Calls are grouped
//! by target backend; groups run concurrently while calls inside one group
//! run one at a time in lexicographic key order. Numeric ordering is the
//! caller's job (zero-pad keys such as `"01"`, `"02"`, `"10"`).

mod scheduler;
mod shaping;
mod validate;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use scheduler::BatchScheduler;
pub use validate::{
    validate, BatchValidationError, PlannedBucket, PlannedCall, ValidatedBatch, ValidationIssue,
};

/// Maximum number of calls in one batch
pub const MAX_CALLS: usize = 100;

/// Maximum number of distinct backends one batch may target
pub const MAX_BACKENDS: usize = 20;

/// Deadline applied when the request gives none
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Time in-flight calls get to finish after the deadline fires
pub const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// One call inside a batch request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCall {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

/// Batch request as received from a caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub calls: BTreeMap<String, BatchCall>,
    #[serde(default, alias = "response_mode", skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// How call outputs are returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// Inline small outputs, persist large ones with a preview
    #[default]
    Auto,
    /// Inline everything verbatim
    Full,
    /// Persist everything, inline a short preview
    Summary,
    /// Persist everything, inline a placeholder
    Refs,
}

impl ResponseMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "auto" => Some(ResponseMode::Auto),
            "full" => Some(ResponseMode::Full),
            "summary" => Some(ResponseMode::Summary),
            "refs" => Some(ResponseMode::Refs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Auto => "auto",
            ResponseMode::Full => "full",
            ResponseMode::Summary => "summary",
            ResponseMode::Refs => "refs",
        }
    }
}

/// Outcome of one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Aggregate counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl BatchSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a BatchResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            summary.total += 1;
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if result.timed_out {
                summary.timed_out += 1;
            }
        }
        summary
    }
}

/// Everything a batch produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub results: BTreeMap<String, BatchResult>,
    /// Keys in completion order; calls without a result come last
    pub order: Vec<String>,
    pub summary: BatchSummary,
    pub timed_out: bool,
    /// Effective mode after any size upgrade
    pub response_mode: ResponseMode,
    pub files: Vec<PathBuf>,
}

impl BatchOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.summary.failed == 0
    }
}
