//! Batch validation and planning
//!
//! Every problem is collected before anything runs; a batch with any issue
//! executes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::{BatchRequest, ResponseMode, DEFAULT_TIMEOUT, MAX_BACKENDS, MAX_CALLS};
use crate::command::{BatchPolicy, BatchTarget, CommandKind, CommandRequest};

/// One validation problem, tied to a call key when it concerns a single call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub key: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn batch(message: impl Into<String>) -> Self {
        Self {
            key: None,
            message: message.into(),
        }
    }

    fn call(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: Some(key.to_string()),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "[{}] {}", key, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// The batch was rejected
#[derive(Debug, Clone, thiserror::Error)]
#[error("batch rejected: {}", join_issues(.issues))]
pub struct BatchValidationError {
    pub issues: Vec<ValidationIssue>,
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A call ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    pub key: String,
    pub request: CommandRequest,
}

/// Calls sharing one target, in run order
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBucket {
    pub target: BatchTarget,
    pub calls: Vec<PlannedCall>,
}

/// A batch that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub buckets: Vec<PlannedBucket>,
    pub response_mode: ResponseMode,
    pub timeout: Duration,
}

impl ValidatedBatch {
    pub fn call_count(&self) -> usize {
        self.buckets.iter().map(|b| b.calls.len()).sum()
    }
}

/// Check a request and group its calls into buckets
pub fn validate(request: &BatchRequest) -> Result<ValidatedBatch, BatchValidationError> {
    let mut issues = Vec::new();

    let count = request.calls.len();
    if count == 0 || count > MAX_CALLS {
        issues.push(ValidationIssue::batch(format!(
            "batch must contain between 1 and {} calls (got {})",
            MAX_CALLS, count
        )));
    }

    let response_mode = match request.response_mode.as_deref() {
        None => ResponseMode::default(),
        Some(raw) => ResponseMode::parse(raw).unwrap_or_else(|| {
            issues.push(ValidationIssue::batch(format!(
                "invalid response_mode '{}' (expected auto, full, summary or refs)",
                raw
            )));
            ResponseMode::default()
        }),
    };

    let timeout = match request.timeout {
        None => DEFAULT_TIMEOUT,
        Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).unwrap_or_else(|_| {
            issues.push(ValidationIssue::batch(format!(
                "timeout {} is out of range",
                secs
            )));
            DEFAULT_TIMEOUT
        }),
        Some(secs) => {
            issues.push(ValidationIssue::batch(format!(
                "timeout must be a positive number of seconds (got {})",
                secs
            )));
            DEFAULT_TIMEOUT
        }
    };

    // BTreeMap iteration gives lexicographic key order, which is the run order
    let mut grouped: BTreeMap<BatchTarget, Vec<PlannedCall>> = BTreeMap::new();
    let mut backends = BTreeSet::new();

    for (key, call) in &request.calls {
        if key.trim().is_empty() {
            issues.push(ValidationIssue::call(key, "call key must not be empty"));
            continue;
        }

        let Some(kind) = CommandKind::parse(&call.command) else {
            issues.push(ValidationIssue::call(
                key,
                format!("unknown command '{}'", call.command),
            ));
            continue;
        };

        match kind.batch_policy() {
            BatchPolicy::Allowed => {}
            BatchPolicy::Denied | BatchPolicy::Unlisted => {
                issues.push(ValidationIssue::call(
                    key,
                    format!("command '{}' is not allowed in a batch", kind),
                ));
                continue;
            }
        }

        let present = |i: usize| call.args.get(i).is_some_and(|a| !a.is_empty());
        match kind {
            CommandKind::InvokeTool if !present(0) || !present(1) => {
                issues.push(ValidationIssue::call(
                    key,
                    "invoke-tool requires a server name and a tool name",
                ));
                continue;
            }
            CommandKind::DescribeTool if !present(0) => {
                issues.push(ValidationIssue::call(
                    key,
                    "describe-tool requires a server name",
                ));
                continue;
            }
            _ => {}
        }

        let target = kind.batch_target(&call.args);
        if let BatchTarget::Backend(name) = &target {
            backends.insert(name.clone());
        }

        grouped.entry(target).or_default().push(PlannedCall {
            key: key.clone(),
            request: CommandRequest {
                command: call.command.clone(),
                args: call.args.clone(),
                params: call.params.clone(),
            },
        });
    }

    if backends.len() > MAX_BACKENDS {
        issues.push(ValidationIssue::batch(format!(
            "batch targets {} backends (limit {})",
            backends.len(),
            MAX_BACKENDS
        )));
    }

    if !issues.is_empty() {
        return Err(BatchValidationError { issues });
    }

    let buckets = grouped
        .into_iter()
        .map(|(target, mut calls)| {
            calls.sort_by(|a, b| a.key.cmp(&b.key));
            PlannedBucket { target, calls }
        })
        .collect();

    Ok(ValidatedBatch {
        buckets,
        response_mode,
        timeout,
    })
}
