//! Bucketed batch execution under a deadline

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::shaping::{effective_mode, Shaper};
use super::validate::{validate, BatchValidationError, PlannedCall};
use super::{BatchOutcome, BatchRequest, BatchResult, BatchSummary, GRACE_PERIOD};
use crate::command::{CommandOutput, CommandRunner};

enum CallEvent {
    Started(String),
    Finished {
        key: String,
        output: CommandOutput,
        duration: Duration,
    },
}

/// Runs validated batches against a [`CommandRunner`]
#[derive(Clone)]
pub struct BatchScheduler {
    runner: Arc<dyn CommandRunner>,
    output_dir: PathBuf,
    grace_period: Duration,
}

impl BatchScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            output_dir: output_dir.into(),
            grace_period: GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Validate, run, and shape a batch
    pub async fn execute(&self, request: &BatchRequest) -> Result<BatchOutcome, BatchValidationError> {
        let plan = validate(request)?;
        let batch_id = uuid::Uuid::new_v4().to_string();
        let all_keys: Vec<String> = plan
            .buckets
            .iter()
            .flat_map(|b| b.calls.iter().map(|c| c.key.clone()))
            .collect();

        tracing::info!(
            "Batch {}: {} calls in {} buckets (timeout {:?})",
            batch_id,
            all_keys.len(),
            plan.buckets.len(),
            plan.timeout
        );

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handles: Vec<_> = plan
            .buckets
            .into_iter()
            .map(|bucket| {
                tracing::debug!(
                    "Batch {}: bucket {} with {} calls",
                    batch_id,
                    bucket.target.label(),
                    bucket.calls.len()
                );
                tokio::spawn(run_bucket(
                    self.runner.clone(),
                    bucket.calls,
                    token.clone(),
                    tx.clone(),
                ))
            })
            .collect();
        drop(tx);

        let all = futures_util::future::join_all(handles);
        tokio::pin!(all);

        let deadline_hit = tokio::select! {
            _ = &mut all => false,
            _ = tokio::time::sleep(plan.timeout) => true,
        };

        if deadline_hit {
            tracing::warn!(
                "Batch {} hit its {:?} deadline, waiting {:?} for in-flight calls",
                batch_id,
                plan.timeout,
                self.grace_period
            );
            token.cancel();
            let _ = tokio::time::timeout(self.grace_period, &mut all).await;
        }

        let mut started = HashSet::new();
        let mut finished: HashMap<String, BatchResult> = HashMap::new();
        let mut order = Vec::with_capacity(all_keys.len());
        while let Ok(event) = rx.try_recv() {
            match event {
                CallEvent::Started(key) => {
                    started.insert(key);
                }
                CallEvent::Finished {
                    key,
                    output,
                    duration,
                } => {
                    order.push(key.clone());
                    finished.insert(key, finished_result(output, duration));
                }
            }
        }

        let mut results = BTreeMap::new();
        let mut missing = Vec::new();
        for key in all_keys {
            let result = match finished.remove(&key) {
                Some(result) => result,
                None => {
                    missing.push(key.clone());
                    timed_out_result(started.contains(&key), plan.timeout)
                }
            };
            results.insert(key, result);
        }
        order.extend(missing);

        let mode = effective_mode(plan.response_mode, &results);
        let files = Shaper::new(mode, self.output_dir.join(&batch_id))
            .apply(&mut results)
            .await;

        let summary = BatchSummary::from_results(results.values());
        tracing::info!(
            "Batch {} done: {}/{} succeeded, {} timed out",
            batch_id,
            summary.succeeded,
            summary.total,
            summary.timed_out
        );

        Ok(BatchOutcome {
            results,
            order,
            timed_out: deadline_hit || summary.timed_out > 0,
            summary,
            response_mode: mode,
            files,
        })
    }
}

/// Run one bucket's calls in order, stopping once the token is cancelled
async fn run_bucket(
    runner: Arc<dyn CommandRunner>,
    calls: Vec<PlannedCall>,
    token: CancellationToken,
    events: mpsc::UnboundedSender<CallEvent>,
) {
    for call in calls {
        if token.is_cancelled() {
            break;
        }
        let _ = events.send(CallEvent::Started(call.key.clone()));
        let started = Instant::now();
        let output = runner.run(&call.request).await;
        let _ = events.send(CallEvent::Finished {
            key: call.key,
            output,
            duration: started.elapsed(),
        });
    }
}

fn finished_result(output: CommandOutput, duration: Duration) -> BatchResult {
    BatchResult {
        success: output.success,
        output: output.output,
        error: output.error,
        duration_ms: duration.as_millis() as u64,
        ..Default::default()
    }
}

fn timed_out_result(started: bool, timeout: Duration) -> BatchResult {
    let error = if started {
        format!("call still running when the {:?} batch timeout expired", timeout)
    } else {
        format!("call not started before the {:?} batch timeout expired", timeout)
    };
    BatchResult {
        success: false,
        error: Some(error),
        timed_out: true,
        ..Default::default()
    }
}
