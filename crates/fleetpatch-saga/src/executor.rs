//! Step executor — journaled, retrying, timeout-bounded step invocation.
//!
//! Every remote operation the saga performs goes through
//! [`StepExecutor::execute`]. The executor:
//!
//! 1. Consults the journal. A step with a recorded outcome is never invoked
//!    again; its output (or failure) is replayed.
//! 2. Runs each attempt as its own task, bounded by the step's timeout and,
//!    when configured, its heartbeat window. An attempt that overruns is
//!    abandoned: the executor stops waiting but does not cancel it.
//! 3. Retries transient failures with exponential backoff until the policy
//!    is exhausted, then records the outcome before returning it.
//!
//! Termination is checked before every attempt, while waiting on one, and
//! during backoff. A terminated step records nothing.

use std::future::Future;
use std::time::Duration;

use fleetpatch_state::{JournalStore, StepRecord, StepStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{StepError, StepFailure, StepResult};
use crate::ops::{AttemptContext, FailureClass, Heartbeat, HeartbeatState, OpError, OpResult};
use crate::policy::{StepOptions, StepPolicies};
use crate::signal::TerminationSignal;
use crate::step::{StepKey, StepKind};

/// How one attempt ended, from the executor's point of view.
enum AttemptOutcome<T> {
    Finished(OpResult<T>),
    TimedOut(Duration),
    HeartbeatMissed(Duration),
    Crashed(String),
    Terminated,
}

/// Executes steps for one campaign.
#[derive(Clone)]
pub struct StepExecutor {
    campaign_id: String,
    journal: JournalStore,
    policies: StepPolicies,
    termination: TerminationSignal,
}

impl StepExecutor {
    pub fn new(
        campaign_id: &str,
        journal: JournalStore,
        policies: StepPolicies,
        termination: TerminationSignal,
    ) -> Self {
        Self {
            campaign_id: campaign_id.to_string(),
            journal,
            policies,
            termination,
        }
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    pub fn termination(&self) -> &TerminationSignal {
        &self.termination
    }

    /// Run `op` as step `key` under the options configured for `kind`.
    ///
    /// `op` is called once per attempt with that attempt's context. The
    /// future it returns must own everything it touches: an abandoned
    /// attempt keeps running after the executor has moved on.
    pub async fn execute<T, F, Fut>(&self, key: &StepKey, kind: StepKind, op: F) -> StepResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = OpResult<T>> + Send + 'static,
    {
        if let Some(record) = self.journal.get_step(&self.campaign_id, key.as_str())? {
            debug!(campaign = %self.campaign_id, step = %key, status = ?record.status, "replaying journaled step");
            return replay(key, record);
        }

        let options = self.policies.options(kind);
        let mut attempt = 0u32;
        let mut last_details: Option<String> = None;

        loop {
            attempt += 1;
            if self.termination.is_terminated() {
                return Err(StepError::Terminated {
                    step: key.to_string(),
                });
            }

            let (heartbeat, mut beats) = Heartbeat::channel();
            let ctx = AttemptContext {
                attempt,
                heartbeat,
                last_heartbeat_details: last_details.clone(),
            };
            debug!(campaign = %self.campaign_id, step = %key, attempt, "attempt started");
            let handle = tokio::spawn(op(ctx));
            let outcome = self.await_attempt(handle, &mut beats, &options).await;
            if let Some(details) = beats.borrow().details.clone() {
                last_details = Some(details);
            }

            let error = match outcome {
                AttemptOutcome::Finished(Ok(value)) => {
                    let output = serde_json::to_value(&value).map_err(|e| StepError::Codec {
                        step: key.to_string(),
                        message: e.to_string(),
                    })?;
                    self.record(key, StepStatus::Completed, Some(output), None, attempt)?;
                    debug!(campaign = %self.campaign_id, step = %key, attempt, "step completed");
                    return Ok(value);
                }
                AttemptOutcome::Finished(Err(error)) => error,
                AttemptOutcome::TimedOut(limit) => OpError::transient(
                    "Timeout",
                    format!("attempt exceeded {}ms", limit.as_millis()),
                ),
                AttemptOutcome::HeartbeatMissed(window) => OpError::transient(
                    "HeartbeatTimeout",
                    format!("no heartbeat within {}ms", window.as_millis()),
                ),
                AttemptOutcome::Crashed(message) => OpError::transient("Panic", message),
                AttemptOutcome::Terminated => {
                    return Err(StepError::Terminated {
                        step: key.to_string(),
                    });
                }
            };

            if error.class == FailureClass::InvalidInput {
                warn!(campaign = %self.campaign_id, step = %key, %error, "step rejected its input");
                self.record(
                    key,
                    StepStatus::HardFault,
                    None,
                    Some(error.to_string()),
                    attempt,
                )?;
                return Err(StepError::HardFault {
                    step: key.to_string(),
                    message: error.to_string(),
                });
            }

            let non_retryable = options.retry.is_non_retryable(&error);
            if non_retryable || !options.retry.allows_another(attempt) {
                let status = if non_retryable {
                    StepStatus::NonRetryable
                } else {
                    StepStatus::Exhausted
                };
                warn!(
                    campaign = %self.campaign_id,
                    step = %key,
                    attempts = attempt,
                    %error,
                    ?status,
                    "step failed"
                );
                self.record(key, status, None, Some(error.to_string()), attempt)?;
                return Err(StepError::Failed(StepFailure {
                    step: key.to_string(),
                    last_error: error.to_string(),
                    attempts_made: attempt,
                    non_retryable,
                }));
            }

            let delay = options.retry.backoff(attempt);
            info!(
                campaign = %self.campaign_id,
                step = %key,
                attempt,
                %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.termination.terminated() => {
                    return Err(StepError::Terminated { step: key.to_string() });
                }
            }
        }
    }

    async fn await_attempt<T>(
        &self,
        mut handle: JoinHandle<OpResult<T>>,
        beats: &mut watch::Receiver<HeartbeatState>,
        options: &StepOptions,
    ) -> AttemptOutcome<T> {
        let deadline = Instant::now() + options.timeout;
        let window = options.heartbeat_timeout;
        let mut liveness = window.map(|w| Instant::now() + w);
        let mut beating = window.is_some();

        loop {
            let silence = async {
                match liveness {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Ok(result) => AttemptOutcome::Finished(result),
                        Err(e) => AttemptOutcome::Crashed(e.to_string()),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return AttemptOutcome::TimedOut(options.timeout);
                }
                _ = silence => {
                    return AttemptOutcome::HeartbeatMissed(window.unwrap_or_default());
                }
                changed = beats.changed(), if beating => {
                    match changed {
                        Ok(()) => liveness = window.map(|w| Instant::now() + w),
                        // The attempt dropped its heartbeat handle; it is about to finish.
                        Err(_) => beating = false,
                    }
                }
                _ = self.termination.terminated() => {
                    return AttemptOutcome::Terminated;
                }
            }
        }
    }

    fn record(
        &self,
        key: &StepKey,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        attempts: u32,
    ) -> StepResult<()> {
        let record = StepRecord {
            step: key.to_string(),
            status,
            output,
            error,
            attempts,
            recorded_at: crate::epoch_millis(),
        };
        self.journal
            .record_step(&self.campaign_id, key.as_str(), &record)?;
        Ok(())
    }
}

/// Reconstruct a step's result from its journal record.
fn replay<T: DeserializeOwned>(key: &StepKey, record: StepRecord) -> StepResult<T> {
    let last_error = record.error.unwrap_or_default();
    match record.status {
        StepStatus::Completed => {
            let output = record.output.unwrap_or(serde_json::Value::Null);
            serde_json::from_value(output).map_err(|e| StepError::Codec {
                step: key.to_string(),
                message: e.to_string(),
            })
        }
        StepStatus::HardFault => Err(StepError::HardFault {
            step: key.to_string(),
            message: last_error,
        }),
        StepStatus::Exhausted | StepStatus::NonRetryable => Err(StepError::Failed(StepFailure {
            step: key.to_string(),
            last_error,
            attempts_made: record.attempts,
            non_retryable: record.status == StepStatus::NonRetryable,
        })),
    }
}
