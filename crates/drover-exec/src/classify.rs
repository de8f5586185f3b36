//! Classification of raw completion signals into execution statuses.
//!
//! The cluster reports a job's fate through several overlapping channels: a
//! tri-state success verdict derived from completion conditions, a free-form
//! termination payload written by the job runtime, a job-level failure
//! reason, and a container-level termination reason. [`classify`] folds those
//! into one [`Classified`] verdict.
//!
//! Classification never errors: unknown payload tokens degrade to
//! `PLATFORM_ERROR` rather than failing the reconciliation pass.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::ExecutionStatus;

/// Job-level failure reason for a run that exceeded its active deadline.
///
/// The deadline is part of the job's own spec, so exceeding it is attributed
/// to the user.
pub const DEADLINE_EXCEEDED_REASON: &str = "DeadlineExceeded";

/// Container-level termination reason for an out-of-memory kill.
pub const OUT_OF_MEMORY_REASON: &str = "OOMKilled";

/// Message recorded when a container was killed for exceeding its memory.
pub const OUT_OF_MEMORY_MESSAGE: &str =
    "Out of memory error on the K8S pod. Please optimize your data job.";

/// Key under which the termination payload carries its status token.
pub const PAYLOAD_STATUS_KEY: &str = "status";

/// Key under which the termination payload carries the runtime version.
pub const PAYLOAD_RUNTIME_VERSION_KEY: &str = "vdk_version";

/// Raw completion signal for one execution, as observed on the cluster.
///
/// Ephemeral: consumed once by [`classify`], never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminationSignal {
    /// Cluster-level verdict; `None` while the job is still running.
    pub succeeded: Option<bool>,
    /// Free-form termination payload written by the job runtime, if any.
    pub payload: Option<String>,
    /// Job-level termination reason, if any.
    pub job_reason: Option<String>,
    /// Container-level termination reason, if any.
    pub container_reason: Option<String>,
    /// When the job's pod started, if observed.
    pub start_time: Option<DateTime<Utc>>,
}

/// Normalized classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    /// The normalized execution status.
    pub status: ExecutionStatus,
    /// Human-readable outcome message; empty when nothing useful was reported.
    pub message: String,
    /// Runtime version extracted from the payload; empty when absent.
    pub runtime_version: String,
}

impl Classified {
    fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            message: String::new(),
            runtime_version: String::new(),
        }
    }
}

/// Classifies a raw completion signal.
///
/// In order:
/// 1. No cluster verdict yet: `RUNNING` if a start time was observed, else
///    `SUBMITTED`.
/// 2. Base status from the cluster verdict: `SUCCEEDED` or `PLATFORM_ERROR`.
/// 3. A non-blank payload overrides the base status. The payload is either a
///    JSON object with a `status` token (plus optional runtime version) or a
///    bare status token; unknown tokens map to `PLATFORM_ERROR`. A
///    cluster-level success can still be an application-level failure.
/// 4. With no payload and a failed base, the job and container reasons are
///    consulted: a blown deadline and an out-of-memory kill are both the
///    user's to fix.
#[must_use]
pub fn classify(signal: &TerminationSignal) -> Classified {
    let Some(succeeded) = signal.succeeded else {
        return Classified::new(if signal.start_time.is_some() {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Submitted
        });
    };

    let base = if succeeded {
        ExecutionStatus::Succeeded
    } else {
        ExecutionStatus::PlatformError
    };

    let payload = signal
        .payload
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());

    if let Some(payload) = payload {
        let (token, runtime_version) = parse_payload(payload);
        return Classified {
            status: map_token(token.as_deref().unwrap_or_default()),
            message: payload.to_string(),
            runtime_version,
        };
    }

    if base == ExecutionStatus::PlatformError {
        let mut verdict = Classified::new(ExecutionStatus::PlatformError);
        if signal.job_reason.as_deref() == Some(DEADLINE_EXCEEDED_REASON) {
            verdict.status = ExecutionStatus::UserError;
        }
        // The container reason wins independently of the job reason: an
        // OOM kill is user-attributable even when the job object reports
        // something else.
        if signal.container_reason.as_deref() == Some(OUT_OF_MEMORY_REASON) {
            verdict.status = ExecutionStatus::UserError;
            verdict.message = OUT_OF_MEMORY_MESSAGE.to_string();
        }
        return verdict;
    }

    Classified::new(base)
}

/// Splits a termination payload into its status token and runtime version.
///
/// A payload that parses as a JSON object yields the `status` member (absent
/// means no token) and the runtime version; anything else is treated as a
/// bare status token.
fn parse_payload(payload: &str) -> (Option<String>, String) {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => {
            let token = map
                .get(PAYLOAD_STATUS_KEY)
                .and_then(Value::as_str)
                .map(str::to_string);
            let runtime_version = map
                .get(PAYLOAD_RUNTIME_VERSION_KEY)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (token, runtime_version)
        }
        _ => (Some(payload.to_string()), String::new()),
    }
}

/// Maps a status token through the fixed vocabulary.
///
/// Matching ignores case and separator characters so `"User Error"`,
/// `"USER_ERROR"`, and `"user-error"` all land on the same status. Unknown
/// tokens degrade to `PLATFORM_ERROR`.
fn map_token(token: &str) -> ExecutionStatus {
    let normalized: String = token
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "succeeded" | "success" => ExecutionStatus::Succeeded,
        "usererror" => ExecutionStatus::UserError,
        "skipped" => ExecutionStatus::Skipped,
        _ => ExecutionStatus::PlatformError,
    }
}
