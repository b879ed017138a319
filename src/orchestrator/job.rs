//! Job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Product,
    Store,
    Category,
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "product" => Ok(JobKind::Product),
            "store" => Ok(JobKind::Store),
            "category" => Ok(JobKind::Category),
            other => anyhow::bail!("unknown job kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Marker key flagging a result as partial. Stripped from the final
/// payload on completion.
pub const PARTIAL_FLAG: &str = "isPartial";

/// One unit of work. Mutated only by the orchestrator; callers observe
/// read-only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub normalized_url: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_proxy: Option<String>,
}

impl Job {
    #[must_use]
    pub fn new(normalized_url: String, kind: JobKind, ephemeral_proxy: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            normalized_url,
            kind,
            status: JobStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            ephemeral_proxy,
        }
    }

    /// Live jobs dedupe new enqueues for the same URL.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Processing)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    #[must_use]
    pub fn result_is_partial(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.get(PARTIAL_FLAG))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Tag a payload as partial before it lands on a job.
#[must_use]
pub fn mark_partial(mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.insert(PARTIAL_FLAG.to_string(), Value::Bool(true));
        payload
    } else {
        serde_json::json!({ "value": payload, PARTIAL_FLAG: true })
    }
}

/// Strip the partial marker from a final payload.
#[must_use]
pub fn strip_partial(mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        map.remove(PARTIAL_FLAG);
    }
    payload
}
