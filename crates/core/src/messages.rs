//! JSON payloads exchanged on the AWS IoT Jobs topics.
//!
//! Requests are serialized with camelCase keys as the Jobs API expects.
//! Replies are parsed leniently: only the fields the agent acts on are
//! typed, everything else is ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobExecution, JobExecutionStatus};

/// Free-form `statusDetails` map. The Jobs API only accepts string values.
pub type StatusDetails = BTreeMap<String, String>;

/// Key of the timestamp attached to start-next requests.
pub const STARTED_AT: &str = "startedAt";

/// Build a single-entry `statusDetails` map holding an RFC 3339 timestamp.
pub fn timestamp_details(key: &str, at: DateTime<Utc>) -> StatusDetails {
    let mut details = StatusDetails::new();
    details.insert(
        key.to_string(),
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    details
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body published to `.../jobs/$next/start-next`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNextRequest {
    pub status_details: StatusDetails,
    pub client_token: String,
}

impl StartNextRequest {
    pub fn new(client_token: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status_details: timestamp_details(STARTED_AT, at),
            client_token: client_token.into(),
        }
    }
}

/// Body published to `.../jobs/<jobId>/update`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub status: JobExecutionStatus,
    pub status_details: StatusDetails,
    pub expected_version: i64,
    pub execution_number: i64,
    pub include_job_execution_state: bool,
    pub include_job_document: bool,
    pub client_token: String,
}

impl UpdateRequest {
    /// Terminal status report for `execution`, stamped with `at` under
    /// the status-specific key (`succeededAt` / `failedAt`).
    pub fn new(
        execution: &JobExecution,
        status: JobExecutionStatus,
        client_token: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            status,
            status_details: timestamp_details(status.timestamp_key(), at),
            expected_version: execution.version_number,
            execution_number: execution.execution_number,
            include_job_execution_state: false,
            include_job_document: false,
            client_token: client_token.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Reply on `notify-next` and `start-next/accepted`.
///
/// `execution` is kept raw so that a malformed execution can be told
/// apart from an absent one. It is `Some` whenever the key is present,
/// so `"execution": null` reads as `Some(Value::Null)`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextExecutionReply {
    #[serde(default, deserialize_with = "present")]
    pub execution: Option<serde_json::Value>,
    #[serde(default)]
    pub client_token: Option<String>,
}

impl NextExecutionReply {
    /// Whether the payload carried an `execution` key at all.
    pub fn has_execution(&self) -> bool {
        self.execution.is_some()
    }
}

fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Reply on the `rejected` channels.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedReply {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub client_token: Option<String>,
}

/// Parse a `notify-next` or `start-next/accepted` payload.
///
/// Returns `Err` for payloads that are not JSON of the expected shape.
pub fn parse_next_execution(payload: &[u8]) -> Result<NextExecutionReply, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Parse a `rejected` payload.
pub fn parse_rejected(payload: &[u8]) -> Result<RejectedReply, serde_json::Error> {
    serde_json::from_slice(payload)
}
