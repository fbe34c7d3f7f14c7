//! Job execution model.
//!
//! A [`JobExecution`] is one attempt at running a job on this thing, as
//! handed out by the start-next reply. Its `jobDocument` is opaque to the
//! protocol; only the executor interprets it, via [`JobDocument`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// One execution of a job, as described by the job queue.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub job_id: String,
    /// Incremented by the server on every accepted update. Sent back as
    /// `expectedVersion` for optimistic concurrency.
    pub version_number: i64,
    pub execution_number: i64,
    /// Opaque payload; `null` when the job carries no document.
    #[serde(default)]
    pub job_document: serde_json::Value,
}

impl JobExecution {
    /// Parse the `execution` object of a notify-next or start-next reply.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value.clone())
            .map_err(|e| CoreError::MalformedExecution(e.to_string()))
    }
}

/// The two fields of a job document the executor consumes.
///
/// Both are optional; an absent or `null` field is `None`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct JobDocument {
    #[serde(default)]
    pub tasks: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub vars: Option<serde_json::Map<String, serde_json::Value>>,
}

impl JobDocument {
    /// Extract `tasks` and `vars` from a raw job document.
    ///
    /// A `null` document is treated as empty. Unknown keys are ignored.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
    }
}

/// Terminal statuses the agent reports for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobExecutionStatus {
    Succeeded,
    Failed,
}

impl JobExecutionStatus {
    /// Map an executor outcome to the status reported for it.
    pub fn from_outcome(succeeded: bool) -> Self {
        if succeeded {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }

    /// Key of the timestamp placed in `statusDetails`.
    pub fn timestamp_key(self) -> &'static str {
        match self {
            Self::Succeeded => "succeededAt",
            Self::Failed => "failedAt",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn parse_execution() {
        let value = json!({
            "jobId": "job-1",
            "thingName": "pi-01",
            "status": "QUEUED",
            "versionNumber": 3,
            "executionNumber": 1,
            "queuedAt": 1700000000,
            "jobDocument": {"tasks": [{"shell": "uptime"}]}
        });
        let execution = JobExecution::from_value(&value).unwrap();
        assert_eq!(execution.job_id, "job-1");
        assert_eq!(execution.version_number, 3);
        assert_eq!(execution.execution_number, 1);
        assert_eq!(execution.job_document["tasks"][0]["shell"], "uptime");
    }

    #[test]
    fn execution_without_document_has_null_document() {
        let value = json!({"jobId": "j", "versionNumber": 1, "executionNumber": 1});
        let execution = JobExecution::from_value(&value).unwrap();
        assert!(execution.job_document.is_null());
    }

    #[test]
    fn execution_missing_required_field_is_malformed() {
        let value = json!({"jobId": "j", "executionNumber": 1});
        assert_matches!(
            JobExecution::from_value(&value),
            Err(CoreError::MalformedExecution(_))
        );
        assert_matches!(
            JobExecution::from_value(&json!("not an object")),
            Err(CoreError::MalformedExecution(_))
        );
    }

    #[test]
    fn document_with_tasks_and_vars() {
        let doc = JobDocument::from_value(&json!({
            "tasks": [{"debug": {"msg": "{{ greeting }}"}}],
            "vars": {"greeting": "hi"},
            "extra": true
        }))
        .unwrap();
        assert_eq!(doc.tasks.as_ref().map(Vec::len), Some(1));
        assert_eq!(doc.vars.unwrap()["greeting"], "hi");
    }

    #[test]
    fn document_missing_fields_is_empty() {
        assert_eq!(JobDocument::from_value(&json!({})).unwrap(), JobDocument::default());
        assert_eq!(
            JobDocument::from_value(&serde_json::Value::Null).unwrap(),
            JobDocument::default()
        );
        let doc = JobDocument::from_value(&json!({"tasks": null, "vars": null})).unwrap();
        assert!(doc.tasks.is_none());
        assert!(doc.vars.is_none());
    }

    #[test]
    fn document_with_wrong_shape_is_error() {
        assert!(JobDocument::from_value(&json!({"tasks": "uptime"})).is_err());
        assert!(JobDocument::from_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_value(JobExecutionStatus::Succeeded).unwrap(),
            "SUCCEEDED"
        );
        assert_eq!(serde_json::to_value(JobExecutionStatus::Failed).unwrap(), "FAILED");
        assert_eq!(JobExecutionStatus::from_outcome(true), JobExecutionStatus::Succeeded);
        assert_eq!(JobExecutionStatus::from_outcome(false).timestamp_key(), "failedAt");
    }
}
