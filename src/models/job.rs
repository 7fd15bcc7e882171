//! Job assignment documents and the worker request envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PROBLEM_TYPE_PREFIX: &str = "uri://mcma.ebu.ch/rfc7807/cloud-storage-service/";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    New,
    Pending,
    Assigned,
    Queued,
    Scheduled,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

/// Category of a job failure; becomes the last segment of the problem `type` URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProblemKind {
    CopyFailure,
    GenericFailure,
    InvalidInput,
    MissingInputParameter,
    PriorityTypeNotRecognized,
    DurationInDaysHasInvalidValue,
    LocatorTypeNotSupported,
    ObjectInUnsupportedStorageClass,
    NoSuitableObjectsDetected,
}

impl ProblemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProblemKind::CopyFailure => "copy-failure",
            ProblemKind::GenericFailure => "generic-failure",
            ProblemKind::InvalidInput => "invalid-input",
            ProblemKind::MissingInputParameter => "missing-input-parameter",
            ProblemKind::PriorityTypeNotRecognized => "priority-type-not-recognized",
            ProblemKind::DurationInDaysHasInvalidValue => "duration-in-days-has-invalid-value",
            ProblemKind::LocatorTypeNotSupported => "locator-type-not-supported",
            ProblemKind::ObjectInUnsupportedStorageClass => "object-in-unsupported-storage-class",
            ProblemKind::NoSuitableObjectsDetected => "no-suitable-objects-detected",
        }
    }
}

/// RFC 7807 problem document stored on a failed job assignment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProblemDetail {
    pub fn new(kind: ProblemKind, title: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            problem_type: format!("{}{}", PROBLEM_TYPE_PREFIX, kind.as_str()),
            title: title.into(),
            detail,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobAssignment {
    pub id: String,
    pub profile_name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub job_input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Value>,
    pub date_modified: DateTime<Utc>,
}

impl JobAssignment {
    pub fn new(id: impl Into<String>, profile_name: impl Into<String>, job_input: Value) -> Self {
        Self {
            id: id.into(),
            profile_name: profile_name.into(),
            status: JobStatus::New,
            job_input,
            job_output: None,
            progress: None,
            error: None,
            tracker: None,
            date_modified: Utc::now(),
        }
    }
}

/// Body of a worker invocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub operation_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<Value>,
}

impl WorkerRequest {
    pub fn new(operation_name: impl Into<String>, input: Value) -> Self {
        Self {
            operation_name: operation_name.into(),
            input,
            tracker: None,
        }
    }
}
