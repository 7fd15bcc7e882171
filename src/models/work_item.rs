//! Units of scheduling for the file copier and the resumable snapshot built from them.

use super::locator::Locator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read side of a transfer.
///
/// `egress_url`, when present, is an externally reachable read path that
/// bypasses cloud credential resolution (e.g. a proxying intermediary).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub locator: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_auth_type: Option<String>,
}

impl SourceFile {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            egress_url: None,
            egress_auth_type: None,
        }
    }
}

/// Write side of a transfer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationFile {
    pub locator: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl DestinationFile {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            storage_class: None,
        }
    }
}

/// State tag of a work item.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkType {
    Prepare,
    Single,
    MultipartStart,
    MultipartSegment,
    MultipartComplete,
}

/// One contiguous byte range of a multipart transfer.
///
/// `etag` is filled in for S3 destinations, `block_id` for Blob Storage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultipartSegment {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl MultipartSegment {
    pub fn is_committed(&self) -> bool {
        self.etag.is_some() || self.block_id.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MultipartData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Set on `MultipartSegment` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<MultipartSegment>,
    /// Set on `MultipartComplete` items when they are serialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<MultipartSegment>>,
}

/// Progress of one logical file copy through the state machine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(rename = "type")]
    pub work_type: WorkType,
    pub source_file: SourceFile,
    pub destination_file: DestinationFile,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart_data: Option<MultipartData>,
}

impl WorkItem {
    /// A fresh `Prepare` item for a file pair.
    pub fn prepare(source_file: SourceFile, destination_file: DestinationFile) -> Self {
        Self {
            work_type: WorkType::Prepare,
            source_file,
            destination_file,
            retries: 0,
            source_url: None,
            source_headers: None,
            content_length: None,
            content_type: None,
            last_modified: None,
            multipart_data: None,
        }
    }

    /// Same file, next state; retry budget resets on every transition.
    pub fn advance(&self, work_type: WorkType, multipart_data: Option<MultipartData>) -> Self {
        Self {
            work_type,
            retries: 0,
            multipart_data,
            ..self.clone()
        }
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.multipart_data
            .as_ref()
            .and_then(|m| m.upload_id.as_deref())
    }

    pub fn segment(&self) -> Option<&MultipartSegment> {
        self.multipart_data.as_ref().and_then(|m| m.segment.as_ref())
    }

    pub fn part_number(&self) -> Option<u32> {
        self.segment().map(|s| s.part_number)
    }

    pub fn url(&self) -> &str {
        self.source_file.locator.url()
    }
}

/// Complete resumable snapshot of a copy job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileCopierState {
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub files_total: u64,
    pub files_copied: u64,
    pub work_items: Vec<WorkItem>,
}

impl FileCopierState {
    pub fn is_empty(&self) -> bool {
        self.work_items.is_empty()
    }
}
