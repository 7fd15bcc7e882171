//! Shared ledger of archive restores and the restore status header format.

use super::locator::Locator;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;

const RESTORE_WORK_ITEM_PATH: &str = "/restore-work-items";

/// One record per distinct archived object, listing every job assignment
/// waiting for its restore to finish.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreWorkItem {
    pub id: String,
    pub file: Locator,
    #[serde(default)]
    pub job_assignment_database_ids: Vec<String>,
}

impl RestoreWorkItem {
    pub fn new(file: Locator) -> Self {
        Self {
            id: build_restore_work_item_id(&file),
            file,
            job_assignment_database_ids: Vec::new(),
        }
    }

    /// Register a waiting job. Returns false if it was already registered.
    pub fn add_job_assignment(&mut self, job_assignment_database_id: &str) -> bool {
        if self
            .job_assignment_database_ids
            .iter()
            .any(|id| id == job_assignment_database_id)
        {
            return false;
        }
        self.job_assignment_database_ids
            .push(job_assignment_database_id.to_string());
        true
    }
}

pub fn restore_work_item_path() -> &'static str {
    RESTORE_WORK_ITEM_PATH
}

/// Deterministic id for an archived object: its URL with every run of `:`
/// and `/` collapsed into a single `-`.
pub fn build_restore_work_item_id(locator: &Locator) -> String {
    let mut normalized = String::with_capacity(locator.url().len());
    let mut in_separator = false;
    for c in locator.url().chars() {
        if c == ':' || c == '/' {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.push(c);
            in_separator = false;
        }
    }
    format!("{}/{}", RESTORE_WORK_ITEM_PATH, normalized)
}

/// How urgently an archived object should be brought back.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RestorePriority {
    High,
    Medium,
    #[default]
    Low,
}

impl RestorePriority {
    /// S3 Glacier retrieval tier for this priority.
    pub fn s3_tier(self) -> &'static str {
        match self {
            RestorePriority::High => "Expedited",
            RestorePriority::Medium => "Standard",
            RestorePriority::Low => "Bulk",
        }
    }
}

impl FromStr for RestorePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "High" => Ok(RestorePriority::High),
            "Medium" => Ok(RestorePriority::Medium),
            "Low" => Ok(RestorePriority::Low),
            other => Err(format!(
                "String value '{}' is not one of High, Medium, Low",
                other
            )),
        }
    }
}

impl fmt::Display for RestorePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePriority::High => "High",
            RestorePriority::Medium => "Medium",
            RestorePriority::Low => "Low",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestoreStatusError {
    #[error("restore status has a quoted value without a key at offset {0}")]
    MissingKey(usize),
    #[error("restore status ends inside an unterminated value")]
    Unterminated,
}

/// Parse an archive restore status such as
/// `ongoing-request="false", expiry-date="Fri, 21 Dec 2012 00:00:00 GMT"`.
pub fn parse_restore_value(restore: &str) -> Result<HashMap<String, String>, RestoreStatusError> {
    #[derive(PartialEq)]
    enum State {
        Key,
        AfterEquals,
        InValue,
    }

    let mut map = HashMap::new();
    let mut state = State::Key;
    let mut start = 0;
    let mut key = "";

    for (i, c) in restore.char_indices() {
        match (c, &state) {
            (',' | ' ', State::Key) => start = i + 1,
            ('=', State::Key) => {
                key = restore[start..i].trim();
                state = State::AfterEquals;
            }
            ('"', State::AfterEquals) => {
                start = i + 1;
                state = State::InValue;
            }
            ('"', State::InValue) => {
                if key.is_empty() {
                    return Err(RestoreStatusError::MissingKey(i));
                }
                map.insert(key.to_string(), restore[start..i].to_string());
                state = State::Key;
                start = i + 1;
            }
            _ => {}
        }
    }

    if state != State::Key {
        return Err(RestoreStatusError::Unterminated);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completed_restore_header() {
        let map = parse_restore_value(
            r#"ongoing-request="false", expiry-date="Fri, 21 Dec 2012 00:00:00 GMT""#,
        )
        .unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map["ongoing-request"], "false");
        assert_eq!(map["expiry-date"], "Fri, 21 Dec 2012 00:00:00 GMT");
    }

    #[test]
    fn empty_header_is_an_empty_map() {
        assert!(parse_restore_value("").unwrap().is_empty());
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        let err = parse_restore_value(r#"ongoing-request="true"#).unwrap_err();
        assert_eq!(err, RestoreStatusError::Unterminated);
    }

    #[test]
    fn value_without_key_is_rejected() {
        assert!(matches!(
            parse_restore_value(r#"="true""#),
            Err(RestoreStatusError::MissingKey(_))
        ));
    }

    #[test]
    fn id_is_derived_from_url() {
        let locator = Locator::s3("archive", "2020/tape.mxf", None);
        assert_eq!(
            build_restore_work_item_id(&locator),
            "/restore-work-items/https-archive.s3.amazonaws.com-2020-tape.mxf"
        );
    }

    #[test]
    fn add_job_assignment_is_idempotent() {
        let mut item = RestoreWorkItem::new(Locator::s3("b", "k", None));
        assert!(item.add_job_assignment("/job-assignments/1"));
        assert!(!item.add_job_assignment("/job-assignments/1"));
        assert_eq!(item.job_assignment_database_ids.len(), 1);
    }

    #[test]
    fn priority_parsing() {
        assert_eq!("Medium".parse::<RestorePriority>(), Ok(RestorePriority::Medium));
        assert!("Urgent".parse::<RestorePriority>().is_err());
        assert_eq!(RestorePriority::default().s3_tier(), "Bulk");
    }
}
