use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Error)]
#[error("invalid calendar day {value:?}, expected YYYY-MM-DD")]
pub struct DayParseError {
    pub value: String,
}

/// Parse a strict `YYYY-MM-DD` day key as used by `timeSpentOnDay` maps.
pub fn parse_day(value: &str) -> Result<NaiveDate, DayParseError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| DayParseError {
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(default, rename = "subTaskIds")]
    pub sub_task_ids: Vec<String>,
    #[serde(default, rename = "timeSpentOnDay")]
    pub time_spent_on_day: BTreeMap<String, i64>,
    pub title: String,
    #[serde(default, rename = "isDone")]
    pub is_done: bool,
    #[serde(default, rename = "projectId")]
    pub project_id: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

impl Task {
    /// A task that references subtasks is a parent; only leaf tasks survive
    /// consolidation.
    pub fn is_parent(&self) -> bool {
        !self.sub_task_ids.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeEntry {
    pub course: String,
    pub period: String,
    pub subject: String,
    pub task_title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub hours_spent: f64,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncHeaders {
    pub last_update: i64,
    pub archive_young: i64,
    pub archive_old: i64,
}
