pub mod builder;
pub mod filter;
pub mod path;
pub mod stream;

use crate::builder::EntityCollector;
use crate::path::{EntityKind, Segment};
use crate::stream::{TokenKind, TokenSource, DEFAULT_CHUNK_SIZE};
use chrono::NaiveDate;
use stc_core::{Project, SyncHeaders, Task};
use std::collections::BTreeMap;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed input at byte {offset}: {reason}")]
    MalformedInput { offset: u64, reason: String },
    #[error("{kind} {second_id} started while {first_id} is still open")]
    UnexpectedNesting {
        kind: EntityKind,
        first_id: String,
        second_id: String,
    },
    #[error("sync headers never found: {}", .missing.join(", "))]
    MissingHeaders { missing: Vec<&'static str> },
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Oldest activity day a task may have and still be retained.
    pub cutoff: Option<NaiveDate>,
    /// Read increment for the preamble scan.
    pub chunk_size: usize,
    /// Hard cap on tokens pulled from the stream; diagnostic use.
    pub token_limit: Option<usize>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            cutoff: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            token_limit: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub tokens_processed: usize,
    pub tasks_seen: usize,
    pub tasks_retained: usize,
    pub tasks_dropped_stale: usize,
    pub tasks_dropped_malformed: usize,
    pub projects_seen: usize,
    pub projects_retained: usize,
    pub projects_dropped_malformed: usize,
}

#[derive(Debug)]
pub struct ExtractBatch {
    pub tasks: BTreeMap<String, Task>,
    pub projects: BTreeMap<String, Project>,
    pub report: ExtractReport,
}

/// Pull every task and project entity out of `input` in one pass.
///
/// Task/project maps are keyed by the entity id taken from the path. Tasks
/// are date-filtered when `options.cutoff` is set; parent/child consolidation
/// is a separate batch step and deliberately not applied here.
pub fn extract_entities<R: Read>(
    input: R,
    options: &ExtractOptions,
) -> Result<ExtractBatch, ExtractError> {
    let mut source = TokenSource::new(input, options.chunk_size)?;
    if let Some(limit) = options.token_limit {
        source = source.with_token_limit(limit);
    }

    let mut collector = EntityCollector::new(options.cutoff);
    for token in source {
        collector.feed(&token?)?;
    }

    let (tasks, projects, report) = collector.finish();
    Ok(ExtractBatch {
        tasks,
        projects,
        report,
    })
}

/// Scan for the three sync header fields, stopping as soon as all are found.
/// The remainder of the stream is never read on the early-stop path.
pub fn scan_sync_headers<R: Read>(
    input: R,
    options: &ExtractOptions,
) -> Result<SyncHeaders, ExtractError> {
    let mut source = TokenSource::new(input, options.chunk_size)?;
    if let Some(limit) = options.token_limit {
        source = source.with_token_limit(limit);
    }

    let mut last_update = None;
    let mut archive_young = None;
    let mut archive_old = None;

    for token in source {
        let token = token?;
        if let Some(value) = header_value(&token.kind) {
            if path_is(&token.path, &["lastUpdate"]) {
                last_update.get_or_insert(value);
            } else if path_is(&token.path, &["revMap", "archiveYoung"]) {
                archive_young.get_or_insert(value);
            } else if path_is(&token.path, &["revMap", "archiveOld"]) {
                archive_old.get_or_insert(value);
            }
        }

        if let (Some(last_update), Some(archive_young), Some(archive_old)) =
            (last_update, archive_young, archive_old)
        {
            return Ok(SyncHeaders {
                last_update,
                archive_young,
                archive_old,
            });
        }
    }

    let mut missing = Vec::new();
    if last_update.is_none() {
        missing.push("lastUpdate");
    }
    if archive_young.is_none() {
        missing.push("revMap.archiveYoung");
    }
    if archive_old.is_none() {
        missing.push("revMap.archiveOld");
    }
    Err(ExtractError::MissingHeaders { missing })
}

fn path_is(path: &[Segment], expected: &[&str]) -> bool {
    path.len() == expected.len()
        && path
            .iter()
            .zip(expected)
            .all(|(segment, key)| segment.as_key() == Some(*key))
}

/// Headers are numeric in recent exports but numeric strings in older ones.
fn header_value(kind: &TokenKind) -> Option<i64> {
    match kind {
        TokenKind::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        TokenKind::Str(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::io::Cursor;

    fn task_value(id: &str, days: &[(&str, i64)], sub_task_ids: &[&str]) -> Value {
        let spent: serde_json::Map<String, Value> = days
            .iter()
            .map(|(day, ms)| (day.to_string(), json!(ms)))
            .collect();
        json!({
            "id": id,
            "subTaskIds": sub_task_ids,
            "timeSpentOnDay": spent,
            "timeSpent": days.iter().map(|(_, ms)| ms).sum::<i64>(),
            "isDone": false,
            "title": format!("Task {id}"),
            "tagIds": [],
            "projectId": "p1"
        })
    }

    fn sample_doc() -> Value {
        json!({
            "lastUpdate": 1750581369404_i64,
            "revMap": {"archiveYoung": "7", "archiveOld": 3},
            "mainModelData": {
                "project": {
                    "ids": ["INBOX_PROJECT", "p1", "p2"],
                    "entities": {
                        "INBOX_PROJECT": {"id": "INBOX_PROJECT", "title": "Inbox"},
                        "p1": {
                            "id": "p1",
                            "title": " Thesis ",
                            "theme": {"primaryColor": "#29a1aa"},
                            "icon": "rocket",
                            "advancedCfg": {"worklogExportSettings": {"cols": ["DATE"]}}
                        },
                        "p2": {"id": "p2", "title": "Electronics"}
                    }
                },
                "task": {
                    "entities": {
                        "t1": task_value("t1", &[("2025-06-22", 15819999), ("2025-06-23", 16080158)], &[]),
                        "t2": task_value("t2", &[("2025-06-24", 336000)], &["t1"])
                    }
                },
                "archiveYoung": {
                    "task": {
                        "entities": {
                            "t3": task_value("t3", &[("2025-05-10", 7200000)], &[])
                        }
                    }
                },
                "archiveOld": {
                    "task": {
                        "entities": {
                            "t4": task_value("t4", &[("2024-11-02", 1800000)], &[])
                        }
                    }
                }
            }
        })
    }

    fn extract_str(doc: &str, options: &ExtractOptions) -> ExtractBatch {
        extract_entities(Cursor::new(doc.as_bytes().to_vec()), options).expect("extract")
    }

    fn day(value: &str) -> NaiveDate {
        stc_core::parse_day(value).expect("test day")
    }

    #[test]
    fn round_trip_returns_every_entity_without_a_cutoff() {
        let doc = sample_doc().to_string();
        let batch = extract_str(&doc, &ExtractOptions::default());

        assert_eq!(batch.tasks.len(), 4);
        assert_eq!(batch.projects.len(), 2);
        assert_eq!(batch.report.tasks_seen, 4);
        assert_eq!(batch.report.tasks_retained, 4);
        assert_eq!(batch.report.projects_seen, 2);
        assert_eq!(batch.report.tasks_dropped_stale, 0);

        let t1 = &batch.tasks["t1"];
        assert_eq!(t1.title, "Task t1");
        assert_eq!(t1.time_spent_on_day["2025-06-22"], 15819999);
        assert_eq!(t1.project_id, "p1");
    }

    #[test]
    fn inbox_project_is_excluded_and_noise_fields_are_pruned() {
        let doc = sample_doc().to_string();
        let batch = extract_str(&doc, &ExtractOptions::default());

        assert!(!batch.projects.contains_key("INBOX_PROJECT"));
        let p1 = &batch.projects["p1"];
        assert_eq!(p1.title, " Thesis ");
        assert!(!p1.extra.contains_key("theme"));
        assert!(!p1.extra.contains_key("icon"));
        assert!(!p1.extra.contains_key("advancedCfg"));
    }

    #[test]
    fn cutoff_drops_stale_tasks_but_never_projects() {
        let doc = sample_doc().to_string();
        let mut options = ExtractOptions::default();
        options.cutoff = Some(day("2025-06-01"));
        let batch = extract_str(&doc, &options);

        assert_eq!(
            batch.tasks.keys().cloned().collect::<Vec<_>>(),
            vec!["t1".to_string(), "t2".to_string()],
            "archived tasks with older activity must be dropped"
        );
        assert_eq!(batch.report.tasks_dropped_stale, 2);
        assert_eq!(batch.projects.len(), 2);
    }

    #[test]
    fn raising_the_cutoff_never_grows_the_retained_set() {
        let doc = sample_doc().to_string();
        let cutoffs = ["2024-01-01", "2025-05-01", "2025-06-23", "2025-07-01"];

        let mut previous: Option<Vec<String>> = None;
        for cutoff in cutoffs {
            let mut options = ExtractOptions::default();
            options.cutoff = Some(day(cutoff));
            let batch = extract_str(&doc, &options);
            let retained: Vec<String> = batch.tasks.keys().cloned().collect();
            if let Some(previous) = &previous {
                assert!(
                    retained.iter().all(|id| previous.contains(id)),
                    "cutoff {cutoff} retained {retained:?}, not a subset of {previous:?}"
                );
            }
            previous = Some(retained);
        }
        assert_eq!(previous.expect("last run"), Vec::<String>::new());
    }

    #[test]
    fn malformed_day_key_drops_one_task_and_keeps_siblings() {
        let mut doc = sample_doc();
        doc["mainModelData"]["task"]["entities"]["bad"] = json!({
            "id": "bad",
            "subTaskIds": [],
            "timeSpentOnDay": {"someday": 1000},
            "title": "Broken clock",
            "isDone": false,
            "projectId": "p1"
        });
        let batch = extract_str(&doc.to_string(), &ExtractOptions::default());

        assert!(!batch.tasks.contains_key("bad"));
        assert_eq!(batch.tasks.len(), 4);
        assert_eq!(batch.report.tasks_dropped_malformed, 1);
    }

    #[test]
    fn task_missing_required_fields_is_dropped_not_fatal() {
        let mut doc = sample_doc();
        doc["mainModelData"]["task"]["entities"]["headless"] = json!({
            "id": "headless",
            "subTaskIds": []
        });
        let batch = extract_str(&doc.to_string(), &ExtractOptions::default());

        assert!(!batch.tasks.contains_key("headless"));
        assert_eq!(batch.report.tasks_dropped_malformed, 1);
        assert_eq!(batch.tasks.len(), 4);
    }

    #[test]
    fn overlapping_tasks_fail_fast_with_unexpected_nesting() {
        let mut inner = task_value("outer", &[("2025-06-22", 1000)], &[]);
        inner["task"] = json!({"entities": {"inner": task_value("inner", &[], &[])}});
        let doc = json!({
            "mainModelData": {"task": {"entities": {"outer": inner}}}
        });

        let err = extract_entities(
            Cursor::new(doc.to_string().into_bytes()),
            &ExtractOptions::default(),
        )
        .err()
        .expect("nested task entities must fail");
        match err {
            ExtractError::UnexpectedNesting {
                kind,
                first_id,
                second_id,
            } => {
                assert_eq!(kind, EntityKind::Task);
                assert_eq!(first_id, "outer");
                assert_eq!(second_id, "inner");
            }
            other => panic!("expected UnexpectedNesting, got {other:?}"),
        }
    }

    #[test]
    fn preamble_bytes_do_not_change_the_result() {
        let doc = sample_doc().to_string();
        let noisy = format!("superproductivity backup v14 -- not json -- {doc}");

        let plain = extract_str(&doc, &ExtractOptions::default());
        let prefixed = extract_str(&noisy, &ExtractOptions::default());

        assert_eq!(plain.tasks, prefixed.tasks);
        assert_eq!(plain.projects, prefixed.projects);
    }

    #[test]
    fn token_limit_yields_a_partial_batch_without_error() {
        let doc = sample_doc().to_string();
        let mut options = ExtractOptions::default();
        options.token_limit = Some(10);
        let batch = extract_str(&doc, &options);
        assert!(batch.report.tokens_processed <= 10);
    }

    #[test]
    fn header_scan_finds_values_and_coerces_numeric_strings() {
        let doc = sample_doc().to_string();
        let headers =
            scan_sync_headers(Cursor::new(doc.into_bytes()), &ExtractOptions::default())
                .expect("headers");
        assert_eq!(
            headers,
            SyncHeaders {
                last_update: 1750581369404,
                archive_young: 7,
                archive_old: 3,
            }
        );
    }

    #[test]
    fn header_scan_stops_before_reading_the_tail() {
        // the tail after the third header is not even valid JSON; an early
        // stop must succeed without ever lexing it
        let doc = concat!(
            r#"{"lastUpdate": 1750581369404, "#,
            r#""revMap": {"archiveYoung": "7", "archiveOld": 3"#,
            r#"}}}}}} this tail would be a parse error"#,
        );
        let headers = scan_sync_headers(
            Cursor::new(doc.as_bytes().to_vec()),
            &ExtractOptions::default(),
        )
        .expect("headers");
        assert_eq!(headers.last_update, 1750581369404);
        assert_eq!(headers.archive_young, 7);
        assert_eq!(headers.archive_old, 3);
    }

    #[test]
    fn missing_headers_are_reported_by_name() {
        let doc = r#"{"mainModelData": {}, "revMap": {"archiveYoung": 2}}"#;
        let err = scan_sync_headers(
            Cursor::new(doc.as_bytes().to_vec()),
            &ExtractOptions::default(),
        )
        .err()
        .expect("must fail");
        match err {
            ExtractError::MissingHeaders { missing } => {
                assert_eq!(missing, vec!["lastUpdate", "revMap.archiveOld"]);
            }
            other => panic!("expected MissingHeaders, got {other:?}"),
        }
    }
}
