use chrono::{DateTime, Duration, NaiveDate, NaiveTime};
use stc_core::{parse_day, Project, SyncHeaders, Task, TimeEntry, MS_PER_HOUR};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Outcome of comparing freshly scanned sync headers against the last
/// persisted ones. Purely computed; persisting the new headers after a
/// successful pass is the caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    pub update_needed: bool,
    pub young_archive_changed: bool,
    pub old_archive_changed: bool,
    /// Day derived from the locally persisted `last_update` (UTC); tasks with
    /// no activity on or after it are skipped during an incremental pass.
    pub cutoff_day: Option<NaiveDate>,
}

pub fn plan_sync(remote: &SyncHeaders, local: Option<&SyncHeaders>) -> SyncPlan {
    let local_last_update = local.map_or(0, |headers| headers.last_update);
    let local_young = local.map_or(0, |headers| headers.archive_young);
    let local_old = local.map_or(0, |headers| headers.archive_old);

    SyncPlan {
        update_needed: remote.last_update > local_last_update,
        young_archive_changed: local_young < remote.archive_young,
        old_archive_changed: local_old < remote.archive_old,
        cutoff_day: local.and_then(|headers| day_of_epoch_ms(headers.last_update)),
    }
}

fn day_of_epoch_ms(epoch_ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(epoch_ms).map(|timestamp| timestamp.date_naive())
}

/// Keep only tasks not referenced as a subtask of any other task. The
/// referenced-id set is built over the whole batch first, so ownership does
/// not depend on the order entities appeared in the stream.
pub fn drop_child_tasks(tasks: BTreeMap<String, Task>) -> BTreeMap<String, Task> {
    let referenced: BTreeSet<String> = tasks
        .values()
        .flat_map(|task| task.sub_task_ids.iter().cloned())
        .collect();

    let before = tasks.len();
    let parents: BTreeMap<String, Task> = tasks
        .into_iter()
        .filter(|(task_id, _)| !referenced.contains(task_id))
        .collect();
    debug!(
        event = "child_tasks_consolidated",
        kept = parents.len(),
        dropped = before - parents.len(),
    );
    parents
}

/// Explode each task's per-day time map into flat time entries. Entries start
/// at 00:00 of their day (the export carries no intra-day times) and end
/// after exactly the recorded duration.
pub fn explode_time_entries(
    tasks: &BTreeMap<String, Task>,
    projects: &BTreeMap<String, Project>,
    course: &str,
    period: &str,
    window_start: Option<NaiveDate>,
) -> Vec<TimeEntry> {
    let project_titles: BTreeMap<&str, String> = projects
        .iter()
        .map(|(project_id, project)| (project_id.as_str(), project.title.trim().to_string()))
        .collect();

    let mut entries = Vec::new();
    for (task_id, task) in tasks {
        let subject = project_titles
            .get(task.project_id.as_str())
            .cloned()
            .unwrap_or_else(|| task.project_id.clone());

        let mut task_rows = Vec::new();
        let mut bad_day = None;
        for (day_key, spent_ms) in &task.time_spent_on_day {
            let day = match parse_day(day_key) {
                Ok(day) => day,
                Err(err) => {
                    bad_day = Some(err);
                    break;
                }
            };
            if window_start.is_some_and(|start| day < start) {
                continue;
            }

            let start = day.and_time(NaiveTime::MIN);
            task_rows.push(TimeEntry {
                course: course.to_string(),
                period: period.to_string(),
                subject: subject.clone(),
                task_title: task.title.trim().to_string(),
                start,
                end: start + Duration::milliseconds(*spent_ms),
                hours_spent: *spent_ms as f64 / MS_PER_HOUR,
                finished: task.is_done,
            });
        }

        if let Some(err) = bad_day {
            warn!(event = "task_rows_dropped", task_id = %task_id, error = %err);
            continue;
        }
        entries.extend(task_rows);
    }

    debug!(event = "time_entries_exploded", count = entries.len());
    entries
}
