use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use stc_core::{SyncHeaders, TimeEntry};
use std::path::Path;
use thiserror::Error;

pub const TIME_LOG_SCHEMA_VERSION: i64 = 1;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Last successfully applied sync state; the single shared mutable resource
/// between sync cycles. Read at the start of a cycle, written at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub source_path: String,
    pub headers: SyncHeaders,
    pub course: String,
    pub period: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodRecord {
    pub course: String,
    pub period: String,
    pub start_date: NaiveDate,
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyTotal {
    pub day: NaiveDate,
    pub subject: String,
    pub hours: f64,
}

pub struct TimeLogStore {
    conn: Connection,
}

impl TimeLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > TIME_LOG_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: TIME_LOG_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_time_log.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Idempotent batch upsert keyed on (course, period, task, start). A
    /// re-sync that recomputes an entry overwrites it in place.
    pub fn upsert_time_entries(&mut self, entries: &[TimeEntry]) -> Result<usize, StorageError> {
        let tx = self.conn.transaction()?;
        let mut written = 0usize;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO time_entries (
                    course, period, subject, task_title,
                    start_ts, end_ts, hours_spent, finished
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(course, period, task_title, start_ts) DO UPDATE SET
                    subject=excluded.subject,
                    end_ts=excluded.end_ts,
                    hours_spent=excluded.hours_spent,
                    finished=excluded.finished
                ",
            )?;
            for entry in entries {
                written += statement.execute(params![
                    entry.course,
                    entry.period,
                    entry.subject,
                    entry.task_title,
                    entry.start.format(TIMESTAMP_FORMAT).to_string(),
                    entry.end.format(TIMESTAMP_FORMAT).to_string(),
                    entry.hours_spent,
                    entry.finished,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn time_entries(&self, course: &str, period: &str) -> Result<Vec<TimeEntry>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT course, period, subject, task_title, start_ts, end_ts, hours_spent, finished
            FROM time_entries
            WHERE course = ?1 AND period = ?2
            ORDER BY start_ts, task_title
            ",
        )?;
        let rows = statement.query_map([course, period], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (course, period, subject, task_title, start, end, hours_spent, finished) = row?;
            entries.push(TimeEntry {
                course,
                period,
                subject,
                task_title,
                start: parse_timestamp(&start)?,
                end: parse_timestamp(&end)?,
                hours_spent,
                finished,
            });
        }
        Ok(entries)
    }

    pub fn entry_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM time_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn upsert_period(&self, record: &PeriodRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO periods (course, period, start_date, finished)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(course, period) DO UPDATE SET
                start_date=excluded.start_date,
                finished=excluded.finished
            ",
            params![
                record.course,
                record.period,
                record.start_date.format(DAY_FORMAT).to_string(),
                record.finished,
            ],
        )?;
        Ok(())
    }

    pub fn periods(&self, course: &str) -> Result<Vec<PeriodRecord>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT course, period, start_date, finished
            FROM periods
            WHERE course = ?1
            ORDER BY start_date
            ",
        )?;
        let rows = statement.query_map([course], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (course, period, start_date, finished) = row?;
            records.push(PeriodRecord {
                course,
                period,
                start_date: parse_day_text(&start_date)?,
                finished,
            });
        }
        Ok(records)
    }

    pub fn upsert_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO sync_checkpoint (
                id, source_path, last_update, archive_young, archive_old,
                course, period, updated_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                source_path=excluded.source_path,
                last_update=excluded.last_update,
                archive_young=excluded.archive_young,
                archive_old=excluded.archive_old,
                course=excluded.course,
                period=excluded.period,
                updated_at=excluded.updated_at
            ",
            params![
                checkpoint.source_path,
                checkpoint.headers.last_update,
                checkpoint.headers.archive_young,
                checkpoint.headers.archive_old,
                checkpoint.course,
                checkpoint.period,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<Option<SyncCheckpoint>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT source_path, last_update, archive_young, archive_old,
                       course, period, updated_at
                FROM sync_checkpoint
                WHERE id = 1
                ",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((source_path, last_update, archive_young, archive_old, course, period, updated_at)) =
            row
        else {
            return Ok(None);
        };

        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|err| StorageError::Timestamp(err.to_string()))?
            .with_timezone(&Utc);

        Ok(Some(SyncCheckpoint {
            source_path,
            headers: SyncHeaders {
                last_update,
                archive_young,
                archive_old,
            },
            course,
            period,
            updated_at,
        }))
    }

    /// Per-day hour totals, the shape chart and stats consumers read.
    pub fn daily_totals(&self, course: &str, period: &str) -> Result<Vec<DailyTotal>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT date(start_ts), subject, SUM(hours_spent)
            FROM time_entries
            WHERE course = ?1 AND period = ?2
            GROUP BY date(start_ts), subject
            ORDER BY date(start_ts), subject
            ",
        )?;
        let rows = statement.query_map([course, period], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut totals = Vec::new();
        for row in rows {
            let (day, subject, hours) = row?;
            totals.push(DailyTotal {
                day: parse_day_text(&day)?,
                subject,
                hours,
            });
        }
        Ok(totals)
    }
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, StorageError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|err| StorageError::Timestamp(format!("{value:?}: {err}")))
}

fn parse_day_text(value: &str) -> Result<NaiveDate, StorageError> {
    NaiveDate::parse_from_str(value, DAY_FORMAT)
        .map_err(|err| StorageError::Timestamp(format!("{value:?}: {err}")))
}
