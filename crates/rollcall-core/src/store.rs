//! SQLite-backed identity store: enrolled students and attendance events.
//!
//! The `attendance` table carries a `(student_id, date)` uniqueness
//! constraint, so recording attendance is a single `INSERT OR IGNORE` and
//! two near-simultaneous detections can never both insert.

use crate::audit::AuditLog;
use crate::recorder::{Clock, SystemClock};
use crate::types::{AttendanceEvent, ReportRow, Student, DATE_FORMAT, TIME_FORMAT};
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS students (
        student_id    TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        age           INTEGER,
        face_encoding BLOB
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id TEXT REFERENCES students (student_id),
        date       TEXT,
        time       TEXT,
        UNIQUE (student_id, date)
    );
";

/// Databases created before the table-level constraint may already hold
/// repeated `(student_id, date)` rows; the earliest one is the first write.
const DEDUPE_ATTENDANCE: &str = "
    DELETE FROM attendance
    WHERE student_id IS NOT NULL AND date IS NOT NULL
      AND id NOT IN (SELECT MIN(id) FROM attendance GROUP BY student_id, date)
";

const ATTENDANCE_INDEX: &str = "
    CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_student_date
        ON attendance (student_id, date);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("student id already exists: {0}")]
    DuplicateStudent(String),
    #[error("no such student: {0}")]
    UnknownStudent(String),
    #[error("storage unavailable after an earlier failure")]
    Unavailable,
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Outcome of [`Store::record_attendance_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    AlreadyPresent,
}

/// Student and attendance persistence.
///
/// The connection sits behind a mutex so a single store can be shared
/// between the engine thread and D-Bus handlers. The first storage failure
/// latches the store: every later call returns [`StoreError::Unavailable`].
///
/// When an [`AuditLog`] is attached, every successful `add_student` also
/// appends one row to it.
pub struct Store {
    conn: Mutex<Connection>,
    failed: AtomicBool,
    audit: Option<AuditLog>,
    clock: Box<dyn Clock + Send + Sync>,
}

impl Store {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::bootstrap(conn)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        let removed = conn.execute(DEDUPE_ATTENDANCE, [])?;
        if removed > 0 {
            tracing::warn!(removed, "dropped repeated attendance rows, kept the first of each day");
        }
        conn.execute_batch(ATTENDANCE_INDEX)?;
        Ok(Self {
            conn: Mutex::new(conn),
            failed: AtomicBool::new(false),
            audit: None,
            clock: Box::new(SystemClock),
        })
    }

    /// Mirror every registration into `audit`.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Clock used for audit registration timestamps.
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Run `f` against the connection, latching the store on storage failure.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable);
        }
        let conn = self.conn.lock().map_err(|_| {
            self.failed.store(true, Ordering::Release);
            StoreError::Unavailable
        })?;
        f(&conn).map_err(|e| {
            if is_storage_failure(&e) {
                tracing::error!(error = %e, "storage failure; store is now unavailable");
                self.failed.store(true, Ordering::Release);
            }
            StoreError::Sqlite(e)
        })
    }

    /// Whether an earlier storage failure has latched this store.
    pub fn is_unavailable(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Insert a new student. A duplicate id is rejected without mutation.
    ///
    /// The audit row is written after the insert commits; audit failures are
    /// logged by [`AuditLog`] and never undo the registration.
    pub fn add_student(
        &self,
        student_id: &str,
        name: &str,
        age: u32,
        face_encoding: &[u8],
    ) -> Result<(), StoreError> {
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO students (student_id, name, age, face_encoding)
                 VALUES (?1, ?2, ?3, ?4)",
                params![student_id, name, age, face_encoding],
            )
        });
        match result {
            Ok(_) => {
                tracing::info!(student_id, name, age, "student registered");
                if let Some(audit) = &self.audit {
                    audit.append(student_id, name, age, self.clock.now());
                }
                Ok(())
            }
            Err(StoreError::Sqlite(e))
                if constraint_kind(&e) == Some(ffi::SQLITE_CONSTRAINT_PRIMARYKEY) =>
            {
                tracing::debug!(student_id, "duplicate student id rejected");
                Err(StoreError::DuplicateStudent(student_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    pub fn get_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT student_id, name, age, face_encoding
                 FROM students WHERE student_id = ?1",
                [student_id],
                student_from_row,
            )
            .optional()
        })
    }

    /// All students in insertion order.
    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT student_id, name, age, face_encoding
                 FROM students ORDER BY rowid",
            )?;
            let rows = stmt.query_map([], student_from_row)?;
            rows.collect()
        })
    }

    /// Record an attendance event unless one already exists for
    /// `(student_id, date)`. The first write wins.
    pub fn record_attendance_if_absent(
        &self,
        student_id: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<RecordOutcome, StoreError> {
        let date_text = date.format(DATE_FORMAT).to_string();
        let time_text = time.format(TIME_FORMAT).to_string();
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO attendance (student_id, date, time)
                 VALUES (?1, ?2, ?3)",
                params![student_id, date_text, time_text],
            )
        });
        match result {
            Ok(1) => {
                tracing::info!(student_id, date = %date_text, time = %time_text, "attendance recorded");
                Ok(RecordOutcome::Recorded)
            }
            Ok(_) => Ok(RecordOutcome::AlreadyPresent),
            Err(StoreError::Sqlite(e))
                if constraint_kind(&e) == Some(ffi::SQLITE_CONSTRAINT_FOREIGNKEY) =>
            {
                Err(StoreError::UnknownStudent(student_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Events stored for one date, ordered by time of first detection.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, StoreError> {
        let date_text = date.format(DATE_FORMAT).to_string();
        let raw: Vec<(i64, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, student_id, date, time FROM attendance
                 WHERE date = ?1 ORDER BY time, id",
            )?;
            let rows = stmt.query_map([&date_text], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect()
        })?;

        raw.into_iter()
            .map(|(id, student_id, date, time)| {
                Ok(AttendanceEvent {
                    id,
                    student_id,
                    date: parse_date(&date)?,
                    time: parse_time(&time)?,
                })
            })
            .collect()
    }

    /// Every enrolled student once, ordered by id, with the time of their
    /// event on `date` or `None` when absent.
    pub fn attendance_report(&self, date: NaiveDate) -> Result<Vec<ReportRow>, StoreError> {
        let date_text = date.format(DATE_FORMAT).to_string();
        let raw: Vec<(String, String, Option<String>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.student_id, s.name, a.time
                 FROM students s
                 LEFT JOIN attendance a
                    ON s.student_id = a.student_id AND a.date = ?1
                 ORDER BY s.student_id",
            )?;
            let rows = stmt.query_map([&date_text], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            rows.collect()
        })?;

        raw.into_iter()
            .map(|(student_id, name, time)| {
                Ok(ReportRow {
                    student_id,
                    name,
                    time: time.as_deref().map(parse_time).transpose()?,
                })
            })
            .collect()
    }
}

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        student_id: row.get(0)?,
        name: row.get(1)?,
        age: row.get::<_, Option<u32>>(2)?.unwrap_or_default(),
        face_encoding: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
    })
}

fn parse_date(text: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("date {text:?}: {e}")))
}

fn parse_time(text: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(text, TIME_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("time {text:?}: {e}")))
}

/// Extended result code of a constraint violation, if `err` is one.
fn constraint_kind(err: &rusqlite::Error) -> Option<i32> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            Some(e.extended_code)
        }
        _ => None,
    }
}

/// Engine-level failures latch the store; constraint violations and row
/// conversion errors do not.
fn is_storage_failure(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code != ErrorCode::ConstraintViolation)
}
