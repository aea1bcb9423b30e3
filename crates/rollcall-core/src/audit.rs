//! Append-only CSV audit trail of registrations.
//!
//! Write-once side log, never read back. Every I/O failure is logged and
//! swallowed so a broken audit file can never block or undo a registration.

use chrono::NaiveDateTime;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const HEADER: [&str; 4] = ["Student ID", "Name", "Age", "Registration Date"];
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Registration audit log.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Point the log at `path`, writing the header row if the file does not
    /// exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let log = Self { path: path.into() };
        if !log.path.exists() {
            if let Err(err) = log.write_line(&csv_line(&HEADER)) {
                tracing::warn!(path = %log.path.display(), error = %err, "failed to create audit log");
            }
        }
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one registration row. Failures are logged, never returned.
    pub fn append(&self, student_id: &str, name: &str, age: u32, registered_at: NaiveDateTime) {
        let age = age.to_string();
        let when = registered_at.format(TIMESTAMP_FORMAT).to_string();
        let line = csv_line(&[student_id, name, &age, &when]);
        if let Err(err) = self.write_line(&line) {
            tracing::warn!(
                path = %self.path.display(),
                student_id,
                error = %err,
                "audit log append failed; registration kept"
            );
        }
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

/// Join fields into one CSV record, quoting fields that need it.
fn csv_line(fields: &[&str]) -> String {
    let mut line = fields
        .iter()
        .map(|f| {
            if f.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", f.replace('"', "\"\""))
            } else {
                (*f).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("students.csv");
        AuditLog::new(&path);
        AuditLog::new(&path);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Student ID,Name,Age,Registration Date\r\n");
    }

    #[test]
    fn test_append_row() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("students.csv"));
        log.append("S1", "Alice", 20, at(9, 0, 0));
        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(text.ends_with("S1,Alice,20,2024-01-01 09:00:00\r\n"));
    }

    #[test]
    fn test_fields_quoted_when_needed() {
        assert_eq!(csv_line(&["a", "b,c", "d\"e"]), "a,\"b,c\",\"d\"\"e\"\r\n");
    }

    #[test]
    fn test_unwritable_path_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be: every write fails.
        let path = dir.path().join("students.csv");
        std::fs::create_dir(&path).unwrap();
        let log = AuditLog::new(&path);
        log.append("S1", "Alice", 20, at(9, 0, 0));
        assert!(path.is_dir());
    }
}
