//! Per-subject audit trail: `META/<ID>.log`, one line per event.
//!
//! The file is opened for each operation and closed when the handle drops.

use chrono::{Local, NaiveDateTime};
use log::Level;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Timestamp layout used in audit lines
pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// Append handle on a subject's log file
pub struct AuditLog {
    file: File,
    path: PathBuf,
    subject_id: String,
}

impl AuditLog {
    /// Open (creating if needed) the log file in append mode
    pub fn open(path: &Path, subject_id: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            subject_id: subject_id.to_string(),
        })
    }

    /// Append one line and forward the message to the application log
    pub fn record(&mut self, level: Level, message: &str) -> Result<()> {
        let line = format_line(&Local::now().naive_local(), level, message);
        writeln!(self.file, "{}", line)?;
        log::log!(level, "{}: {}", self.subject_id, message);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `<timestamp>|<LEVEL>|<message>`
pub fn format_line(timestamp: &NaiveDateTime, level: Level, message: &str) -> String {
    format!("{}|{}|{}", timestamp.format(TIMESTAMP_FORMAT), level, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_format_line() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(9, 4, 7)
            .unwrap();
        assert_eq!(
            format_line(&ts, Level::Warn, "updateMetaFile"),
            "2024.03.05 09:04:07|WARN|updateMetaFile"
        );
    }

    #[test]
    fn test_record_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MI000001.log");

        AuditLog::open(&path, "MI000001")
            .unwrap()
            .record(Level::Info, "first")
            .unwrap();
        let mut log = AuditLog::open(&path, "MI000001").unwrap();
        log.record(Level::Error, "second").unwrap();
        drop(log);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("|INFO|first"));
        assert!(lines[1].ends_with("|ERROR|second"));
        assert_eq!(lines[0].split('|').next().unwrap().len(), "2024.03.05 09:04:07".len());
    }
}
