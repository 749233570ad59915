//! Human-readable mirror of the entry log
//!
//! Lines go to `<dir>/<file>.<YYYY-MM-DD>` through a daily rolling appender,
//! so retention can drop whole days by file name.

use super::LogEntry;
use crate::error::Result;
use chrono::NaiveDate;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub struct TextLogMirror {
    directory: PathBuf,
    prefix: String,
    appender: Mutex<RollingFileAppender>,
}

impl TextLogMirror {
    /// Open the mirror for `path` (e.g. `data/monitoring.log`)
    pub fn new(path: &Path) -> Result<Self> {
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "monitoring.log".to_string());

        std::fs::create_dir_all(&directory)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &directory, &prefix);

        Ok(Self {
            directory,
            prefix,
            appender: Mutex::new(appender),
        })
    }

    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&entry.to_text_line());
            buf.push('\n');
        }

        let mut appender = match self.appender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        appender.write_all(buf.as_bytes())?;
        appender.flush()?;
        Ok(())
    }

    /// Rolled files belonging to this mirror, with the day they cover
    pub fn files(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let mut files = Vec::new();
        let marker = format!("{}.", self.prefix);

        for dir_entry in std::fs::read_dir(&self.directory)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix(&marker) else {
                continue;
            };
            if let Ok(day) = NaiveDate::parse_from_str(suffix, "%Y-%m-%d") {
                files.push((day, dir_entry.path()));
            }
        }

        files.sort();
        Ok(files)
    }

    /// Remove files for days strictly before `cutoff`
    pub fn delete_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let mut deleted = 0;
        for (day, path) in self.files()? {
            if day < cutoff {
                std::fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
