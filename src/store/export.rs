//! Export and import of log entries
//!
//! Two formats:
//! - `json`: one `LogEntry` object per line
//! - `csv`: flat rows with a header; `parameters` and `metadata` are embedded as
//!   JSON text and an empty cell means an absent value
//!
//! Importing an export reproduces the exported entries, ids aside.

use super::{from_millis, LogEntry};
use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "jsonl",
            Self::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(MonitorError::ConfigValidation(format!(
                "unknown export format '{}', expected json or csv",
                other
            ))),
        }
    }
}

/// Flat CSV shape of a `LogEntry`
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    timestamp_ms: i64,
    session_id: String,
    invocation_id: String,
    function_name: String,
    event_type: String,
    duration_ms: Option<f64>,
    parameters: Option<String>,
    result_summary: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    error_stack: Option<String>,
    memory_peak_bytes: Option<u64>,
    cpu_percent: Option<f64>,
    metadata: String,
}

impl CsvRow {
    fn from_entry(entry: &LogEntry) -> Result<Self> {
        Ok(Self {
            timestamp_ms: entry.timestamp.timestamp_millis(),
            session_id: entry.session_id.clone(),
            invocation_id: entry.invocation_id.clone(),
            function_name: entry.function_name.clone(),
            event_type: entry.event_type.as_str().to_string(),
            duration_ms: entry.duration_ms,
            parameters: entry.parameters.as_ref().map(serde_json::to_string).transpose()?,
            result_summary: entry.result_summary.clone(),
            error_kind: entry.error_kind.clone(),
            error_message: entry.error_message.clone(),
            error_stack: entry.error_stack.clone(),
            memory_peak_bytes: entry.memory_peak_bytes,
            cpu_percent: entry.cpu_percent,
            metadata: serde_json::to_string(&entry.metadata)?,
        })
    }

    fn into_entry(self) -> Result<LogEntry> {
        let metadata: BTreeMap<String, serde_json::Value> = if self.metadata.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&self.metadata)?
        };

        Ok(LogEntry {
            id: None,
            timestamp: from_millis(self.timestamp_ms),
            session_id: self.session_id,
            invocation_id: self.invocation_id,
            function_name: self.function_name,
            event_type: self.event_type.parse().map_err(MonitorError::Persistence)?,
            duration_ms: self.duration_ms,
            parameters: self.parameters.map(|p| serde_json::from_str(&p)).transpose()?,
            result_summary: self.result_summary,
            error_kind: self.error_kind,
            error_message: self.error_message,
            error_stack: self.error_stack,
            memory_peak_bytes: self.memory_peak_bytes,
            cpu_percent: self.cpu_percent,
            metadata,
        })
    }
}

/// Write `entries` to `out`, returning how many were written
pub fn export_entries<W: Write>(entries: &[LogEntry], format: ExportFormat, mut out: W) -> Result<usize> {
    match format {
        ExportFormat::Json => {
            for entry in entries {
                let mut exported = entry.clone();
                exported.id = None;
                serde_json::to_writer(&mut out, &exported)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            for entry in entries {
                writer.serialize(CsvRow::from_entry(entry)?)?;
            }
            writer.flush()?;
        }
    }

    Ok(entries.len())
}

/// Read entries previously written by `export_entries`
pub fn import_entries<R: Read>(input: R, format: ExportFormat) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();

    match format {
        ExportFormat::Json => {
            for (line_no, line) in BufReader::new(input).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let mut entry: LogEntry = serde_json::from_str(&line).map_err(|e| {
                    MonitorError::Persistence(format!("invalid entry on line {}: {}", line_no + 1, e))
                })?;
                entry.id = None;
                entries.push(entry);
            }
        }
        ExportFormat::Csv => {
            let mut reader = csv::Reader::from_reader(input);
            for row in reader.deserialize::<CsvRow>() {
                entries.push(row?.into_entry()?);
            }
        }
    }

    Ok(entries)
}
