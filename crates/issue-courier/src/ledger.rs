//! Dispatch ledger: which issues have already been mailed.
//!
//! Append-only JSONL, one [`DispatchRecord`] per confirmed delivery. The
//! single-line `last_sent.txt` marker left by the previous tool is honoured
//! on read but never written.

use crate::error::{CourierError, CourierResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub issue: String,
    pub sent_at: DateTime<Utc>,
}

pub struct DispatchLedger {
    path: PathBuf,
    legacy_marker: PathBuf,
}

impl DispatchLedger {
    pub fn new(path: PathBuf, legacy_marker: PathBuf) -> Self {
        Self {
            path,
            legacy_marker,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in file order. Malformed lines are skipped.
    pub fn records(&self) -> CourierResult<Vec<DispatchRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CourierError::Storage(format!(
                    "failed to read ledger {}: {e}",
                    self.path.display()
                )))
            }
        };

        let records = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<DispatchRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), line = n + 1, error = %e, "skipping malformed ledger line");
                    None
                }
            })
            .collect();
        Ok(records)
    }

    /// Whether `issue` has a recorded delivery.
    pub fn already_sent(&self, issue: &str) -> CourierResult<bool> {
        if self.records()?.iter().any(|r| r.issue == issue) {
            return Ok(true);
        }
        match self.legacy_issue()? {
            Some(legacy) if legacy == issue => {
                debug!(issue, "matched legacy last_sent marker");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Append a delivery record. Only call this with a delivery receipt in hand.
    pub fn record_sent(&self, issue: &str, sent_at: DateTime<Utc>) -> CourierResult<()> {
        let record = DispatchRecord {
            issue: issue.to_string(),
            sent_at,
        };
        self.append(&record).map_err(|e| {
            CourierError::Storage(format!(
                "failed to append to ledger {}: {e}",
                self.path.display()
            ))
        })?;
        info!(issue, path = %self.path.display(), "delivery recorded");
        Ok(())
    }

    fn append(&self, record: &DispatchRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let json = serde_json::to_string(record)?;
        writeln!(file, "{json}")?;
        file.sync_all()
    }

    fn legacy_issue(&self) -> CourierResult<Option<String>> {
        match std::fs::read_to_string(&self.legacy_marker) {
            Ok(raw) => Ok(Some(raw.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(CourierError::Storage(format!(
                "failed to read {}: {e}",
                self.legacy_marker.display()
            ))),
        }
    }
}
