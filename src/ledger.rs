//! The status ledger: a human-readable, newest-first text log of job stages.
//!
//! Each entry is one line:
//!
//! ```text
//! 🟩 Initiating: Export of *general* - 2026-10-17T12:00:00.000Z
//! 🟥 Failed: Index of *general* (transport failure: HTTP 503) - 2026-10-17T12:01:00.000Z
//! ```
//!
//! The first line answers "is a job running?" ([`Ledger::read_status`]); the
//! leading lines within a time window form the activity report
//! ([`Ledger::render_recent_activity`]). Writes rewrite the whole file with
//! the new line on top (single writer process).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::mask::mask_single_line;

const GREEN: &str = "🟩";
const RED: &str = "🟥";

/// Stage outcome marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Initiating,
    Complete,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Initiating => "Initiating",
            Outcome::Complete => "Complete",
            Outcome::Failed => "Failed",
        }
    }

    fn marker(self) -> &'static str {
        match self {
            Outcome::Failed => RED,
            _ => GREEN,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Initiating" => Some(Outcome::Initiating),
            "Complete" => Some(Outcome::Complete),
            "Failed" => Some(Outcome::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Initiating)
    }
}

/// Whether a new job may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    Ready,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub outcome: Outcome,
    pub subject: String,
    pub detail: Option<String>,
}

impl LedgerEntry {
    pub fn new(stage: impl Into<String>, outcome: Outcome, subject: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: stage.into(),
            outcome,
            subject: subject.into(),
            detail: None,
        }
    }

    /// Attach a failure description. It is masked and flattened to one line.
    pub fn with_detail(mut self, detail: &str) -> Self {
        let detail = mask_single_line(detail);
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn to_line(&self) -> String {
        let detail = self
            .detail
            .as_ref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        format!(
            "{} {}: {} of *{}*{} - {}",
            self.outcome.marker(),
            self.outcome.as_str(),
            self.stage,
            mask_single_line(&self.subject),
            detail,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    /// Parse a line written by [`LedgerEntry::to_line`].
    pub fn parse(line: &str) -> Option<Self> {
        let (head, ts) = line.trim().rsplit_once(" - ")?;
        let timestamp = parse_timestamp(ts)?;

        let (_marker, rest) = head.split_once(' ')?;
        let (outcome, rest) = rest.split_once(": ")?;
        let outcome = Outcome::parse(outcome)?;

        let (stage, rest) = rest.split_once(" of *")?;
        let close = rest.find('*')?;
        let subject = &rest[..close];
        let tail = rest[close + 1..].trim();
        let detail = tail
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .map(str::to_string);

        Some(Self {
            timestamp,
            stage: stage.to_string(),
            outcome,
            subject: subject.to_string(),
            detail,
        })
    }
}

/// Parse the dash-delimited timestamp suffix: RFC 3339, or epoch millis as
/// written by older ledgers.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    }
    None
}

/// Timestamp embedded in any ledger line, parsed or not.
fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    line.trim()
        .rsplit_once(" - ")
        .and_then(|(_, ts)| parse_timestamp(ts))
}

/// Classify the first ledger record.
///
/// Unparseable records fall back to a substring check so format drift in
/// older ledgers does not wedge the archiver in `Busy`.
pub fn classify(first_record: Option<&str>) -> Readiness {
    let Some(line) = first_record else {
        return Readiness::Ready;
    };
    match LedgerEntry::parse(line) {
        Some(entry) if entry.outcome.is_terminal() => Readiness::Ready,
        Some(_) => Readiness::Busy,
        None if line.contains("Complete") || line.contains("Failed") => Readiness::Ready,
        None => Readiness::Busy,
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_raw(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", self.path.display())),
        }
    }

    /// Prepend `entry`. The file is replaced via rename so a crash mid-write
    /// leaves the previous ledger intact.
    pub fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let existing = self.read_raw()?;
        let line = entry.to_line();
        let data = if existing.is_empty() {
            format!("{}\n", line)
        } else {
            format!("{}\n{}", line, existing)
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        tracing::info!(target: "channel_archive::ledger", "{}", line);
        Ok(())
    }

    /// The newest record, skipping leading blank lines.
    pub fn first_record(&self) -> Result<Option<String>> {
        let data = self.read_raw()?;
        Ok(data
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string))
    }

    pub fn read_status(&self) -> Result<Readiness> {
        let first = self.first_record()?;
        Ok(classify(first.as_deref()))
    }

    /// Lines from the top of the ledger whose timestamp lies within `window`
    /// of `now`. Lines without a timestamp ride along; the scan stops at the
    /// first timestamped line older than the window.
    pub fn recent_activity(&self, window: Duration, now: DateTime<Utc>) -> Result<Vec<String>> {
        let data = self.read_raw()?;
        let cutoff = now - window;
        let mut out = Vec::new();

        for line in data.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            match line_timestamp(line) {
                None => out.push(line.to_string()),
                Some(ts) if ts >= cutoff => out.push(line.to_string()),
                Some(_) => break,
            }
        }

        Ok(out)
    }

    pub fn render_recent_activity(&self, window: Duration) -> Result<String> {
        let lines = self.recent_activity(window, Utc::now())?;
        let hours = window.num_hours();
        if lines.is_empty() {
            return Ok(format!("Nothing archived in the last {} hours.", hours));
        }
        Ok(format!(
            "Activity in the last {} hours:\n{}",
            hours,
            lines.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, Ledger) {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::new(tmp.path().join("log.txt"));
        (tmp, ledger)
    }

    #[test]
    fn empty_ledger_is_ready() {
        let (_tmp, ledger) = ledger();
        assert_eq!(ledger.read_status().unwrap(), Readiness::Ready);
        fs::write(ledger.path(), "").unwrap();
        assert_eq!(ledger.read_status().unwrap(), Readiness::Ready);
    }

    #[test]
    fn newest_complete_is_ready() {
        let (_tmp, ledger) = ledger();
        ledger
            .append(&LedgerEntry::new("Export", Outcome::Initiating, "general"))
            .unwrap();
        ledger
            .append(&LedgerEntry::new("Export", Outcome::Complete, "general"))
            .unwrap();
        assert_eq!(ledger.read_status().unwrap(), Readiness::Ready);
    }

    #[test]
    fn newest_failed_is_ready() {
        let (_tmp, ledger) = ledger();
        ledger
            .append(&LedgerEntry::new("Export", Outcome::Initiating, "general"))
            .unwrap();
        ledger
            .append(
                &LedgerEntry::new("Export", Outcome::Failed, "general").with_detail("boom"),
            )
            .unwrap();
        assert_eq!(ledger.read_status().unwrap(), Readiness::Ready);
    }

    #[test]
    fn newest_initiating_is_busy() {
        let (_tmp, ledger) = ledger();
        ledger
            .append(&LedgerEntry::new("Export", Outcome::Complete, "general"))
            .unwrap();
        ledger
            .append(&LedgerEntry::new("Index", Outcome::Initiating, "general"))
            .unwrap();
        assert_eq!(ledger.read_status().unwrap(), Readiness::Busy);
    }

    #[test]
    fn append_prepends() {
        let (_tmp, ledger) = ledger();
        ledger
            .append(&LedgerEntry::new("Export", Outcome::Initiating, "a"))
            .unwrap();
        ledger
            .append(&LedgerEntry::new("Ingest", Outcome::Initiating, "b"))
            .unwrap();
        let data = fs::read_to_string(ledger.path()).unwrap();
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Ingest of *b*"));
        assert!(lines[1].contains("Export of *a*"));
    }

    #[test]
    fn line_roundtrip_keeps_detail() {
        let entry = LedgerEntry::new("Upload", Outcome::Failed, "general")
            .with_detail("transport failure: HTTP 503\nretry later");
        let parsed = LedgerEntry::parse(&entry.to_line()).unwrap();
        assert_eq!(parsed.stage, "Upload");
        assert_eq!(parsed.outcome, Outcome::Failed);
        assert_eq!(parsed.subject, "general");
        assert_eq!(
            parsed.detail.as_deref(),
            Some("transport failure: HTTP 503 retry later")
        );
        assert!(entry.to_line().starts_with("🟥 Failed: Upload of *general*"));
    }

    #[test]
    fn detail_with_dashes_still_parses() {
        let entry = LedgerEntry::new("Export", Outcome::Failed, "lore-1")
            .with_detail("exit - code 3 - unknown");
        let parsed = LedgerEntry::parse(&entry.to_line()).unwrap();
        assert_eq!(parsed.subject, "lore-1");
        assert_eq!(parsed.outcome, Outcome::Failed);
    }

    #[test]
    fn legacy_lines_use_substring_fallback() {
        assert_eq!(
            classify(Some("🟩 Complete: Archive and indexing of general")),
            Readiness::Ready
        );
        assert_eq!(
            classify(Some("🟩 Initiating: Archive of general")),
            Readiness::Busy
        );
        assert_eq!(
            classify(Some("🟩 Initiating: Archive of *general* - 1717171717000")),
            Readiness::Busy
        );
    }

    #[test]
    fn recent_activity_stops_outside_window() {
        let (_tmp, ledger) = ledger();
        let now = Utc::now();
        ledger
            .append(
                &LedgerEntry::new("Export", Outcome::Complete, "old")
                    .at(now - Duration::hours(30)),
            )
            .unwrap();
        ledger
            .append(
                &LedgerEntry::new("Export", Outcome::Complete, "older-but-above")
                    .at(now - Duration::hours(40)),
            )
            .unwrap();
        ledger
            .append(
                &LedgerEntry::new("Export", Outcome::Initiating, "fresh")
                    .at(now - Duration::hours(2)),
            )
            .unwrap();

        let lines = ledger.recent_activity(Duration::hours(24), now).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("*fresh*"));
    }

    #[test]
    fn recent_activity_keeps_untimestamped_lines() {
        let (_tmp, ledger) = ledger();
        let now = Utc::now();
        let fresh = LedgerEntry::new("Index", Outcome::Complete, "general").at(now);
        let old = LedgerEntry::new("Index", Outcome::Complete, "general")
            .at(now - Duration::days(3));
        fs::write(
            ledger.path(),
            format!("{}\nfree-form note\n{}\n", fresh.to_line(), old.to_line()),
        )
        .unwrap();

        let lines = ledger.recent_activity(Duration::hours(24), now).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "free-form note");
    }

    #[test]
    fn render_empty_window() {
        let (_tmp, ledger) = ledger();
        let text = ledger.render_recent_activity(Duration::hours(24)).unwrap();
        assert!(text.contains("Nothing archived in the last 24 hours"));
    }
}
