//! Ingestion stage: exported transcripts → message store.
//!
//! Each transcript is parsed as a whole; a malformed file fails the stage.
//! Rows are upserted one at a time with no cross-file transaction, so files
//! processed before a failure stay ingested. When draining the raw directory,
//! a malformed file is moved to `failed/` and the remaining files are still
//! ingested before the stage reports the failure.

use anyhow::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::error::{StageError, StageResult};
use crate::models::{Message, Transcript};
use crate::store::MessageStore;

/// Subdirectory of the raw export dir that holds already-ingested files.
pub const PROCESSED_DIR: &str = "processed";
/// Subdirectory of the raw export dir that holds transcripts that failed to parse.
pub const FAILED_DIR: &str = "failed";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files: usize,
    pub upserted: u64,
    pub skipped_empty: u64,
}

pub fn parse_transcript(path: &Path) -> StageResult<Transcript> {
    let data = fs::read_to_string(path)
        .map_err(|e| StageError::Data(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&data)
        .map_err(|e| StageError::Data(format!("malformed transcript {}: {}", path.display(), e)))
}

/// Upsert every non-empty message from `files`.
pub async fn ingest(store: &MessageStore, files: &[PathBuf]) -> StageResult<IngestReport> {
    let mut report = IngestReport::default();
    for path in files {
        let (upserted, skipped) = ingest_file(store, path).await?;
        report.files += 1;
        report.upserted += upserted;
        report.skipped_empty += skipped;
    }
    Ok(report)
}

async fn ingest_file(store: &MessageStore, path: &Path) -> StageResult<(u64, u64)> {
    let transcript = parse_transcript(path)?;
    store_transcript(store, path, transcript).await
}

async fn store_transcript(
    store: &MessageStore,
    path: &Path,
    transcript: Transcript,
) -> StageResult<(u64, u64)> {
    let channel_id = transcript.channel.id;
    let mut upserted = 0u64;
    let mut skipped = 0u64;

    for raw in transcript.messages {
        let content = match raw.content {
            Some(c) if !c.is_empty() => c,
            _ => {
                skipped += 1;
                continue;
            }
        };
        let message = Message {
            id: raw.id,
            content,
            author_id: raw.author.id,
            channel_id: channel_id.clone(),
            sent_at: raw.timestamp,
            indexed: false,
        };
        store.upsert(&message).await?;
        upserted += 1;
    }

    debug!(
        file = %path.display(),
        upserted,
        skipped,
        "ingested transcript"
    );
    Ok((upserted, skipped))
}

/// Transcripts sitting directly in `raw_dir`, sorted by name.
pub fn pending_transcripts(raw_dir: &Path) -> StageResult<Vec<PathBuf>> {
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(raw_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Ingest every pending transcript, moving each into `processed/` once its
/// rows are stored. Transcripts that fail to parse go to `failed/`; the rest
/// are still ingested and the stage then fails with the list of bad files.
pub async fn ingest_pending(store: &MessageStore, raw_dir: &Path) -> StageResult<IngestReport> {
    let files = pending_transcripts(raw_dir)?;
    if files.is_empty() {
        info!(dir = %raw_dir.display(), "no pending transcripts");
        return Ok(IngestReport::default());
    }

    let processed = raw_dir.join(PROCESSED_DIR);
    fs::create_dir_all(&processed)?;

    let mut report = IngestReport::default();
    let mut rejected = Vec::new();
    for path in &files {
        let transcript = match parse_transcript(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "quarantining transcript");
                quarantine(raw_dir, path)?;
                rejected.push(e.to_string());
                continue;
            }
        };

        let (upserted, skipped) = store_transcript(store, path, transcript).await?;
        report.files += 1;
        report.upserted += upserted;
        report.skipped_empty += skipped;

        if let Some(name) = path.file_name() {
            if let Err(e) = fs::rename(path, processed.join(name)) {
                warn!(file = %path.display(), error = %e, "could not move ingested transcript");
            }
        }
    }

    if !rejected.is_empty() {
        return Err(StageError::Data(format!(
            "{} transcript(s) moved to {}/: {}",
            rejected.len(),
            FAILED_DIR,
            rejected.join("; ")
        )));
    }
    Ok(report)
}

fn quarantine(raw_dir: &Path, path: &Path) -> StageResult<()> {
    let failed = raw_dir.join(FAILED_DIR);
    fs::create_dir_all(&failed)?;
    if let Some(name) = path.file_name() {
        fs::rename(path, failed.join(name))?;
    }
    Ok(())
}

/// `arc ingest`: explicit files, or the pending raw directory when none given.
pub async fn run_ingest(config: &Config, files: Vec<PathBuf>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = MessageStore::new(pool.clone());

    let report = if files.is_empty() {
        ingest_pending(&store, &config.archive.raw_dir()).await?
    } else {
        ingest(&store, &files).await?
    };

    println!("ingest");
    println!("  files: {}", report.files);
    println!("  upserted messages: {}", report.upserted);
    println!("  skipped (empty): {}", report.skipped_empty);
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TRANSCRIPT: &str = r#"{
        "channel": {"id": "42", "name": "general"},
        "messages": [
            {"id": "100", "content": "first", "author": {"id": "7"}, "timestamp": "2024-01-01T00:00:00+00:00"},
            {"id": "101", "content": "", "author": {"id": "8"}, "timestamp": "2024-01-01T00:01:00+00:00"},
            {"id": "102", "author": {"id": "8"}, "timestamp": "2024-01-01T00:02:00+00:00"},
            {"id": "103", "content": "second", "author": {"id": "9"}, "timestamp": "2024-01-01T00:03:00+00:00"}
        ]
    }"#;

    async fn store() -> MessageStore {
        MessageStore::new(db::open_in_memory().await.unwrap())
    }

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn empty_content_is_never_stored() {
        let tmp = TempDir::new().unwrap();
        let file = write(tmp.path(), "a.json", TRANSCRIPT);
        let store = store().await;

        let report = ingest(&store, &[file]).await.unwrap();
        assert_eq!(report.upserted, 2);
        assert_eq!(report.skipped_empty, 2);
        assert!(store.get("101").await.unwrap().is_none());
        assert!(store.get("102").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reingest_is_idempotent_but_resets_flag() {
        let tmp = TempDir::new().unwrap();
        let file = write(tmp.path(), "a.json", TRANSCRIPT);
        let store = store().await;

        ingest(&store, &[file.clone()]).await.unwrap();
        let first = store.get("100").await.unwrap().unwrap();
        store
            .mark_indexed(&["100".to_string(), "103".to_string()])
            .await
            .unwrap();

        ingest(&store, &[file]).await.unwrap();
        let second = store.get("100").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert!(!second.indexed);
        assert_eq!(store.stats().await.unwrap().total, 2);
        assert_eq!(store.stats().await.unwrap().indexed, 0);
    }

    #[tokio::test]
    async fn malformed_file_fails_after_earlier_files_commit() {
        let tmp = TempDir::new().unwrap();
        let good = write(tmp.path(), "a.json", TRANSCRIPT);
        let bad = write(tmp.path(), "b.json", "{ not json");
        let store = store().await;

        let err = ingest(&store, &[good, bad]).await.unwrap_err();
        assert!(matches!(err, StageError::Data(_)));
        assert!(store.get("100").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn pending_files_move_to_processed() {
        let tmp = TempDir::new().unwrap();
        let raw = tmp.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        write(&raw, "42-1.json", TRANSCRIPT);
        write(&raw, "notes.txt", "ignored");
        let store = store().await;

        let report = ingest_pending(&store, &raw).await.unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.upserted, 2);
        assert!(raw.join(PROCESSED_DIR).join("42-1.json").exists());
        assert!(!raw.join("42-1.json").exists());
        assert!(raw.join("notes.txt").exists());

        let again = ingest_pending(&store, &raw).await.unwrap();
        assert_eq!(again, IngestReport::default());
    }

    #[tokio::test]
    async fn malformed_pending_file_does_not_block_later_files() {
        let tmp = TempDir::new().unwrap();
        let raw = tmp.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        write(&raw, "1-old.json", "{ truncated");
        write(&raw, "42-new.json", TRANSCRIPT);
        let store = store().await;

        let err = ingest_pending(&store, &raw).await.unwrap_err();
        assert!(matches!(err, StageError::Data(_)));
        assert!(err.to_string().contains("1-old.json"));
        assert!(store.get("100").await.unwrap().is_some());
        assert!(raw.join(FAILED_DIR).join("1-old.json").exists());
        assert!(raw.join(PROCESSED_DIR).join("42-new.json").exists());

        // the bad file no longer sits in the way of the next run
        write(&raw, "43-next.json", TRANSCRIPT);
        let report = ingest_pending(&store, &raw).await.unwrap();
        assert_eq!(report.files, 1);
        assert!(!raw.join("1-old.json").exists());
    }

    #[tokio::test]
    async fn missing_raw_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store().await;
        let report = ingest_pending(&store, &tmp.path().join("nope")).await.unwrap();
        assert_eq!(report.files, 0);
    }
}
