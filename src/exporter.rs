//! Export stage: drive the external transcript exporter CLI.
//!
//! The exporter's exit code is not trusted on its own. A run counts as
//! successful only when its stdout contains the configured success marker;
//! anything else becomes [`StageError::ExternalTool`] carrying the masked
//! stdout. Every run is bounded by a timeout and the child is killed when it
//! expires.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ExporterConfig;
use crate::error::{StageError, StageResult};
use crate::mask::mask_sensitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Structured transcript consumed by the ingestion stage.
    Json,
    /// Rendered page uploaded as the archive artifact.
    HtmlDark,
}

impl ExportFormat {
    pub fn as_arg(self) -> &'static str {
        match self {
            ExportFormat::Json => "Json",
            ExportFormat::HtmlDark => "HtmlDark",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::HtmlDark => "html",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::HtmlDark => "text/html",
        }
    }
}

/// `<dir>/<channel>-<timestamp>.<ext>` with `:` and `.` in the timestamp
/// replaced by `-`.
pub fn export_destination(
    dir: &Path,
    channel_id: &str,
    format: ExportFormat,
    now: DateTime<Utc>,
) -> PathBuf {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    dir.join(format!("{}-{}.{}", channel_id, stamp, format.extension()))
}

/// Seam between the pipeline and whatever produces transcripts.
#[async_trait]
pub trait TranscriptExporter: Send + Sync {
    /// Export `channel_id` to `dest`, returning the exporter's stdout.
    async fn export(
        &self,
        channel_id: &str,
        format: ExportFormat,
        dest: &Path,
    ) -> StageResult<String>;
}

/// Runs the exporter binary as a subprocess.
pub struct CommandExporter {
    bin: PathBuf,
    token: String,
    success_marker: String,
    timeout: Duration,
}

impl CommandExporter {
    pub fn new(config: &ExporterConfig, token: impl Into<String>) -> Self {
        Self {
            bin: config.bin.clone(),
            token: token.into(),
            success_marker: config.success_marker.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// One exporter invocation with an explicit token.
    pub async fn run(
        &self,
        channel_id: &str,
        token: &str,
        format: ExportFormat,
        dest: &Path,
    ) -> StageResult<String> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = Command::new(&self.bin);
        cmd.arg("export")
            .arg("-t")
            .arg(token)
            .arg("-c")
            .arg(channel_id)
            .arg("-f")
            .arg(format.as_arg())
            .arg("-o")
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(
            command = %mask_sensitive(&format!(
                "{} export -t {} -c {} -f {} -o {}",
                self.bin.display(),
                token,
                channel_id,
                format.as_arg(),
                dest.display()
            )),
            "running exporter"
        );

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(StageError::ExternalTool(format!(
                    "failed to run {}: {}",
                    self.bin.display(),
                    e
                )))
            }
            Err(_) => return Err(StageError::Timeout(self.timeout.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(stderr = %mask_sensitive(stderr.trim()), "exporter wrote to stderr");
        }

        classify_output(output.status.code(), &stdout, &self.success_marker)?;
        Ok(stdout)
    }
}

/// Success requires a zero exit (when known) and the marker in stdout.
fn classify_output(code: Option<i32>, stdout: &str, marker: &str) -> StageResult<()> {
    let masked = || mask_sensitive(stdout.trim());
    match code {
        Some(0) | None if stdout.contains(marker) => Ok(()),
        Some(0) | None => Err(StageError::ExternalTool(masked())),
        Some(code) => Err(StageError::ExternalTool(format!(
            "exit status {}: {}",
            code,
            masked()
        ))),
    }
}

#[async_trait]
impl TranscriptExporter for CommandExporter {
    async fn export(
        &self,
        channel_id: &str,
        format: ExportFormat,
        dest: &Path,
    ) -> StageResult<String> {
        self.run(channel_id, &self.token, format, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn destination_name_is_filesystem_safe() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 30, 5).unwrap();
        let path = export_destination(Path::new("/a/raw"), "42", ExportFormat::Json, now);
        assert_eq!(
            path,
            PathBuf::from("/a/raw/42-2026-10-17T12-30-05-000Z.json")
        );
    }

    #[test]
    fn exit_zero_without_marker_is_failure() {
        let err = classify_output(Some(0), "Exporting... done?", "Successfully exported")
            .unwrap_err();
        assert!(matches!(err, StageError::ExternalTool(ref s) if s.contains("done?")));
    }

    #[test]
    fn nonzero_exit_is_failure_even_with_marker() {
        let err = classify_output(Some(2), "Successfully exported 1 channel", "Successfully exported")
            .unwrap_err();
        assert!(err.to_string().contains("exit status 2"));
    }

    #[test]
    fn marker_means_success() {
        classify_output(Some(0), "Successfully exported 1 channel(s).", "Successfully exported")
            .unwrap();
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("exporter.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn exporter(bin: PathBuf, timeout_secs: u64) -> CommandExporter {
            CommandExporter::new(
                &ExporterConfig {
                    bin,
                    success_marker: "Successfully exported".to_string(),
                    timeout_secs,
                },
                "token",
            )
        }

        #[tokio::test]
        async fn marker_absent_with_exit_zero_fails() {
            let tmp = TempDir::new().unwrap();
            let bin = script(tmp.path(), "echo 'Channel is empty'\nexit 0");
            let err = exporter(bin, 10)
                .export("42", ExportFormat::Json, &tmp.path().join("out.json"))
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::ExternalTool(ref s) if s.contains("Channel is empty")));
        }

        #[tokio::test]
        async fn marker_present_succeeds() {
            let tmp = TempDir::new().unwrap();
            let bin = script(tmp.path(), "echo 'Successfully exported 1 channel(s).'");
            let out = exporter(bin, 10)
                .export("42", ExportFormat::HtmlDark, &tmp.path().join("x/out.html"))
                .await
                .unwrap();
            assert!(out.contains("Successfully exported"));
            assert!(tmp.path().join("x").is_dir());
        }

        #[tokio::test]
        async fn hung_exporter_times_out() {
            let tmp = TempDir::new().unwrap();
            let bin = script(tmp.path(), "sleep 5");
            let err = exporter(bin, 1)
                .export("42", ExportFormat::Json, &tmp.path().join("out.json"))
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Timeout(1)));
        }

        #[tokio::test]
        async fn missing_binary_is_external_tool_failure() {
            let tmp = TempDir::new().unwrap();
            let err = exporter(tmp.path().join("nope"), 10)
                .export("42", ExportFormat::Json, &tmp.path().join("out.json"))
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::ExternalTool(_)));
        }
    }
}
