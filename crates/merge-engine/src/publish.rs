//! Handing a merged artifact to storage, plus the record-merge-publish
//! workflow built on it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use duocam_common::{DuocamError, DuocamResult};

use crate::merge::{CancelToken, MergePipeline, MergeRequest, OutputArtifact, ProgressCallback};

/// Name of the metadata index kept next to published videos.
pub const METADATA_FILE: &str = "videos.json";

/// Moves an artifact somewhere addressable and returns its URL.
pub trait ArtifactPublisher: Send + Sync {
    fn publish(&self, artifact: &Path) -> DuocamResult<String>;
}

/// One published video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Publishes into a local library directory.
///
/// Each artifact is copied in as `video_<unix-millis>.<ext>` and appended
/// to `videos.json`. URLs are `file://` URLs of the copy.
#[derive(Debug, Clone)]
pub struct LocalDirectoryPublisher {
    root: PathBuf,
}

impl LocalDirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Everything published so far, newest first.
    pub fn records(&self) -> DuocamResult<Vec<VideoRecord>> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut records: Vec<VideoRecord> = serde_json::from_str(&content)?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn append_record(&self, record: VideoRecord) -> DuocamResult<()> {
        let path = self.metadata_path();
        let mut records: Vec<VideoRecord> = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        records.push(record);
        std::fs::write(&path, serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }
}

impl ArtifactPublisher for LocalDirectoryPublisher {
    fn publish(&self, artifact: &Path) -> DuocamResult<String> {
        if !artifact.is_file() {
            return Err(DuocamError::FileNotFound {
                path: artifact.to_path_buf(),
            });
        }
        std::fs::create_dir_all(&self.root)?;

        let now = Utc::now();
        let ext = artifact
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let target = self
            .root
            .join(format!("video_{}.{ext}", now.timestamp_millis()));
        std::fs::copy(artifact, &target)?;

        let absolute = target.canonicalize()?;
        let url = format!("file://{}", absolute.display());
        self.append_record(VideoRecord {
            url: url.clone(),
            created_at: now,
        })?;
        tracing::info!(url = %url, "Published artifact");
        Ok(url)
    }
}

/// Result of [`merge_and_publish`], with the message shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    pub artifact: Option<OutputArtifact>,
    pub url: Option<String>,
    pub message: String,
}

impl WorkflowOutcome {
    pub fn is_success(&self) -> bool {
        self.url.is_some()
    }
}

/// Merge two recordings, then publish the result.
pub fn merge_and_publish(
    pipeline: &MergePipeline,
    request: &MergeRequest,
    publisher: &dyn ArtifactPublisher,
    cancel: &CancelToken,
    progress: Option<ProgressCallback>,
) -> WorkflowOutcome {
    let artifact = match pipeline.merge(request, cancel, progress) {
        Ok(artifact) => artifact,
        Err(e) => {
            return WorkflowOutcome {
                artifact: None,
                url: None,
                message: format!("❌ Merge failed: {}", e.user_message()),
            }
        }
    };
    match publisher.publish(&artifact.path) {
        Ok(url) => WorkflowOutcome {
            message: format!("✅ Uploaded to {url}"),
            artifact: Some(artifact),
            url: Some(url),
        },
        Err(e) => {
            tracing::error!(error = %e, "Publishing failed");
            WorkflowOutcome {
                artifact: Some(artifact),
                url: None,
                message: format!("❌ Upload failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_copies_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("merged_output.mp4");
        std::fs::write(&artifact, b"not really a video").unwrap();

        let publisher = LocalDirectoryPublisher::new(dir.path().join("library"));
        let url = publisher.publish(&artifact).unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(".mp4"));

        let records = publisher.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, url);

        let copied = PathBuf::from(url.trim_start_matches("file://"));
        assert_eq!(std::fs::read(copied).unwrap(), b"not really a video");
        assert!(artifact.exists());
    }

    #[test]
    fn test_records_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.y4m");
        std::fs::write(&artifact, b"x").unwrap();
        let publisher = LocalDirectoryPublisher::new(dir.path().join("library"));
        publisher.publish(&artifact).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        publisher.publish(&artifact).unwrap();

        let records = publisher.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].created_at >= records[1].created_at);
    }

    #[test]
    fn test_publish_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = LocalDirectoryPublisher::new(dir.path());
        let err = publisher.publish(&dir.path().join("nope.mp4")).unwrap_err();
        assert!(matches!(err, DuocamError::FileNotFound { .. }));
        assert!(publisher.records().unwrap().is_empty());
    }
}
