use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{
    events::{CaptureEvent, RecordingFile},
    normalizer::parse_session,
    RecorderError, Result,
};

/// Writes finished recordings as uniquely named JSON files.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<slug>-<local time>-<short id>.json` inside the store directory.
    pub fn unique_path(&self, name: &str) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.dir
            .join(format!("{}-{stamp}-{}.json", slugify(name), &id[..8]))
    }

    pub async fn write(&self, file: &RecordingFile) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.unique_path(&file.name);
        write_to(&path, file).await?;
        Ok(path)
    }

    /// Write to the store, retrying once at `fallback` when that fails.
    pub async fn write_with_fallback(
        &self,
        file: &RecordingFile,
        fallback: &Path,
    ) -> Result<PathBuf> {
        match self.write(file).await {
            Ok(path) => Ok(path),
            Err(e) => {
                warn!(
                    "❌ Error saving workflow: {}. Attempting fallback location {}",
                    e,
                    fallback.display()
                );
                match write_to(fallback, file).await {
                    Ok(()) => {
                        info!("✅ Workflow saved to fallback location: {}", fallback.display());
                        Ok(fallback.to_path_buf())
                    }
                    Err(fallback_err) => Err(RecorderError::Persistence(format!(
                        "primary write failed ({e}); fallback {} failed ({fallback_err})",
                        fallback.display()
                    ))),
                }
            }
        }
    }
}

pub async fn write_to(path: &Path, file: &RecordingFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(file)?;
    tokio::fs::write(path, json).await?;
    info!(
        "✅ Recording saved to {} ({} steps)",
        path.display(),
        file.total_steps
    );
    Ok(())
}

pub async fn load_recording(path: impl AsRef<Path>) -> Result<RecordingFile> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read a raw capture log in either of the shapes [`parse_session`] accepts.
pub async fn load_capture_log(path: impl AsRef<Path>) -> Result<Vec<CaptureEvent>> {
    let bytes = tokio::fs::read(path.as_ref()).await?;
    parse_session(serde_json::from_slice(&bytes)?)
}

/// Lower-case file-name-safe form of a workflow name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "recording".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Step, StepKind};

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Book a Flight!"), "book-a-flight");
        assert_eq!(slugify("  ***  "), "recording");
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(dir.path().join("nested"));
        let file = RecordingFile::new(
            "search",
            "find things",
            vec![
                Step {
                    step_number: 1,
                    ..Step::navigation(1, "https://example.com/")
                },
                Step {
                    step_number: 2,
                    ..Step::new(
                        2,
                        "https://example.com/",
                        StepKind::Click {
                            selector: "#go".into(),
                            element_tag: Some("BUTTON".into()),
                            element_text: None,
                        },
                    )
                },
            ],
        );
        let path = store.write(&file).await.unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(load_recording(&path).await.unwrap(), file);
    }

    #[tokio::test]
    async fn test_fallback_used_when_store_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let store = RecordingStore::new(blocker.join("out"));
        let fallback = dir.path().join("workflow_fallback.json");
        let file = RecordingFile::new("x", "", Vec::new());
        let path = store.write_with_fallback(&file, &fallback).await.unwrap();
        assert_eq!(path, fallback);
        assert!(fallback.exists());
    }

    #[tokio::test]
    async fn test_load_capture_log_accepts_wrapped_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r##"{"events": [{"type": "click", "url": "u", "cssSelector": "#a"}, "noise"]}"##,
        )
        .unwrap();
        let events = load_capture_log(&path).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].selector(), Some("#a"));
        assert!(load_capture_log(dir.path().join("missing.json")).await.is_err());
    }
}
