//! Spool directory source.
//!
//! Producers drop `*.json` files into a directory; each file is one batch,
//! either an `IngestBatch` object or a bare array of raw items. Files are
//! taken in file-name order and renamed to `.done` once parsed, or `.bad` if
//! they do not parse, so a file is handed out at most once.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SourceError;
use crate::ingest::{IngestBatch, ItemSource};
use crate::items::RawItem;

#[derive(Deserialize)]
#[serde(untagged)]
enum SpoolFile {
    Items(Vec<RawItem>),
    Batch(IngestBatch),
}

pub struct SpoolSource {
    name: String,
    dir: PathBuf,
}

impl SpoolSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "spool".into(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn oldest_pending(&self) -> Result<Option<PathBuf>, SourceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut oldest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if oldest.as_ref().is_none_or(|o| path < *o) {
                oldest = Some(path);
            }
        }
        Ok(oldest)
    }

    fn parse(&self, bytes: &[u8], path: &Path) -> Result<IngestBatch, SourceError> {
        let file: SpoolFile =
            serde_json::from_slice(bytes).map_err(|e| SourceError::Malformed {
                name: self.name.clone(),
                reason: format!("{}: {e}", path.display()),
            })?;
        let mut batch = match file {
            SpoolFile::Items(items) => IngestBatch::new("", items),
            SpoolFile::Batch(batch) => batch,
        };
        if batch.source.is_empty() {
            batch.source = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.clone());
        }
        Ok(batch)
    }
}

#[async_trait]
impl ItemSource for SpoolSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_batch(&self) -> Result<Option<IngestBatch>, SourceError> {
        let Some(path) = self.oldest_pending().await? else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path).await?;

        match self.parse(&bytes, &path) {
            Ok(batch) => {
                tokio::fs::rename(&path, path.with_extension("done")).await?;
                tracing::info!(
                    file = %path.display(),
                    items = batch.items.len(),
                    "Picked up spool batch"
                );
                Ok(Some(batch))
            }
            Err(e) => {
                tokio::fs::rename(&path, path.with_extension("bad")).await?;
                tracing::warn!(file = %path.display(), error = %e, "Rejected malformed spool file");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::UpstreamSignal;

    #[tokio::test]
    async fn empty_spool_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = SpoolSource::new(dir.path().join("incoming"));
        assert!(source.next_batch().await.unwrap().is_none());
        assert!(source.dir().is_dir());
    }

    #[tokio::test]
    async fn files_are_taken_in_name_order_and_marked_done() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("002.json"),
            r#"{"source":"market","items":[{"title":"B"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("001.json"), r#"[{"title":"A"}]"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = SpoolSource::new(dir.path());
        let first = source.next_batch().await.unwrap().unwrap();
        assert_eq!(first.source, "001");
        assert_eq!(first.items[0].title, "A");
        assert_eq!(first.signal, UpstreamSignal::Clear);

        let second = source.next_batch().await.unwrap().unwrap();
        assert_eq!(second.source, "market");

        assert!(source.next_batch().await.unwrap().is_none());
        assert!(dir.path().join("001.done").exists());
        assert!(dir.path().join("002.done").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn malformed_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let source = SpoolSource::new(dir.path());
        assert!(matches!(
            source.next_batch().await,
            Err(SourceError::Malformed { .. })
        ));
        assert!(dir.path().join("broken.bad").exists());
        assert!(source.next_batch().await.unwrap().is_none());
    }
}
