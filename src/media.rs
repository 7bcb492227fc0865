use std::path::{ Path, PathBuf };

use serde_json::{ json, Value };
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ Result, SearchError };
use crate::job::JobStatus;

const METADATA_SUFFIX: &str = "_metadata.json";

#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
    pub file_id: String,
    pub media_path: PathBuf,
    pub metadata: Option<Value>,
}

/// Media directory holding uploads and their `<fileId>_metadata.json` documents.
#[derive(Debug, Clone)]
pub struct MediaLibrary {
    root: PathBuf,
}

impl MediaLibrary {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rejects ids that could escape the media directory.
    pub fn validate_file_id(file_id: &str) -> Result<()> {
        let bad =
            file_id.is_empty() ||
            file_id == "." ||
            file_id.contains("..") ||
            file_id.contains('/') ||
            file_id.contains('\\') ||
            file_id.contains('\0');
        if bad {
            return Err(SearchError::Validation(format!("invalid file id: {file_id:?}")));
        }
        Ok(())
    }

    /// `<epoch-millis>_<original name>`, restricted to safe characters.
    pub fn stored_name(original: &str) -> String {
        let base = Path::new(original)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let mut cleaned: String = base
            .chars()
            .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        cleaned = cleaned.trim_start_matches('.').replace("..", "_");
        if cleaned.is_empty() {
            cleaned = "upload".to_string();
        }
        format!("{}_{}", chrono::Utc::now().timestamp_millis(), cleaned)
    }

    pub fn media_path(&self, file_id: &str) -> Result<PathBuf> {
        Self::validate_file_id(file_id)?;
        Ok(self.root.join(file_id))
    }

    pub fn metadata_path(&self, file_id: &str) -> Result<PathBuf> {
        Self::validate_file_id(file_id)?;
        Ok(self.root.join(format!("{file_id}{METADATA_SUFFIX}")))
    }

    pub async fn write_status(&self, file_id: &str, status: JobStatus) -> Result<()> {
        self.write_metadata(file_id, &json!({ "status": status, "fileId": file_id })).await
    }

    /// Stores the provider transcript alongside the final status.
    pub async fn write_completed(&self, file_id: &str, transcript: &Value) -> Result<()> {
        let mut document = match transcript {
            Value::Object(map) => Value::Object(map.clone()),
            other => json!({ "transcript": other }),
        };
        document["status"] = json!(JobStatus::Completed);
        document["fileId"] = json!(file_id);
        self.write_metadata(file_id, &document).await
    }

    async fn write_metadata(&self, file_id: &str, document: &Value) -> Result<()> {
        let path = self.metadata_path(file_id)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(document)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(file_id, path = %path.display(), "wrote metadata");
        Ok(())
    }

    pub async fn read_metadata(&self, file_id: &str) -> Result<Option<Value>> {
        let path = self.metadata_path(file_id)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn playback(&self, file_id: &str) -> Result<Playback> {
        let media_path = self.media_path(file_id)?;
        if !fs::try_exists(&media_path).await? {
            return Err(SearchError::NotFound(file_id.to_string()));
        }
        let metadata = self.read_metadata(file_id).await?;
        Ok(Playback {
            file_id: file_id.to_string(),
            media_path,
            metadata,
        })
    }

    /// Media file names, metadata documents excluded, sorted.
    pub async fn list_media(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(METADATA_SUFFIX) && !name.ends_with(".tmp") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// File ids that have a metadata document on disk.
    pub fn metadata_file_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| SearchError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.strip_suffix(METADATA_SUFFIX)) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn library() -> anyhow::Result<(MediaLibrary, TempDir)> {
        let dir = TempDir::new()?;
        let library = MediaLibrary::open(dir.path().join("media")).await?;
        Ok((library, dir))
    }

    #[test]
    fn test_validate_file_id() {
        assert!(MediaLibrary::validate_file_id("1700000000000_talk.mp4").is_ok());
        assert!(MediaLibrary::validate_file_id("1700000000000_会議.mp4").is_ok());
        for bad in ["", ".", "../db", "a/b.mp4", "a\\b.mp4", "..hidden"] {
            assert!(MediaLibrary::validate_file_id(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_stored_name() {
        let name = MediaLibrary::stored_name("../../etc/passwd");
        let (millis, rest) = name.split_once('_').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(rest, "passwd");

        let name = MediaLibrary::stored_name("my talk (final).mp4");
        assert!(name.ends_with("_my_talk__final_.mp4"));
        assert!(MediaLibrary::validate_file_id(&name).is_ok());
        assert!(MediaLibrary::stored_name("").ends_with("_upload"));
        assert!(MediaLibrary::validate_file_id(&MediaLibrary::stored_name("a..b")).is_ok());
    }

    #[tokio::test]
    async fn test_status_then_completed_document() -> anyhow::Result<()> {
        let (library, _dir) = library().await?;
        library.write_status("1_a.mp4", JobStatus::Transcribing).await?;
        let doc = library.read_metadata("1_a.mp4").await?.unwrap();
        assert_eq!(doc, json!({ "status": "transcribing", "fileId": "1_a.mp4" }));

        let transcript = json!({ "jobName": "transcribe_1", "results": { "items": [] } });
        library.write_completed("1_a.mp4", &transcript).await?;
        let doc = library.read_metadata("1_a.mp4").await?.unwrap();
        assert_eq!(doc["status"], "completed");
        assert_eq!(doc["fileId"], "1_a.mp4");
        assert_eq!(doc["jobName"], "transcribe_1");
        Ok(())
    }

    #[tokio::test]
    async fn test_playback() -> anyhow::Result<()> {
        let (library, _dir) = library().await?;
        let err = library.playback("1_a.mp4").await.unwrap_err();
        assert!(err.is_not_found());

        fs::write(library.root().join("1_a.mp4"), b"video").await?;
        let playback = library.playback("1_a.mp4").await?;
        assert!(playback.metadata.is_none());

        library.write_status("1_a.mp4", JobStatus::Uploading).await?;
        let playback = library.playback("1_a.mp4").await?;
        assert_eq!(playback.metadata.unwrap()["status"], "uploading");
        assert!(library.playback("../1_a.mp4").await.unwrap_err().is_client_error());
        Ok(())
    }

    #[tokio::test]
    async fn test_listing() -> anyhow::Result<()> {
        let (library, _dir) = library().await?;
        fs::write(library.root().join("2_b.mp4"), b"b").await?;
        fs::write(library.root().join("1_a.mp4"), b"a").await?;
        library.write_status("1_a.mp4", JobStatus::Completed).await?;
        library.write_status("3_gone.mp4", JobStatus::Error).await?;

        assert_eq!(library.list_media().await?, vec!["1_a.mp4", "2_b.mp4"]);
        assert_eq!(library.metadata_file_ids()?, vec!["1_a.mp4", "3_gone.mp4"]);
        Ok(())
    }
}
