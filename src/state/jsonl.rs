//! Append-only JSON-lines record logs.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::error::StateError;

/// A log file opened in append mode; each record is written and flushed as a
/// single line so concurrent writers never interleave.
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLog {
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StateError::log(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StateError::log(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, record: &T) -> Result<(), StateError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| StateError::log(&self.path, e))?;
        file.flush().await.map_err(|e| StateError::log(&self.path, e))?;
        Ok(())
    }
}

/// Read every record of a log; a missing file reads as empty.
pub async fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StateError> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StateError::log(path, e)),
    };

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| StateError::log(path, e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{DeadLetterRecord, ManifestRecord};
    use chrono::Utc;
    use std::sync::Arc;

    fn manifest(asset_id: &str) -> ManifestRecord {
        ManifestRecord {
            asset_id: asset_id.to_string(),
            bucket: "media-archive".to_string(),
            manifest_url: format!("https://cdn.example.com/{}/master.m3u8", asset_id),
            renditions: vec![format!("{}/a_1.mp4", asset_id)],
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("manifests.jsonl");
        let log = JsonlLog::open(&path).await.unwrap();

        log.append(&manifest("v1")).await.unwrap();
        log.append(&manifest("v2")).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        let records: Vec<ManifestRecord> = read_all(&path).await.unwrap();
        assert_eq!(records[0].asset_id, "v1");
        assert_eq!(records[1].asset_id, "v2");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letters.jsonl");
        {
            let log = JsonlLog::open(&path).await.unwrap();
            log.append(&DeadLetterRecord::task("v1", "/r/v1/a_1.mp4", 3, "503"))
                .await
                .unwrap();
        }
        let log = JsonlLog::open(&path).await.unwrap();
        log.append(&DeadLetterRecord::asset("v1", "failed", Vec::new()))
            .await
            .unwrap();

        let records: Vec<DeadLetterRecord> = read_all(&path).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifests.jsonl");
        let log = Arc::new(JsonlLog::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&manifest(&format!("v{}", i))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records: Vec<ManifestRecord> = read_all(&path).await.unwrap();
        assert_eq!(records.len(), 32);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<ManifestRecord> = read_all(&dir.path().join("none.jsonl")).await.unwrap();
        assert!(records.is_empty());
    }
}
