//! Recorded-video catalog.
//!
//! Finished recordings are described by a [`VideoRecord`] and persisted as
//! one JSON document next to the media files, newest first on listing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One finished recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    /// Optional preview image, encoded by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
}

impl VideoRecord {
    /// Record for a freshly finalized file, stamped now.
    pub fn for_file(path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            path: path.into(),
            thumbnail: None,
        }
    }
}

pub trait VideoCatalog: Send + Sync {
    fn persist(&self, record: VideoRecord) -> Result<(), CatalogError>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<VideoRecord>, CatalogError>;

    fn remove(&self, id: Uuid) -> Result<(), CatalogError>;
}

/// File-backed catalog: the whole collection lives in one pretty-printed
/// JSON document, rewritten on every change.
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Vec<VideoRecord>, CatalogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, records: &[VideoRecord]) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let contents = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl VideoCatalog for JsonCatalog {
    fn persist(&self, record: VideoRecord) -> Result<(), CatalogError> {
        let mut records = self.load()?;
        records.retain(|r| r.id != record.id);
        records.push(record);
        self.save(&records)?;
        tracing::debug!("catalog now holds {} records", records.len());
        Ok(())
    }

    fn list(&self) -> Result<Vec<VideoRecord>, CatalogError> {
        let mut records = self.load()?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn remove(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut records = self.load()?;
        records.retain(|r| r.id != id);
        self.save(&records)
    }
}

/// Catalog hook for a recording pipeline: persists a record for a path the
/// moment the recorder reports it finished.
pub fn record_finished(catalog: &dyn VideoCatalog, path: &Path) -> Result<VideoRecord, CatalogError> {
    let record = VideoRecord::for_file(path);
    catalog.persist(record.clone())?;
    Ok(record)
}
