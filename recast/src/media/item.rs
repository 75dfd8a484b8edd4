//! Media item model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata probed once during validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Unvalidated,
    Valid(MediaMetadata),
    Rejected(String),
}

/// One candidate media file flowing through the pipeline.
///
/// Items are created by the directory scan, validated exactly once, and
/// immutable afterwards; stages consume them and hand survivors forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: Uuid,
    pub path: PathBuf,
    pub status: ValidationStatus,
}

impl MediaItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            status: ValidationStatus::Unvalidated,
        }
    }

    /// An already-valid item, for callers that bypass the validation phase.
    pub fn valid(path: impl Into<PathBuf>, metadata: MediaMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            status: ValidationStatus::Valid(metadata),
        }
    }

    /// Display name used in logs and events.
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.status, ValidationStatus::Valid(_))
    }

    pub fn metadata(&self) -> Option<&MediaMetadata> {
        match &self.status {
            ValidationStatus::Valid(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn mark_valid(&mut self, metadata: MediaMetadata) {
        self.status = ValidationStatus::Valid(metadata);
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        self.status = ValidationStatus::Rejected(reason.into());
    }

    /// Successor item pointing at the artifact a stage produced. Identity and
    /// metadata carry over so downstream stages keep the probed duration.
    pub fn advanced(mut self, artifact: PathBuf) -> Self {
        self.path = artifact;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> MediaMetadata {
        MediaMetadata {
            duration_secs: 12.5,
            width: 1920,
            height: 1080,
        }
    }

    #[test]
    fn label_uses_the_file_name() {
        let item = MediaItem::new("/media/in/clip.mp4");
        assert_eq!(item.label(), "clip.mp4");
    }

    #[test]
    fn validation_transitions() {
        let mut item = MediaItem::new("/media/in/clip.mp4");
        assert!(!item.is_valid());
        assert!(item.metadata().is_none());

        item.mark_valid(meta());
        assert!(item.is_valid());
        assert_eq!(item.metadata().unwrap().width, 1920);

        item.mark_rejected("no video stream");
        assert!(!item.is_valid());
    }

    #[test]
    fn advanced_keeps_identity_and_metadata() {
        let item = MediaItem::valid("/media/in/clip.mp4", meta());
        let id = item.id;
        let next = item.advanced(PathBuf::from("/media/work/clip.mp4"));
        assert_eq!(next.id, id);
        assert_eq!(next.path, PathBuf::from("/media/work/clip.mp4"));
        assert!(next.is_valid());
    }
}
