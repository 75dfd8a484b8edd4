//! Directory scanning for candidate media files.

use std::path::Path;

use tracing::debug;

use super::item::MediaItem;
use crate::error::Result;

/// File extensions considered candidate media (matched case-insensitively).
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "avi", "flv", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg", "ts", "webm", "wmv",
];

/// Scan a directory (non-recursive) for candidate media files.
///
/// Items come back in path order so admission downstream is deterministic.
pub async fn scan_directory(dir: &Path) -> Result<Vec<MediaItem>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut items = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let matched = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if matched {
            items.push(MediaItem::new(path));
        } else {
            debug!(path = %path.display(), "skipping non-media entry");
        }
    }
    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mp4", "a.MKV", "notes.txt", "c.mov"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.mp4")).unwrap();

        let items = scan_directory(dir.path()).await.unwrap();
        let names: Vec<String> = items.iter().map(|i| i.label()).collect();
        assert_eq!(names, vec!["a.MKV", "b.mp4", "c.mov"]);
    }

    #[tokio::test]
    async fn scan_of_missing_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_directory(&missing).await.is_err());
    }
}
