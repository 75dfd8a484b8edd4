//! Parallel validation phase.
//!
//! Items are split across one blocking worker per available core. Workers
//! share nothing: each probes its own slice and reports per-item results over
//! a channel. A panicking worker is pipeline-fatal; a rejected item is not.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::item::{MediaItem, MediaMetadata};
use crate::error::{Error, Result};
use crate::events::{EventBus, PipelineEvent};

/// Metadata probe collaborator. Implementations may block; probing always
/// runs on dedicated blocking workers.
pub trait MediaProber: Send + Sync {
    fn probe(&self, path: &Path) -> Result<MediaMetadata>;
}

/// Validate every item, one worker per core.
///
/// Returns the items in their original order with statuses resolved. The only
/// error is a crashed worker; per-item probe failures become rejections.
pub async fn validate_items(
    items: Vec<MediaItem>,
    prober: Arc<dyn MediaProber>,
    events: &EventBus,
) -> Result<Vec<MediaItem>> {
    let mut items = items;
    if items.is_empty() {
        return Ok(items);
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(items.len());
    let chunk_size = items.len().div_ceil(workers);
    debug!(items = items.len(), workers, "validation starting");

    let indexed: Vec<(usize, PathBuf)> = items
        .iter()
        .enumerate()
        .map(|(idx, item)| (idx, item.path.clone()))
        .collect();

    let (tx, mut rx) = mpsc::channel::<(usize, Result<MediaMetadata>)>(items.len());
    let mut join = JoinSet::new();
    for chunk in indexed.chunks(chunk_size) {
        let chunk = chunk.to_vec();
        let prober = prober.clone();
        let tx = tx.clone();
        join.spawn_blocking(move || {
            for (idx, path) in chunk {
                let result = prober.probe(&path);
                if tx.blocking_send((idx, result)).is_err() {
                    return;
                }
            }
        });
    }
    drop(tx);

    while let Some((idx, result)) = rx.recv().await {
        let item = &mut items[idx];
        match result {
            Ok(metadata) => {
                debug!(item = %item.label(), "validated");
                events.emit(PipelineEvent::ItemValidated { item: item.label() });
                item.mark_valid(metadata);
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(item = %item.label(), %reason, "rejected");
                events.emit(PipelineEvent::ItemRejected {
                    item: item.label(),
                    reason: reason.clone(),
                });
                item.mark_rejected(reason);
            }
        }
    }

    while let Some(joined) = join.join_next().await {
        joined.map_err(|e| Error::WorkerCrash(e.to_string()))?;
    }

    let valid = items.iter().filter(|i| i.is_valid()).count();
    info!(total = items.len(), valid, "validation finished");
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct ExtensionProber;

    impl MediaProber for ExtensionProber {
        fn probe(&self, path: &Path) -> Result<MediaMetadata> {
            if path.extension().and_then(|e| e.to_str()) == Some("mp4") {
                Ok(MediaMetadata {
                    duration_secs: 10.0,
                    width: 1280,
                    height: 720,
                })
            } else {
                Err(Error::validation("unsupported container"))
            }
        }
    }

    struct PanicProber;

    impl MediaProber for PanicProber {
        fn probe(&self, _path: &Path) -> Result<MediaMetadata> {
            panic!("probe blew up");
        }
    }

    #[tokio::test]
    async fn statuses_resolve_in_original_order() {
        let items = vec![
            MediaItem::new("/in/a.mp4"),
            MediaItem::new("/in/b.avi"),
            MediaItem::new("/in/c.mp4"),
        ];
        let out = validate_items(items, Arc::new(ExtensionProber), &EventBus::new())
            .await
            .unwrap();
        assert!(out[0].is_valid());
        assert!(!out[1].is_valid());
        assert!(out[2].is_valid());
        assert_eq!(out[1].label(), "b.avi");
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let out = validate_items(Vec::new(), Arc::new(ExtensionProber), &EventBus::new())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn a_crashed_worker_is_fatal() {
        let items = vec![MediaItem::new("/in/a.mp4")];
        let err = validate_items(items, Arc::new(PanicProber), &EventBus::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerCrash(_)));
    }

    #[tokio::test]
    async fn rejections_are_broadcast() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let items = vec![MediaItem::new("/in/b.avi")];
        validate_items(items, Arc::new(ExtensionProber), &bus)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            PipelineEvent::ItemRejected { item, .. } => assert_eq!(item, "b.avi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
