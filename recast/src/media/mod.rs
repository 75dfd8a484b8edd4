//! Media item model, directory scanning, and the parallel validation phase.

pub mod item;
pub mod scan;
pub mod validate;

pub use item::{MediaItem, MediaMetadata, ValidationStatus};
pub use scan::{MEDIA_EXTENSIONS, scan_directory};
pub use validate::{MediaProber, validate_items};
