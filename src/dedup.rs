use std::collections::HashSet;

use tracing::{error, info};

use crate::error::StoreError;
use crate::storage::RecordStore;
use crate::video::{AnalyzedVideo, StoredRow};

/// Appends the videos the store has not seen yet, in their original order.
///
/// An unreadable key column counts as empty, so every video is treated as new
/// (duplicates are preferred over silently dropping a run). Repeats within
/// `videos` itself are appended once. Returns the appended videos.
pub async fn append_new(
    store: &dyn RecordStore,
    videos: Vec<AnalyzedVideo>,
) -> Result<Vec<AnalyzedVideo>, StoreError> {
    let mut known = match store.existing_keys().await {
        Ok(keys) => keys,
        Err(e) => {
            error!(error = %e, "Could not read existing urls, treating every video as new");
            HashSet::new()
        }
    };

    let fresh: Vec<AnalyzedVideo> = videos
        .into_iter()
        .filter(|v| known.insert(v.url().to_string()))
        .collect();

    if fresh.is_empty() {
        info!("No new videos to append");
        return Ok(fresh);
    }

    let rows: Vec<StoredRow> = fresh.iter().map(AnalyzedVideo::to_row).collect();
    debug_assert!(rows.iter().all(StoredRow::score_is_consistent));
    store.append_rows(&rows).await?;
    info!(count = fresh.len(), "Appended new videos");
    Ok(fresh)
}
