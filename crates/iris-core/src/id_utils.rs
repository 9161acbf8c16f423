use std::sync::atomic::{AtomicU64, Ordering};

use crate::time_utils::current_unix_timestamp_ms;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mints a process-unique identifier of the form `<prefix>-<unix_ms>-<count>`.
///
/// The millisecond component keeps identifiers roughly sortable by creation
/// time; the counter disambiguates identifiers minted within the same
/// millisecond.
pub fn mint_unique_id(prefix: &str) -> String {
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{count}", current_unix_timestamp_ms())
}
