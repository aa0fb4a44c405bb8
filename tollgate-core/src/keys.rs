//! Key construction for counters and cached values.

use std::fmt::{Display, Write};
use std::time::Duration;

use crate::clock::duration_millis;

pub const KEY_DELIMITER: char = ':';

/// Index of the fixed window containing `now_ms`.
pub fn window_index(now_ms: u64, window: Duration) -> u64 {
    now_ms / duration_millis(window).max(1)
}

/// Epoch-ms at which the window containing `now_ms` ends and the next one starts.
pub fn window_end(now_ms: u64, window: Duration) -> u64 {
    let window_ms = duration_millis(window).max(1);
    (now_ms / window_ms).saturating_add(1).saturating_mul(window_ms)
}

/// `"{prefix}:{identifier}:{window_index}"`.
///
/// Same identifier and same window always yield the same key; different windows never collide.
pub fn derive_key(prefix: &str, identifier: &str, window: Duration, now_ms: u64) -> String {
    format!(
        "{prefix}{KEY_DELIMITER}{identifier}{KEY_DELIMITER}{}",
        window_index(now_ms, window)
    )
}

/// Joins `prefix` and `parts` with `:`.
///
/// Parts are rendered with `Display` in the order given. The key is order-sensitive:
/// `("orders", "all", 50)` and `("orders", 50, "all")` name different entries.
pub fn cache_key(prefix: &str, parts: &[&dyn Display]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        key.push(KEY_DELIMITER);
        // Writing into a String cannot fail.
        let _ = write!(key, "{part}");
    }
    key
}

/// Builds a cache key from heterogeneous parts, see [`cache_key`].
///
/// ```
/// let key = tollgate_core::cache_key!("orders", "all", 50, 0);
/// assert_eq!(key, "orders:all:50:0");
/// ```
#[macro_export]
macro_rules! cache_key {
    ($prefix:expr $(, $part:expr)* $(,)?) => {
        $crate::keys::cache_key($prefix, &[$(&$part as &dyn ::std::fmt::Display),*])
    };
}
