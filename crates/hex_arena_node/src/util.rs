//! Small shared helpers for the node runtime.

use chrono::{DateTime, Utc};
use hex_arena::truncate_to_second;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in unix milliseconds, for gossip timestamps.
pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

/// Wall clock truncated to whole seconds, the precision stored in
/// snapshots and summaries.
pub fn now_second() -> DateTime<Utc> {
    truncate_to_second(Utc::now())
}

/// SHA256 of bytes as a hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hex-arena"),
            sha256_hex(b"hex-arena"),
        );
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
        assert_eq!(sha256_hex(b"").len(), 64);
    }

    #[test]
    fn now_second_has_no_subseconds() {
        assert_eq!(now_second().timestamp_subsec_millis(), 0);
    }
}
