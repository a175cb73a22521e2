pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, for EDU timestamps and log context.
pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

/// The `\0`-separated composite key used by the in-flight transaction
/// registry. The NUL byte cannot occur in a server name or transaction ID,
/// so distinct (origin, txnID) pairs can never collide.
pub fn inflight_key(origin: &str, txn_id: &str) -> String {
    format!("{origin}\u{0}{txn_id}")
}
