//! Shared reconnect/backoff policy.
//!
//! One pure function of the attempt count, used by both the sync engine's
//! whole-drain retry loop and the push client's reconnect loop so the two
//! never drift apart.

use std::time::Duration;

/// Base delay for attempt 0.
const BASE_DELAY_MS: u64 = 1_000;
/// Delays are capped here no matter how many attempts have failed.
const MAX_DELAY_MS: u64 = 30_000;

/// Delay before retry attempt `attempt` (0-based): `min(1000 * 2^attempt, 30000)` ms.
///
/// Callers reset their attempt counter to 0 on any success (a drained
/// operation, a successful socket open).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let ms = BASE_DELAY_MS.saturating_mul(multiplier).min(MAX_DELAY_MS);
    Duration::from_millis(ms)
}
