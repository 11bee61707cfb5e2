/// Attempts per account fetch before the failure is recorded against the
/// account (only transient source errors are retried).
pub const SOURCE_FETCH_ATTEMPTS: u32 = 3;
/// Base backoff for source fetch retries; doubles per attempt.
pub const SOURCE_BACKOFF_BASE_SECS: u64 = 2;

/// Attempts per LLM completion call (auth failures are never retried).
pub const LLM_CALL_ATTEMPTS: u32 = 3;
/// Base backoff for LLM call retries; doubles per attempt.
pub const LLM_BACKOFF_BASE_SECS: u64 = 2;

/// Bounds for the replies-per-post setting (also enforced by a DB CHECK).
pub const MIN_REPLIES_PER_POST: i32 = 1;
pub const MAX_REPLIES_PER_POST: i32 = 20;

/// Fallback `since` lookback when no completed batch exists yet.
pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;
