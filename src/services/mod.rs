pub mod error;
pub mod generation;
pub mod llm;
pub mod media;
pub mod retrieval;
pub mod source;
pub mod xapi;

use std::time::Duration;

/// Exponential backoff schedule shared by the source and LLM retry loops:
/// base, 2x base, 4x base, ...
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(8));
    }
}
