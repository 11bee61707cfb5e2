//! Post source adapter interface
//!
//! The retrieval engine talks to the social-media data API through this
//! trait, so tests can substitute a mock and the engine stays independent of
//! the concrete provider (twitterapi.io in production, see `xapi.rs`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Post classification as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostType {
    Tweet,
    Retweet,
    Quote,
    Reply,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Tweet => "tweet",
            PostType::Retweet => "retweet",
            PostType::Quote => "quote",
            PostType::Reply => "reply",
        }
    }
}

/// A resolved platform user
#[derive(Debug, Clone)]
pub struct SourceUser {
    pub id: String,
    pub username: String,
    pub name: String,
    pub profile_image_url: Option<String>,
}

/// One raw post record as returned by the source, before persistence
#[derive(Debug, Clone)]
pub struct RawPost {
    pub external_id: String,
    pub url: String,
    pub text: Option<String>,
    pub media_urls: Vec<String>,
    pub post_type: PostType,
    pub posted_at: DateTime<Utc>,
}

/// Source failure taxonomy. `InvalidAccount` permanently fails the account
/// within a batch; `Unavailable` is transient and retried with backoff
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("account not found: {0}")]
    InvalidAccount(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Fetch parameters for one account's window
#[derive(Debug, Clone, Copy)]
pub struct FetchQuery<'a> {
    pub username: &'a str,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[async_trait]
pub trait PostSource: Send + Sync {
    /// Resolve a username to its platform user record
    async fn resolve_user(&self, api_key: &str, username: &str)
    -> Result<SourceUser, SourceError>;

    /// Fetch the account's posts inside the window. Order is
    /// provider-defined but stable within a call; an empty result is success
    async fn fetch_posts(
        &self,
        api_key: &str,
        query: FetchQuery<'_>,
    ) -> Result<Vec<RawPost>, SourceError>;
}
