//! twitterapi.io client - the production `PostSource`
//!
//! The free tier allows roughly one request per several seconds, so every
//! outbound call is paced through a shared minimum-interval gate. Window
//! fetches use the advanced-search endpoint with `since:`/`until:` operators
//! and cursor pagination.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use tracing::debug;

use super::source::{FetchQuery, PostSource, PostType, RawPost, SourceError, SourceUser};

const BASE_URL: &str = "https://api.twitterapi.io";
/// Minimum spacing between requests (free tier: 1 req / 5s, plus margin)
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(6);
/// Upper bound on advanced-search pages per account fetch
const MAX_SEARCH_PAGES: usize = 5;
/// createdAt format, e.g. "Tue Dec 10 07:00:30 +0000 2024"
const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

pub struct XApiClient {
    http: reqwest::Client,
    last_request_at: Mutex<Option<Instant>>,
}

impl XApiClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            last_request_at: Mutex::new(None),
        }
    }

    /// Wait out the minimum interval since the previous request
    async fn pace(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        api_key: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        self.pace().await;

        let url = format!("{BASE_URL}{path}");
        let resp = self
            .http
            .get(&url)
            .header("X-API-Key", api_key)
            .query(params)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(SourceError::InvalidAccount(detail));
            }
            return Err(SourceError::Unavailable(format!("{status}: {detail}")));
        }

        resp.json()
            .await
            .map_err(|e| SourceError::Unavailable(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl PostSource for XApiClient {
    async fn resolve_user(
        &self,
        api_key: &str,
        username: &str,
    ) -> Result<SourceUser, SourceError> {
        let body: UserInfoResponse = self
            .get_json(api_key, "/twitter/user/info", &[("userName", username)])
            .await?;

        let data = body
            .data
            .ok_or_else(|| SourceError::InvalidAccount(format!("@{username} not found")))?;

        Ok(SourceUser {
            id: data.id,
            username: data.user_name,
            name: data.name,
            profile_image_url: data.profile_picture.as_deref().map(upscale_avatar),
        })
    }

    async fn fetch_posts(
        &self,
        api_key: &str,
        query: FetchQuery<'_>,
    ) -> Result<Vec<RawPost>, SourceError> {
        let search = search_query(query.username, query.since, query.until);

        let mut posts = Vec::new();
        let mut cursor = String::new();
        for page in 0..MAX_SEARCH_PAGES {
            let mut params = vec![("query", search.as_str()), ("queryType", "Latest")];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }

            let body: SearchResponse = self
                .get_json(api_key, "/twitter/tweet/advanced_search", &params)
                .await?;

            for tweet in &body.tweets {
                match raw_post_from_tweet(tweet, query.username) {
                    Ok(post) => posts.push(post),
                    Err(e) => debug!("Skipping unparseable tweet: {}", e),
                }
            }

            debug!(
                "Advanced search for @{}: page {} returned {} tweets",
                query.username,
                page + 1,
                body.tweets.len()
            );

            match (body.has_next_page, body.next_cursor) {
                (true, Some(next)) if !next.is_empty() => cursor = next,
                _ => break,
            }
        }

        Ok(posts)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(rename = "userName")]
    user_name: String,
    name: String,
    #[serde(rename = "profilePicture")]
    profile_picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    tweets: Vec<ApiTweet>,
    #[serde(default)]
    has_next_page: bool,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTweet {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(rename = "isReply", default)]
    is_reply: bool,
    #[serde(default)]
    retweeted_tweet: Option<serde_json::Value>,
    #[serde(default)]
    quoted_tweet: Option<serde_json::Value>,
    #[serde(rename = "extendedEntities", default)]
    extended_entities: Option<ExtendedEntities>,
}

#[derive(Debug, Deserialize)]
struct ExtendedEntities {
    #[serde(default)]
    media: Vec<ApiMedia>,
}

#[derive(Debug, Deserialize)]
struct ApiMedia {
    #[serde(default)]
    media_url_https: Option<String>,
}

/// Tweet ids arrive as strings or bare numbers depending on endpoint
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

// ============================================================================
// Mapping helpers
// ============================================================================

/// Build the advanced-search query for one account's window
fn search_query(username: &str, since: DateTime<Utc>, until: DateTime<Utc>) -> String {
    format!(
        "from:{} since:{} until:{}",
        username,
        format_search_time(since),
        format_search_time(until)
    )
}

/// twitterapi.io search time format, e.g. "2026-02-23_11:00:00_UTC"
fn format_search_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d_%H:%M:%S_UTC").to_string()
}

/// Swap the 48px `_normal` avatar for the 200px variant
fn upscale_avatar(url: &str) -> String {
    url.replace("_normal.", "_200x200.")
}

fn post_type_of(tweet: &ApiTweet) -> PostType {
    if tweet.is_reply {
        PostType::Reply
    } else if tweet.retweeted_tweet.is_some() {
        PostType::Retweet
    } else if tweet.quoted_tweet.is_some() {
        PostType::Quote
    } else {
        PostType::Tweet
    }
}

fn raw_post_from_tweet(tweet: &ApiTweet, username: &str) -> Result<RawPost, String> {
    let posted_at = DateTime::parse_from_str(&tweet.created_at, CREATED_AT_FORMAT)
        .map_err(|e| format!("bad createdAt {:?}: {e}", tweet.created_at))?
        .with_timezone(&Utc);

    let media_urls: Vec<String> = tweet
        .extended_entities
        .as_ref()
        .map(|e| e.media.iter().filter_map(|m| m.media_url_https.clone()).collect())
        .unwrap_or_default();

    Ok(RawPost {
        external_id: tweet.id.clone(),
        url: format!("https://x.com/{}/status/{}", username, tweet.id),
        text: tweet.text.clone().filter(|t| !t.is_empty()),
        media_urls,
        post_type: post_type_of(tweet),
        posted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_tweet(extra: &str) -> ApiTweet {
        let json = format!(
            r#"{{
                "id": "1866352712940679283",
                "text": "shipping a new feature today",
                "createdAt": "Tue Dec 10 07:00:30 +0000 2024"
                {extra}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_parse_plain_tweet() {
        let tweet = sample_tweet("");
        let post = raw_post_from_tweet(&tweet, "alice").unwrap();

        assert_eq!(post.external_id, "1866352712940679283");
        assert_eq!(post.url, "https://x.com/alice/status/1866352712940679283");
        assert_eq!(post.text.as_deref(), Some("shipping a new feature today"));
        assert_eq!(post.post_type, PostType::Tweet);
        assert!(post.media_urls.is_empty());
        assert_eq!(
            post.posted_at,
            Utc.with_ymd_and_hms(2024, 12, 10, 7, 0, 30).unwrap()
        );
    }

    #[test]
    fn test_numeric_id_is_accepted() {
        let tweet: ApiTweet = serde_json::from_str(
            r#"{"id": 1866352712940679283, "createdAt": "Tue Dec 10 07:00:30 +0000 2024"}"#,
        )
        .unwrap();
        assert_eq!(tweet.id, "1866352712940679283");
    }

    #[test]
    fn test_post_type_mapping() {
        assert_eq!(post_type_of(&sample_tweet("")), PostType::Tweet);
        assert_eq!(
            post_type_of(&sample_tweet(r#", "isReply": true"#)),
            PostType::Reply
        );
        assert_eq!(
            post_type_of(&sample_tweet(r#", "retweeted_tweet": {"id": "1"}"#)),
            PostType::Retweet
        );
        assert_eq!(
            post_type_of(&sample_tweet(r#", "quoted_tweet": {"id": "1"}"#)),
            PostType::Quote
        );
        // isReply wins over quoted_tweet, matching the platform's flags
        assert_eq!(
            post_type_of(&sample_tweet(
                r#", "isReply": true, "quoted_tweet": {"id": "1"}"#
            )),
            PostType::Reply
        );
    }

    #[test]
    fn test_media_extraction() {
        let tweet = sample_tweet(
            r#", "extendedEntities": {"media": [
                {"media_url_https": "https://pbs.twimg.com/media/a.jpg", "type": "photo"},
                {"type": "video"},
                {"media_url_https": "https://pbs.twimg.com/media/b.jpg", "type": "photo"}
            ]}"#,
        );
        let post = raw_post_from_tweet(&tweet, "alice").unwrap();
        assert_eq!(
            post.media_urls,
            vec![
                "https://pbs.twimg.com/media/a.jpg",
                "https://pbs.twimg.com/media/b.jpg"
            ]
        );
    }

    #[test]
    fn test_search_query_format() {
        let since = Utc.with_ymd_and_hms(2026, 2, 23, 11, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 2, 24, 9, 30, 15).unwrap();
        assert_eq!(
            search_query("alice", since, until),
            "from:alice since:2026-02-23_11:00:00_UTC until:2026-02-24_09:30:15_UTC"
        );
    }

    #[test]
    fn test_avatar_upscale() {
        assert_eq!(
            upscale_avatar("https://pbs.twimg.com/profile_images/1/x_normal.jpg"),
            "https://pbs.twimg.com/profile_images/1/x_200x200.jpg"
        );
        // already full size: unchanged
        assert_eq!(
            upscale_avatar("https://pbs.twimg.com/profile_images/1/x_200x200.jpg"),
            "https://pbs.twimg.com/profile_images/1/x_200x200.jpg"
        );
    }
}
