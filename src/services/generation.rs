//! Reply generation worker
//!
//! Drives one post through an LLM completion and stores the parsed replies.
//! Generation is single-flight per post: a compare-and-set on `llm_status`
//! claims the post (`pending`/`completed`/`failed` -> `processing`), and a
//! concurrent claimer fails fast with `AlreadyProcessing`. The delete+insert
//! of the reply set and the `completed` flip happen in one transaction, so a
//! reader never observes a completed post with a missing or partial set.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::AppState;
use crate::constants::{LLM_BACKOFF_BASE_SECS, LLM_CALL_ATTEMPTS};
use crate::domain::posts::PostWithAccount;
use crate::domain::{posts, replies, settings};
use crate::services::llm::{CompletionRequest, LlmProvider, ProviderError};

use super::backoff_delay;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("a reply generation is already in flight for this post")]
    AlreadyProcessing,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Claim the post and run generation in the background. Surfaces
/// `AlreadyProcessing` synchronously when a generation is in flight
/// (the regenerate path)
pub async fn regenerate(state: &Arc<AppState>, post_id: i64) -> Result<(), GenerationError> {
    if !posts::claim_for_generation(&state.db, post_id).await? {
        return Err(GenerationError::AlreadyProcessing);
    }

    let task_state = state.clone();
    tokio::spawn(async move {
        run_claimed(&task_state, post_id).await;
    });

    Ok(())
}

/// Fire-and-forget trigger after a post insert (also used by startup
/// recovery). A lost claim race just means another attempt owns the post
pub fn spawn_generation(state: Arc<AppState>, post_id: i64) {
    tokio::spawn(async move {
        match posts::claim_for_generation(&state.db, post_id).await {
            Ok(true) => run_claimed(&state, post_id).await,
            Ok(false) => {
                info!("Post {}: generation already in flight, skipping trigger", post_id)
            }
            Err(e) => error!("Post {}: failed to claim for generation: {}", post_id, e),
        }
    });
}

#[derive(Debug, Error)]
enum GenerationFailure {
    #[error("post not found")]
    PostMissing,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("model returned {got} usable replies, expected {want}")]
    TooFewReplies { got: usize, want: usize },
    #[error("storage error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Core routine; the caller holds the `processing` claim
async fn run_claimed(state: &AppState, post_id: i64) {
    if let Err(failure) = generate_once(state, post_id).await {
        warn!("Post {}: reply generation failed: {}", post_id, failure);
        match posts::mark_generation_failed(&state.db, post_id, &failure.to_string()).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Post {}: failure not recorded, status changed underneath", post_id)
            }
            Err(e) => error!("Post {}: failed to record generation failure: {}", post_id, e),
        }
    }
}

async fn generate_once(state: &AppState, post_id: i64) -> Result<(), GenerationFailure> {
    let post = posts::get_post(&state.db, post_id)
        .await?
        .ok_or(GenerationFailure::PostMissing)?;

    // Fresh settings read per call: a settings change affects the next
    // generation without a restart.
    let app_settings = settings::load(&state.db).await?;
    let want = app_settings.replies_per_post.max(1) as usize;

    let user_content = build_user_content(&post, want);
    let request = CompletionRequest {
        model: &app_settings.llm_model,
        system_prompt: &app_settings.system_prompt,
        user_content: &user_content,
    };

    let raw = complete_with_retries(
        state.llm.as_ref(),
        &app_settings.openrouter_api_key,
        request,
        LLM_CALL_ATTEMPTS,
        Duration::from_secs(LLM_BACKOFF_BASE_SECS),
    )
    .await?;
    let mut reply_texts = parse_replies(&raw);

    if reply_texts.len() < want {
        // One supplemental call for a short set; still short after that and
        // the attempt fails, so a completed post never carries a partial set.
        warn!(
            "Post {}: parsed {} replies, expected {} - retrying once",
            post_id,
            reply_texts.len(),
            want
        );
        let raw = state
            .llm
            .complete(&app_settings.openrouter_api_key, request)
            .await?;
        let second = parse_replies(&raw);
        if second.len() > reply_texts.len() {
            reply_texts = second;
        }
    }

    reply_texts.truncate(want);
    if reply_texts.len() < want {
        return Err(GenerationFailure::TooFewReplies {
            got: reply_texts.len(),
            want,
        });
    }

    let mut tx = state.db.begin().await?;
    replies::delete_for_post(&mut *tx, post_id).await?;
    for (idx, text) in reply_texts.iter().enumerate() {
        replies::insert_reply(&mut *tx, post_id, (idx + 1) as i32, text, &app_settings.llm_model)
            .await?;
    }
    if !posts::mark_generation_completed(&mut *tx, post_id).await? {
        // The claim was lost (e.g. startup recovery reset the post); discard
        // rather than completing an attempt this task no longer owns.
        tx.rollback().await?;
        warn!("Post {}: generation attempt superseded, discarding replies", post_id);
        return Ok(());
    }
    tx.commit().await?;

    info!(
        "Post {}: generated {} replies with {}",
        post_id, want, app_settings.llm_model
    );
    Ok(())
}

/// Call the provider with bounded retries. Only retryable failures (rate
/// limit, server error, transport) are retried; auth errors surface
/// immediately
pub async fn complete_with_retries(
    provider: &dyn LlmProvider,
    api_key: &str,
    request: CompletionRequest<'_>,
    attempts: u32,
    base_delay: Duration,
) -> Result<String, ProviderError> {
    let mut attempt = 0;
    loop {
        match provider.complete(api_key, request).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    "LLM call failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Build the user message for one post. Media is described textually - the
/// model does not receive the files
fn build_user_content(post: &PostWithAccount, want: usize) -> String {
    let text = post.text_content.as_deref().unwrap_or("(no text)");
    let mut content = format!(
        "The following is a post published on X/Twitter by @{}:\n\n\"{}\"\n\n",
        post.account_username, text
    );

    if post.has_media {
        let count = post
            .media_urls
            .as_ref()
            .and_then(|v| v.as_array().map(|a| a.len()))
            .unwrap_or(0)
            .max(1);
        content.push_str(&format!(
            "The post also includes {count} media attachment(s) (images or video) \
             that are not shown here, so rely on the text alone.\n\n"
        ));
    }

    content.push_str(&format!(
        "Generate exactly {want} different reply suggestions that I could post as a reply \
         to this post. Each reply must be concise and suitable for X/Twitter (under 280 \
         characters). The replies should vary in tone and angle - some agreeing, some \
         challenging, some adding a new perspective.\n\n\
         Return them as a numbered list with one reply per line:\n\
         1. First reply\n\
         2. Second reply\n\n\
         Return ONLY the numbered list, no other text."
    ));

    content
}

/// Parse model output into reply strings. Accepts the numbered-list
/// convention the prompt asks for, with a JSON string-array fallback for
/// models that return one. Surrounding code fences are stripped
pub fn parse_replies(raw: &str) -> Vec<String> {
    let text = strip_code_fence(raw.trim());

    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(text) {
        return items
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect();
    }

    let mut replies: Vec<String> = Vec::new();
    for line in text.lines() {
        if let Some(rest) = strip_numbered_prefix(line) {
            replies.push(rest.trim().to_string());
        } else if let Some(current) = replies.last_mut() {
            // continuation of a wrapped reply
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(trimmed);
            }
        }
    }
    replies.retain(|r| !r.is_empty());
    replies
}

fn strip_code_fence(text: &str) -> &str {
    let Some(stripped) = text.strip_prefix("```") else {
        return text;
    };
    // drop the opening fence line (which may carry a language tag), then the
    // closing fence
    let body = stripped.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    body.rsplit_once("```")
        .map(|(inner, _)| inner)
        .unwrap_or(body)
        .trim()
}

/// "1. reply" / "2) reply" -> Some("reply")
fn strip_numbered_prefix(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &trimmed[digits..];
    rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_parse_numbered_list() {
        let raw = "1. Great point, totally agree.\n2. Have you considered the opposite?\n3. This changed how I think about it.";
        let replies = parse_replies(raw);
        assert_eq!(
            replies,
            vec![
                "Great point, totally agree.",
                "Have you considered the opposite?",
                "This changed how I think about it.",
            ]
        );
    }

    #[test]
    fn test_parse_paren_numbering_and_preamble() {
        let raw = "Here are your replies:\n1) First\n2) Second";
        assert_eq!(parse_replies(raw), vec!["First", "Second"]);
    }

    #[test]
    fn test_parse_wrapped_reply_lines() {
        let raw = "1. A reply that wraps\nonto a second line\n2. Short one";
        assert_eq!(
            parse_replies(raw),
            vec!["A reply that wraps onto a second line", "Short one"]
        );
    }

    #[test]
    fn test_parse_json_array() {
        let raw = r#"["First reply", "Second reply"]"#;
        assert_eq!(parse_replies(raw), vec!["First reply", "Second reply"]);
    }

    #[test]
    fn test_parse_fenced_json_array() {
        let raw = "```json\n[\"One\", \"Two\"]\n```";
        assert_eq!(parse_replies(raw), vec!["One", "Two"]);
    }

    #[test]
    fn test_parse_unusable_output() {
        assert!(parse_replies("I cannot help with that.").is_empty());
        assert!(parse_replies("").is_empty());
    }

    fn sample_post(has_media: bool) -> PostWithAccount {
        PostWithAccount {
            id: 1,
            account_id: 1,
            batch_id: Some(1),
            account_username: "alice".to_string(),
            account_display_name: None,
            account_profile_image_url: None,
            external_post_id: "123".to_string(),
            post_url: "https://x.com/alice/status/123".to_string(),
            text_content: Some("big launch day".to_string()),
            has_media,
            media_urls: has_media.then(|| serde_json::json!(["https://pbs.twimg.com/a.jpg"])),
            media_local_paths: None,
            post_type: "tweet".to_string(),
            posted_at: Utc::now(),
            scraped_at: Utc::now(),
            llm_status: "processing".to_string(),
            llm_error: None,
        }
    }

    #[test]
    fn test_build_user_content() {
        let content = build_user_content(&sample_post(false), 5);
        assert!(content.contains("@alice"));
        assert!(content.contains("big launch day"));
        assert!(content.contains("Generate exactly 5 different reply suggestions"));
        assert!(!content.contains("media attachment"));
    }

    #[test]
    fn test_build_user_content_mentions_media() {
        let content = build_user_content(&sample_post(true), 3);
        assert!(content.contains("1 media attachment"));
    }

    struct FailNTimes {
        fails: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for FailNTimes {
        async fn complete(
            &self,
            _api_key: &str,
            _request: CompletionRequest<'_>,
        ) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fails {
                Err(ProviderError::Api {
                    status: 503,
                    message: "upstream unavailable".to_string(),
                })
            } else {
                Ok("1. hello\n2. world".to_string())
            }
        }
    }

    struct AlwaysAuthError {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for AlwaysAuthError {
        async fn complete(
            &self,
            _api_key: &str,
            _request: CompletionRequest<'_>,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Auth("invalid key".to_string()))
        }
    }

    const REQUEST: CompletionRequest<'static> = CompletionRequest {
        model: "test-model",
        system_prompt: "sys",
        user_content: "user",
    };

    #[tokio::test]
    async fn test_transient_errors_are_retried_to_success() {
        let provider = FailNTimes {
            fails: 2,
            calls: AtomicU32::new(0),
        };
        let out = complete_with_retries(&provider, "key", REQUEST, 3, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(out, "1. hello\n2. world");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = FailNTimes {
            fails: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retries(&provider, "key", REQUEST, 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 503, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_errors_fail_with_zero_retries() {
        let provider = AlwaysAuthError {
            calls: AtomicU32::new(0),
        };
        let err = complete_with_retries(&provider, "key", REQUEST, 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
