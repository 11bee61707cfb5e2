//! Retrieval batch engine
//!
//! One batch = one run over a set of accounts and a time window. The batch
//! row is created in `running` status and returned to the caller
//! immediately; the fetch itself happens on a spawned task. Accounts are
//! processed sequentially (the source's free tier is paced to one request
//! per several seconds, so parallel fetches would only queue), and the batch
//! reaches a terminal status only after every account has been attempted.
//! A per-account failure is recorded as an annotation; the batch as a whole
//! fails only when no account succeeded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::AppState;
use crate::constants::{DEFAULT_LOOKBACK_HOURS, SOURCE_BACKOFF_BASE_SECS, SOURCE_FETCH_ATTEMPTS};
use crate::domain::accounts::Account;
use crate::domain::batches::Batch;
use crate::domain::settings::Settings;
use crate::domain::{accounts, batches, posts, settings};
use crate::services::source::{FetchQuery, PostSource, RawPost, SourceError};
use crate::services::{generation, media};

use super::backoff_delay;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Validate the request, create the batch in `running` status, and spawn the
/// run. Returns the new batch with its accounts; completion happens
/// out-of-band and is observed by polling
pub async fn start_retrieval(
    state: &Arc<AppState>,
    account_ids: &[i64],
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<(Batch, Vec<Account>), RetrievalError> {
    if account_ids.is_empty() {
        return Err(RetrievalError::InvalidRequest(
            "at least one account must be selected".to_string(),
        ));
    }
    if let (Some(s), Some(u)) = (since, until) {
        if s >= u {
            return Err(RetrievalError::InvalidRequest(
                "since must be earlier than until".to_string(),
            ));
        }
    }

    let mut ids = account_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    // Inactive accounts may be retrieved explicitly; unknown ids may not.
    let selected = accounts::get_accounts_by_ids(&state.db, &ids).await?;
    if selected.len() != ids.len() {
        return Err(RetrievalError::InvalidRequest(
            "unknown account id(s) in request".to_string(),
        ));
    }

    let mut tx = state.db.begin().await?;
    let batch = batches::insert_batch(&mut *tx, since, until).await?;
    for account in &selected {
        batches::add_batch_account(&mut *tx, batch.id, account.id).await?;
    }
    tx.commit().await?;

    let task_state = state.clone();
    let batch_id = batch.id;
    tokio::spawn(async move {
        run_retrieval(task_state, batch_id).await;
    });

    Ok((batch, selected))
}

/// Run one batch to its terminal status. Never panics the caller: every
/// failure ends up recorded on the batch row
pub async fn run_retrieval(state: Arc<AppState>, batch_id: i64) {
    if let Err(e) = execute_batch(&state, batch_id).await {
        error!("Retrieval batch {} aborted: {}", batch_id, e);
        let message = format!("retrieval aborted: {e}");
        if let Err(e2) =
            batches::finish_batch(&state.db, batch_id, batches::STATUS_FAILED, Some(&message), 0)
                .await
        {
            error!("Retrieval batch {}: failed to record abort: {}", batch_id, e2);
        }
    }
}

async fn execute_batch(state: &Arc<AppState>, batch_id: i64) -> Result<(), sqlx::Error> {
    let Some(batch) = batches::get_batch(&state.db, batch_id).await? else {
        warn!("Retrieval batch {} disappeared before running", batch_id);
        return Ok(());
    };
    if batch.status != batches::STATUS_RUNNING {
        return Ok(());
    }

    let batch_accounts = batches::accounts_for_batch(&state.db, batch_id).await?;
    let app_settings = settings::load(&state.db).await?;
    let last_until = batches::latest_completed_until(&state.db).await?;
    let window = resolve_window(
        batch.since_at,
        batch.until_at,
        last_until,
        Utc::now(),
        lookback_hours(),
    );

    if window.since >= window.until {
        let message = format!(
            "resolved window is inverted ({} >= {})",
            window.since, window.until
        );
        batches::finish_batch(&state.db, batch_id, batches::STATUS_FAILED, Some(&message), 0)
            .await?;
        return Ok(());
    }

    info!(
        "Retrieval batch {}: {} account(s), window {} to {}",
        batch_id,
        batch_accounts.len(),
        window.since,
        window.until
    );

    let mut inserted_total: i32 = 0;
    let mut failures: Vec<String> = Vec::new();

    for account in &batch_accounts {
        match retrieve_account(state, &app_settings, window, batch_id, account).await {
            Ok(inserted) => {
                inserted_total += inserted;
                info!(
                    "Retrieval batch {}: @{} contributed {} new post(s)",
                    batch_id, account.username, inserted
                );
            }
            Err(e) => {
                warn!("Retrieval batch {}: @{} failed: {}", batch_id, account.username, e);
                failures.push(format!("@{}: {}", account.username, e));
            }
        }
    }

    let (status, error_message) = batch_outcome(batch_accounts.len(), &failures);
    batches::finish_batch(
        &state.db,
        batch_id,
        status,
        error_message.as_deref(),
        inserted_total,
    )
    .await?;

    info!(
        "Retrieval batch {} {}: {} new post(s), {} account failure(s)",
        batch_id,
        status,
        inserted_total,
        failures.len()
    );
    Ok(())
}

#[derive(Debug, Error)]
enum AccountError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("storage error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Fetch one account's window and store what is new. Returns the number of
/// newly inserted posts
async fn retrieve_account(
    state: &Arc<AppState>,
    app_settings: &Settings,
    window: Window,
    batch_id: i64,
    account: &Account,
) -> Result<i32, AccountError> {
    if account.x_user_id.is_none() {
        let user = state
            .source
            .resolve_user(&app_settings.x_api_key, &account.username)
            .await?;
        accounts::backfill_resolution(
            &state.db,
            account.id,
            &user.id,
            Some(&user.name),
            user.profile_image_url.as_deref(),
        )
        .await?;
        info!("Resolved @{} -> user id {}", user.username, user.id);
    }

    let query = FetchQuery {
        username: &account.username,
        since: window.since,
        until: window.until,
    };
    let raw_posts = fetch_with_retries(
        state.source.as_ref(),
        &app_settings.x_api_key,
        query,
        SOURCE_FETCH_ATTEMPTS,
        Duration::from_secs(SOURCE_BACKOFF_BASE_SECS),
    )
    .await?;

    let mut inserted = 0;
    for raw in &raw_posts {
        // Cheap pre-check so known posts skip the media download; the unique
        // constraint below remains the real dedup guard.
        if posts::post_exists(&state.db, account.id, &raw.external_id).await? {
            continue;
        }

        let local_paths = if raw.media_urls.is_empty() {
            Vec::new()
        } else {
            media::download_media(&state.http, &state.media_dir, &raw.external_id, &raw.media_urls)
                .await
        };

        let new_post = posts::NewPost {
            account_id: account.id,
            batch_id,
            external_post_id: &raw.external_id,
            post_url: &raw.url,
            text_content: raw.text.as_deref(),
            media_urls: &raw.media_urls,
            media_local_paths: &local_paths,
            post_type: raw.post_type.as_str(),
            posted_at: raw.posted_at,
        };

        let mut tx = state.db.begin().await?;
        match posts::insert_post_if_absent(&mut *tx, &new_post).await? {
            Some(post_id) => {
                accounts::increment_post_count(&mut *tx, account.id).await?;
                tx.commit().await?;
                inserted += 1;
                generation::spawn_generation(state.clone(), post_id);
            }
            None => {
                // a concurrent retrieval won the dedup race
                tx.rollback().await?;
            }
        }
    }

    Ok(inserted)
}

/// Fetch with bounded retries; only transient source errors are retried
pub async fn fetch_with_retries(
    source: &dyn PostSource,
    api_key: &str,
    query: FetchQuery<'_>,
    attempts: u32,
    base_delay: Duration,
) -> Result<Vec<RawPost>, SourceError> {
    let mut attempt = 0;
    loop {
        match source.fetch_posts(api_key, query).await {
            Ok(fetched) => return Ok(fetched),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff_delay(base_delay, attempt);
                warn!(
                    "Source fetch for @{} failed (attempt {}/{}), retrying in {:?}: {}",
                    query.username,
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

/// The effective fetch window for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// Resolve stored (possibly open-ended) bounds to a concrete window:
/// `until` falls back to now, `since` to the most recent completed batch's
/// `until_at`, else to a configured lookback
pub fn resolve_window(
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    last_completed_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback_hours: i64,
) -> Window {
    Window {
        since: since
            .or(last_completed_until)
            .unwrap_or_else(|| now - ChronoDuration::hours(lookback_hours)),
        until: until.unwrap_or(now),
    }
}

/// Derive the terminal status: failed only when every account failed
fn batch_outcome(total_accounts: usize, failures: &[String]) -> (&'static str, Option<String>) {
    let status = if total_accounts > 0 && failures.len() == total_accounts {
        batches::STATUS_FAILED
    } else {
        batches::STATUS_COMPLETED
    };
    let message = (!failures.is_empty()).then(|| failures.join("; "));
    (status, message)
}

fn lookback_hours() -> i64 {
    std::env::var("RETRIEVAL_LOOKBACK_HOURS")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_LOOKBACK_HOURS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::source::{PostSource, SourceUser};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_resolve_window_uses_given_bounds() {
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();

        let window = resolve_window(Some(since), Some(until), None, now, 24);
        assert_eq!(window, Window { since, until });
    }

    #[test]
    fn test_resolve_window_defaults_until_to_now() {
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();

        let window = resolve_window(Some(since), None, None, now, 24);
        assert_eq!(window.until, now);
    }

    #[test]
    fn test_resolve_window_defaults_since_to_last_completed() {
        let last = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();

        let window = resolve_window(None, None, Some(last), now, 24);
        assert_eq!(window.since, last);
        assert_eq!(window.until, now);
    }

    #[test]
    fn test_resolve_window_falls_back_to_lookback() {
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap();

        let window = resolve_window(None, None, None, now, 24);
        assert_eq!(window.since, now - ChronoDuration::hours(24));
    }

    #[test]
    fn test_batch_outcome() {
        let (status, message) = batch_outcome(2, &[]);
        assert_eq!(status, batches::STATUS_COMPLETED);
        assert!(message.is_none());

        // one of two accounts failing annotates but does not fail the batch
        let (status, message) = batch_outcome(2, &["@bob: account not found".to_string()]);
        assert_eq!(status, batches::STATUS_COMPLETED);
        assert_eq!(message.as_deref(), Some("@bob: account not found"));

        let (status, _) = batch_outcome(
            2,
            &["@alice: down".to_string(), "@bob: down".to_string()],
        );
        assert_eq!(status, batches::STATUS_FAILED);

        // the only account failing fails the batch
        let (status, _) = batch_outcome(1, &["@alice: down".to_string()]);
        assert_eq!(status, batches::STATUS_FAILED);
    }

    struct FlakySource {
        fails: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PostSource for FlakySource {
        async fn resolve_user(
            &self,
            _api_key: &str,
            username: &str,
        ) -> Result<SourceUser, SourceError> {
            Err(SourceError::InvalidAccount(username.to_string()))
        }

        async fn fetch_posts(
            &self,
            _api_key: &str,
            _query: FetchQuery<'_>,
        ) -> Result<Vec<RawPost>, SourceError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fails {
                Err(SourceError::Unavailable("rate limited".to_string()))
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct UnknownAccountSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PostSource for UnknownAccountSource {
        async fn resolve_user(
            &self,
            _api_key: &str,
            username: &str,
        ) -> Result<SourceUser, SourceError> {
            Err(SourceError::InvalidAccount(username.to_string()))
        }

        async fn fetch_posts(
            &self,
            _api_key: &str,
            _query: FetchQuery<'_>,
        ) -> Result<Vec<RawPost>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::InvalidAccount("gone".to_string()))
        }
    }

    fn query() -> FetchQuery<'static> {
        FetchQuery {
            username: "alice",
            since: chrono::DateTime::UNIX_EPOCH,
            until: chrono::DateTime::UNIX_EPOCH + ChronoDuration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_transient_fetch_failures_are_retried() {
        let source = FlakySource {
            fails: 2,
            calls: AtomicU32::new(0),
        };
        let posts = fetch_with_retries(&source, "key", query(), 3, Duration::ZERO)
            .await
            .unwrap();
        assert!(posts.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_retries_are_bounded() {
        let source = FlakySource {
            fails: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = fetch_with_retries(&source, "key", query(), 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_account_is_not_retried() {
        let source = UnknownAccountSource {
            calls: AtomicU32::new(0),
        };
        let err = fetch_with_retries(&source, "key", query(), 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::InvalidAccount(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
