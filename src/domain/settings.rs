//! App settings domain - the singleton configuration row
//!
//! The pipeline reads this row fresh at the start of every retrieval and
//! every generation call, so a settings change takes effect on the next call
//! without a restart.

use sqlx::{Executor, Postgres};

/// Snapshot of the singleton settings row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Settings {
    pub llm_model: String,
    pub system_prompt: String,
    pub replies_per_post: i32,
    pub openrouter_api_key: String,
    pub x_api_key: String,
}

/// Read the settings row (seeded by the initial migration)
pub async fn load<'e, E>(executor: E) -> Result<Settings, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT llm_model, system_prompt, replies_per_post, openrouter_api_key, x_api_key
        FROM app_settings
        WHERE id = 1
        "#,
    )
    .fetch_one(executor)
    .await
}

/// Partial update of the settings row; None leaves a column untouched
pub async fn update<'e, E>(
    executor: E,
    llm_model: Option<&str>,
    system_prompt: Option<&str>,
    replies_per_post: Option<i32>,
    openrouter_api_key: Option<&str>,
    x_api_key: Option<&str>,
) -> Result<Settings, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        UPDATE app_settings
        SET llm_model = COALESCE($1, llm_model),
            system_prompt = COALESCE($2, system_prompt),
            replies_per_post = COALESCE($3, replies_per_post),
            openrouter_api_key = COALESCE($4, openrouter_api_key),
            x_api_key = COALESCE($5, x_api_key),
            updated_at = NOW()
        WHERE id = 1
        RETURNING llm_model, system_prompt, replies_per_post, openrouter_api_key, x_api_key
        "#,
    )
    .bind(llm_model)
    .bind(system_prompt)
    .bind(replies_per_post)
    .bind(openrouter_api_key)
    .bind(x_api_key)
    .fetch_one(executor)
    .await
}
