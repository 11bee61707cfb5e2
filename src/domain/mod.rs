//! Domain layer - row models and DB queries per area.
//!
//! All query functions use the generic Executor pattern, allowing them to
//! work with both `&PgPool` (for standalone queries) and `&mut PgConnection`
//! (for transactions).

pub mod accounts;
pub mod batches;
pub mod posts;
pub mod replies;
pub mod settings;
