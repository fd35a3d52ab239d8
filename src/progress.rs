use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};

use crate::db::get_user;
use crate::error::AppError;
use crate::models::timestamp_now;

/// Store how far the user got in a lesson video. Players report progress
/// repeatedly and may rewind, so only the furthest position counts.
#[instrument(skip(pool))]
pub async fn record_watch_time(
    pool: &Pool<Sqlite>,
    user_id: i64,
    lesson_id: i64,
    watched_seconds: i64,
) -> Result<i64, AppError> {
    if watched_seconds < 0 {
        return Err(AppError::Validation(
            "Watched seconds cannot be negative".to_string(),
        ));
    }
    get_user(pool, user_id).await?;

    let stored: i64 = sqlx::query_scalar(
        "INSERT INTO lesson_progress (user_id, lesson_id, watched_seconds, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (user_id, lesson_id) DO UPDATE SET
             watched_seconds = MAX(watched_seconds, excluded.watched_seconds),
             updated_at = excluded.updated_at
         RETURNING watched_seconds",
    )
    .bind(user_id)
    .bind(lesson_id)
    .bind(watched_seconds)
    .bind(timestamp_now())
    .fetch_one(pool)
    .await?;

    info!(stored, "Lesson progress recorded");
    Ok(stored)
}

#[instrument(skip(pool))]
pub async fn total_watch_minutes(pool: &Pool<Sqlite>, user_id: i64) -> Result<i64, AppError> {
    let seconds: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(watched_seconds), 0) FROM lesson_progress WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(seconds / 60)
}
