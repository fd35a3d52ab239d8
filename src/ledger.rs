//! Append-only point ledger and the per-user aggregate it keeps in sync.
//!
//! `point_transactions` is the source of truth. `user_points` is a cache
//! that is incremented inside the same write transaction as every insert;
//! the reconciliation job can always rebuild it from the ledger.

use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use crate::config::GamificationConfig;
use crate::db::get_user;
use crate::error::AppError;
use crate::models::{
    DbPointTransaction, PointTransaction, ReasonCode, UserPoints, timestamp_now,
};

pub const MAX_HISTORY_PAGE: i64 = 100;

const USER_POINTS_COLUMNS: &str = "user_id, organization_id, total_points, courses_completed, \
     lessons_completed, quizzes_passed, certificates_earned, current_streak, longest_streak, \
     last_activity_at, updated_at";

/// A point event waiting to be ledgered.
#[derive(Debug, Clone)]
pub struct NewTransaction<'a> {
    pub user_id: i64,
    pub delta: i64,
    pub reason: ReasonCode,
    pub description: &'a str,
    pub idempotency_key: Option<&'a str>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CounterIncrements {
    courses: i64,
    lessons: i64,
    quizzes: i64,
    certificates: i64,
}

impl CounterIncrements {
    fn for_reason(reason: ReasonCode) -> Self {
        let mut inc = Self::default();
        match reason {
            ReasonCode::CourseComplete => inc.courses = 1,
            ReasonCode::LessonComplete => inc.lessons = 1,
            ReasonCode::QuizPass => inc.quizzes = 1,
            ReasonCode::CertificateEarned => inc.certificates = 1,
            _ => {}
        }
        inc
    }
}

/// Outcome of recording one point event.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub transaction: PointTransaction,
    /// `false` when the idempotency key matched an earlier transaction and
    /// nothing was appended.
    pub inserted: bool,
}

pub async fn append_points(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    tx: NewTransaction<'_>,
) -> Result<i64, AppError> {
    append_points_at(pool, config, tx, timestamp_now()).await
}

pub async fn append_points_at(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    tx: NewTransaction<'_>,
    at: NaiveDateTime,
) -> Result<i64, AppError> {
    Ok(record_points_at(pool, config, tx, at).await?.transaction.id)
}

/// Record one point event and bump the aggregate atomically.
///
/// A repeated idempotency key is a retry only when user, delta and reason
/// match the stored transaction; the stored row is returned untouched.
/// Any other reuse of the key is a `Conflict`.
#[instrument(skip(pool, config), fields(user_id = new.user_id, reason = %new.reason))]
pub async fn record_points_at(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    new: NewTransaction<'_>,
    at: NaiveDateTime,
) -> Result<Recorded, AppError> {
    if new.delta == 0 && !config.allow_zero_delta {
        return Err(AppError::InvalidDelta { delta: new.delta });
    }

    let user = get_user(pool, new.user_id).await?;
    let counters = CounterIncrements::for_reason(new.reason);

    let mut tx = pool.begin().await?;

    let inserted: Option<i64> = sqlx::query_scalar(
        "INSERT INTO point_transactions
             (user_id, delta, reason, description, idempotency_key, created_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (idempotency_key) DO NOTHING
         RETURNING id",
    )
    .bind(new.user_id)
    .bind(new.delta)
    .bind(new.reason.as_str())
    .bind(new.description)
    .bind(new.idempotency_key)
    .bind(at)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(transaction_id) = inserted else {
        let existing = sqlx::query_as::<_, DbPointTransaction>(
            "SELECT id, user_id, delta, reason, description, idempotency_key, created_at
             FROM point_transactions WHERE idempotency_key = ?",
        )
        .bind(new.idempotency_key)
        .fetch_one(&mut *tx)
        .await?;
        tx.rollback().await?;

        let existing = PointTransaction::try_from(existing)?;
        if existing.user_id != new.user_id
            || existing.delta != new.delta
            || existing.reason != new.reason
        {
            warn!(
                existing_id = existing.id,
                existing_user_id = existing.user_id,
                existing_delta = existing.delta,
                delta = new.delta,
                "Idempotency key reused for a different point event"
            );
            return Err(AppError::Conflict(format!(
                "Idempotency key {:?} already belongs to transaction {}",
                new.idempotency_key.unwrap_or_default(),
                existing.id
            )));
        }

        debug!(transaction_id = existing.id, "Duplicate idempotency key, nothing appended");
        return Ok(Recorded {
            transaction: existing,
            inserted: false,
        });
    };

    sqlx::query(
        "INSERT INTO user_points
             (user_id, organization_id, total_points, courses_completed, lessons_completed,
              quizzes_passed, certificates_earned, current_streak, longest_streak,
              last_activity_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?,
              COALESCE((SELECT current_streak FROM study_streaks WHERE user_id = ?), 0),
              COALESCE((SELECT longest_streak FROM study_streaks WHERE user_id = ?), 0),
              ?, ?)
         ON CONFLICT (user_id) DO UPDATE SET
             total_points = total_points + excluded.total_points,
             courses_completed = courses_completed + excluded.courses_completed,
             lessons_completed = lessons_completed + excluded.lessons_completed,
             quizzes_passed = quizzes_passed + excluded.quizzes_passed,
             certificates_earned = certificates_earned + excluded.certificates_earned,
             last_activity_at = MAX(last_activity_at, excluded.last_activity_at),
             updated_at = excluded.updated_at",
    )
    .bind(new.user_id)
    .bind(user.organization_id)
    .bind(new.delta)
    .bind(counters.courses)
    .bind(counters.lessons)
    .bind(counters.quizzes)
    .bind(counters.certificates)
    .bind(new.user_id)
    .bind(new.user_id)
    .bind(at)
    .bind(timestamp_now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(transaction_id, delta = new.delta, "Points appended");
    Ok(Recorded {
        transaction: PointTransaction {
            id: transaction_id,
            user_id: new.user_id,
            delta: new.delta,
            reason: new.reason,
            description: new.description.to_string(),
            idempotency_key: new.idempotency_key.map(str::to_string),
            created_at: at,
        },
        inserted: true,
    })
}

/// Cached total. Zero for users that never earned anything.
#[instrument(skip(pool))]
pub async fn total_for(pool: &Pool<Sqlite>, user_id: i64) -> Result<i64, AppError> {
    let total: Option<i64> =
        sqlx::query_scalar("SELECT total_points FROM user_points WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(total.unwrap_or(0))
}

/// Sum replayed from the ledger. Reconciliation path, not for hot reads.
#[instrument(skip(pool))]
pub async fn ledger_sum(pool: &Pool<Sqlite>, user_id: i64) -> Result<i64, AppError> {
    let sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(delta), 0) FROM point_transactions WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(sum)
}

#[instrument(skip(pool))]
pub async fn find_user_points(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Option<UserPoints>, AppError> {
    let row = sqlx::query_as::<_, UserPoints>(&format!(
        "SELECT {} FROM user_points WHERE user_id = ?",
        USER_POINTS_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_user_points(pool: &Pool<Sqlite>, user_id: i64) -> Result<UserPoints, AppError> {
    find_user_points(pool, user_id).await?.ok_or_else(|| {
        AppError::NotFound(format!("User {} has not earned any points yet", user_id))
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<PointTransaction>,
    /// Pass back as `before` to continue; `None` on the last page.
    pub next_cursor: Option<i64>,
}

/// Newest-first ledger page. `before` is the id of the last transaction of
/// the previous page; nothing is held open between calls.
#[instrument(skip(pool))]
pub async fn history(
    pool: &Pool<Sqlite>,
    user_id: i64,
    before: Option<i64>,
    limit: i64,
) -> Result<HistoryPage, AppError> {
    let limit = limit.clamp(1, MAX_HISTORY_PAGE);

    let rows = match before {
        Some(cursor) => {
            sqlx::query_as::<_, DbPointTransaction>(
                "SELECT id, user_id, delta, reason, description, idempotency_key, created_at
                 FROM point_transactions
                 WHERE user_id = ?
                   AND (created_at, id) < (SELECT created_at, id FROM point_transactions WHERE id = ?)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )
            .bind(user_id)
            .bind(cursor)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, DbPointTransaction>(
                "SELECT id, user_id, delta, reason, description, idempotency_key, created_at
                 FROM point_transactions
                 WHERE user_id = ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )
            .bind(user_id)
            .bind(limit + 1)
            .fetch_all(pool)
            .await?
        }
    };

    let mut items = rows
        .into_iter()
        .map(PointTransaction::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let next_cursor = if items.len() as i64 > limit {
        items.truncate(limit as usize);
        items.last().map(|t| t.id)
    } else {
        None
    };

    Ok(HistoryPage { items, next_cursor })
}
