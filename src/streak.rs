use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use crate::db::get_user;
use crate::error::AppError;
use crate::models::{StudyStreak, timestamp_now};

const MAX_TOUCH_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchOutcome {
    /// First qualifying activity ever.
    Started,
    /// Activity on the day after the last one.
    Extended,
    /// Gap of more than one day; streak restarted at 1.
    Restarted,
    /// Already counted today.
    Unchanged,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreakUpdate {
    pub outcome: TouchOutcome,
    pub streak: StudyStreak,
}

/// Pure transition: `(current, longest)` after an activity on
/// `activity_date` given the stored state.
pub fn next_streak(
    existing: Option<&StudyStreak>,
    activity_date: NaiveDate,
) -> Result<(TouchOutcome, i64, i64), AppError> {
    let Some(streak) = existing else {
        return Ok((TouchOutcome::Started, 1, 1));
    };

    let gap_days = (activity_date - streak.last_study_date).num_days();
    let (outcome, current) = match gap_days {
        0 => return Ok((TouchOutcome::Unchanged, streak.current_streak, streak.longest_streak)),
        1 => (TouchOutcome::Extended, streak.current_streak + 1),
        gap if gap > 1 => (TouchOutcome::Restarted, 1),
        _ => {
            return Err(AppError::OutOfOrderActivity {
                activity_date,
                last_study_date: streak.last_study_date,
            });
        }
    };

    Ok((outcome, current, streak.longest_streak.max(current)))
}

#[instrument(skip(pool))]
pub async fn get_streak(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Option<StudyStreak>, AppError> {
    let row = sqlx::query_as::<_, StudyStreak>(
        "SELECT user_id, current_streak, longest_streak, last_study_date, updated_at
         FROM study_streaks WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Count a day of study for the user. Same-day touches are no-ops; dates
/// earlier than the stored one are rejected.
///
/// Writes are compare-and-swap against the row that was read, retried when
/// a concurrent touch won, so two touches never both advance the streak.
#[instrument(skip(pool))]
pub async fn touch(
    pool: &Pool<Sqlite>,
    user_id: i64,
    activity_date: NaiveDate,
) -> Result<StreakUpdate, AppError> {
    get_user(pool, user_id).await?;

    for attempt in 1..=MAX_TOUCH_ATTEMPTS {
        let existing = get_streak(pool, user_id).await?;
        let (outcome, current, longest) = next_streak(existing.as_ref(), activity_date)?;

        if let (TouchOutcome::Unchanged, Some(streak)) = (outcome, &existing) {
            debug!("Activity already counted for this day");
            return Ok(StreakUpdate {
                outcome,
                streak: streak.clone(),
            });
        }

        let now = timestamp_now();
        let mut tx = pool.begin().await?;

        let swapped = match &existing {
            None => sqlx::query(
                "INSERT INTO study_streaks
                     (user_id, current_streak, longest_streak, last_study_date, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(current)
            .bind(longest)
            .bind(activity_date)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            Some(previous) => sqlx::query(
                "UPDATE study_streaks
                 SET current_streak = ?, longest_streak = ?, last_study_date = ?, updated_at = ?
                 WHERE user_id = ? AND last_study_date = ? AND current_streak = ?",
            )
            .bind(current)
            .bind(longest)
            .bind(activity_date)
            .bind(now)
            .bind(user_id)
            .bind(previous.last_study_date)
            .bind(previous.current_streak)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if swapped == 0 {
            tx.rollback().await?;
            warn!(attempt, "Concurrent streak update, retrying");
            continue;
        }

        sqlx::query(
            "UPDATE user_points SET current_streak = ?, longest_streak = ?, updated_at = ?
             WHERE user_id = ?",
        )
        .bind(current)
        .bind(longest)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(?outcome, current, longest, "Streak updated");
        return Ok(StreakUpdate {
            outcome,
            streak: StudyStreak {
                user_id,
                current_streak: current,
                longest_streak: longest,
                last_study_date: activity_date,
                updated_at: now,
            },
        });
    }

    Err(AppError::Conflict(format!(
        "Streak for user {} kept changing concurrently",
        user_id
    )))
}
