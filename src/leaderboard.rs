//! Read-time rankings. Nothing here is persisted: every call ranks the
//! current aggregate rows, so there is no second copy of standings that
//! could drift from the ledger.

use chrono::{Duration, NaiveDateTime};
use sqlx::{Pool, Sqlite};
use tracing::{debug, instrument};

use crate::config::GamificationConfig;
use crate::db::get_user;
use crate::error::AppError;
use crate::models::{LeaderboardEntry, LeaderboardWindow, UserRank, timestamp_now};

#[derive(sqlx::FromRow)]
struct DbLeaderboardRow {
    user_id: i64,
    display_name: String,
    organization_id: i64,
    total_points: i64,
    courses_completed: i64,
    current_streak: i64,
    achievement_count: i64,
    last_activity_at: NaiveDateTime,
}

/// Rows must already be ordered. Equal scores share a rank and the next
/// distinct score skips past them (1, 1, 3).
fn competition_ranks(rows: Vec<DbLeaderboardRow>) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(rows.len());

    for (index, row) in rows.into_iter().enumerate() {
        let rank = match entries.last() {
            Some(prev) if prev.total_points == row.total_points => prev.rank,
            _ => index as i64 + 1,
        };

        entries.push(LeaderboardEntry {
            rank,
            user_id: row.user_id,
            display_name: row.display_name,
            organization_id: row.organization_id,
            total_points: row.total_points,
            courses_completed: row.courses_completed,
            current_streak: row.current_streak,
            achievement_count: row.achievement_count,
            last_activity_at: row.last_activity_at,
        });
    }

    entries
}

pub async fn get_leaderboard(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    organization_id: i64,
    limit: Option<i64>,
    window: LeaderboardWindow,
) -> Result<Vec<LeaderboardEntry>, AppError> {
    get_leaderboard_at(pool, config, organization_id, limit, window, timestamp_now()).await
}

/// Ties on points go to whoever got there first (earlier last activity),
/// then to the lower user id so the order is total.
#[instrument(skip(pool, config))]
pub async fn get_leaderboard_at(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    organization_id: i64,
    limit: Option<i64>,
    window: LeaderboardWindow,
    now: NaiveDateTime,
) -> Result<Vec<LeaderboardEntry>, AppError> {
    let limit = config.clamp_limit(limit);

    let rows = match window {
        LeaderboardWindow::AllTime => {
            sqlx::query_as::<_, DbLeaderboardRow>(
                "SELECT up.user_id, u.display_name, up.organization_id, up.total_points,
                        up.courses_completed, up.current_streak,
                        (SELECT COUNT(*) FROM user_achievements ua
                          WHERE ua.user_id = up.user_id) AS achievement_count,
                        up.last_activity_at
                 FROM user_points up
                 JOIN users u ON u.id = up.user_id
                 WHERE up.organization_id = ? AND u.active = TRUE
                 ORDER BY up.total_points DESC, up.last_activity_at ASC, up.user_id ASC
                 LIMIT ?",
            )
            .bind(organization_id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        LeaderboardWindow::Weekly => {
            let since = now - Duration::days(config.weekly_window_days);
            sqlx::query_as::<_, DbLeaderboardRow>(
                "SELECT pt.user_id, u.display_name, u.organization_id,
                        SUM(pt.delta) AS total_points,
                        COALESCE(up.courses_completed, 0) AS courses_completed,
                        COALESCE(up.current_streak, 0) AS current_streak,
                        (SELECT COUNT(*) FROM user_achievements ua
                          WHERE ua.user_id = pt.user_id) AS achievement_count,
                        MAX(pt.created_at) AS last_activity_at
                 FROM point_transactions pt
                 JOIN users u ON u.id = pt.user_id
                 LEFT JOIN user_points up ON up.user_id = pt.user_id
                 WHERE u.organization_id = ? AND u.active = TRUE
                   AND pt.created_at >= ? AND pt.created_at <= ?
                 GROUP BY pt.user_id
                 HAVING SUM(pt.delta) != 0
                 ORDER BY total_points DESC, last_activity_at ASC, pt.user_id ASC
                 LIMIT ?",
            )
            .bind(organization_id)
            .bind(since)
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    debug!(entries = rows.len(), "Leaderboard computed");
    Ok(competition_ranks(rows))
}

/// Position of one user on the all-time board of their organization.
/// Users without points count as zero and are not among the participants.
#[instrument(skip(pool))]
pub async fn get_user_rank(pool: &Pool<Sqlite>, user_id: i64) -> Result<UserRank, AppError> {
    let user = get_user(pool, user_id).await?;
    let organization_id = user.organization_id.ok_or_else(|| {
        AppError::Validation(format!("User {} does not belong to an organization", user_id))
    })?;

    let total_points: i64 =
        sqlx::query_scalar("SELECT total_points FROM user_points WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?
            .unwrap_or(0);

    let (ahead, participants): (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(CASE WHEN up.total_points > ? THEN 1 ELSE 0 END), 0),
                COUNT(*)
         FROM user_points up
         JOIN users u ON u.id = up.user_id
         WHERE up.organization_id = ? AND u.active = TRUE",
    )
    .bind(total_points)
    .bind(organization_id)
    .fetch_one(pool)
    .await?;

    Ok(UserRank {
        user_id,
        rank: ahead + 1,
        total_points,
        total_users_in_organization: participants,
    })
}
