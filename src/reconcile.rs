//! Repairs derived state from the ledger.
//!
//! Achievement rewards that failed to credit are appended under their
//! original idempotency key, then `user_points` is recomputed from
//! `point_transactions` and rewritten only where it drifted.

use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{error, info, instrument, warn};

use crate::achievements::achievement_reward_key;
use crate::config::GamificationConfig;
use crate::db::{get_organization, get_user};
use crate::error::AppError;
use crate::ledger::{NewTransaction, append_points, total_for};
use crate::models::{ReasonCode, timestamp_now};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub user_id: i64,
    pub rewards_credited: usize,
    pub aggregate_rewritten: bool,
    pub previous_total: i64,
    pub ledger_total: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub users_checked: usize,
    pub rewards_credited: usize,
    pub aggregates_rewritten: usize,
    pub failures: usize,
}

impl ReconcileSummary {
    fn add(&mut self, report: &ReconcileReport) {
        self.users_checked += 1;
        self.rewards_credited += report.rewards_credited;
        if report.aggregate_rewritten {
            self.aggregates_rewritten += 1;
        }
    }
}

#[derive(sqlx::FromRow)]
struct MissingReward {
    achievement_id: i64,
    name: String,
    points_reward: i64,
}

#[instrument(skip(pool, config))]
async fn credit_missing_rewards(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    user_id: i64,
) -> Result<usize, AppError> {
    let missing = sqlx::query_as::<_, MissingReward>(
        "SELECT ua.achievement_id, a.name, a.points_reward
         FROM user_achievements ua
         JOIN achievements a ON a.id = ua.achievement_id
         WHERE ua.user_id = ? AND a.points_reward != 0
           AND NOT EXISTS (
               SELECT 1 FROM point_transactions pt
               WHERE pt.idempotency_key = 'achievement:' || ua.user_id || ':' || ua.achievement_id
           )
         ORDER BY ua.id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    for reward in &missing {
        let key = achievement_reward_key(user_id, reward.achievement_id);
        let description = format!("Achievement unlocked: {}", reward.name);
        append_points(
            pool,
            config,
            NewTransaction {
                user_id,
                delta: reward.points_reward,
                reason: ReasonCode::AchievementUnlocked,
                description: &description,
                idempotency_key: Some(&key),
            },
        )
        .await?;
        warn!(achievement_id = reward.achievement_id, "Credited missing achievement reward");
    }

    Ok(missing.len())
}

/// Bring one user's aggregate back in line with the ledger. Runs as a single
/// upsert so a concurrent append is either fully counted or not yet visible.
#[instrument(skip(pool, config))]
pub async fn reconcile_user(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    user_id: i64,
) -> Result<ReconcileReport, AppError> {
    let user = get_user(pool, user_id).await?;
    let rewards_credited = credit_missing_rewards(pool, config, user_id).await?;
    let previous_total = total_for(pool, user_id).await?;

    let affected = sqlx::query(
        "INSERT INTO user_points
             (user_id, organization_id, total_points, courses_completed, lessons_completed,
              quizzes_passed, certificates_earned, current_streak, longest_streak,
              last_activity_at, updated_at)
         SELECT ?, ?,
                COALESCE(SUM(delta), 0),
                COALESCE(SUM(reason = 'course_complete'), 0),
                COALESCE(SUM(reason = 'lesson_complete'), 0),
                COALESCE(SUM(reason = 'quiz_pass'), 0),
                COALESCE(SUM(reason = 'certificate_earned'), 0),
                COALESCE((SELECT current_streak FROM study_streaks WHERE user_id = ?), 0),
                COALESCE((SELECT longest_streak FROM study_streaks WHERE user_id = ?), 0),
                MAX(created_at),
                ?
         FROM point_transactions
         WHERE user_id = ?
         HAVING COUNT(*) > 0
         ON CONFLICT (user_id) DO UPDATE SET
             organization_id = excluded.organization_id,
             total_points = excluded.total_points,
             courses_completed = excluded.courses_completed,
             lessons_completed = excluded.lessons_completed,
             quizzes_passed = excluded.quizzes_passed,
             certificates_earned = excluded.certificates_earned,
             current_streak = excluded.current_streak,
             longest_streak = excluded.longest_streak,
             updated_at = excluded.updated_at
         WHERE organization_id IS NOT excluded.organization_id
            OR total_points != excluded.total_points
            OR courses_completed != excluded.courses_completed
            OR lessons_completed != excluded.lessons_completed
            OR quizzes_passed != excluded.quizzes_passed
            OR certificates_earned != excluded.certificates_earned
            OR current_streak != excluded.current_streak
            OR longest_streak != excluded.longest_streak",
    )
    .bind(user_id)
    .bind(user.organization_id)
    .bind(user_id)
    .bind(user_id)
    .bind(timestamp_now())
    .bind(user_id)
    .execute(pool)
    .await?
    .rows_affected();
    let rewritten = affected > 0;

    let ledger_total = total_for(pool, user_id).await?;

    if rewritten {
        warn!(previous_total, ledger_total, "Aggregate drifted from ledger, rewritten");
    }

    Ok(ReconcileReport {
        user_id,
        rewards_credited,
        aggregate_rewritten: rewritten,
        previous_total,
        ledger_total,
    })
}

async fn reconcile_users(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    user_ids: Vec<i64>,
) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();

    for user_id in user_ids {
        match reconcile_user(pool, config, user_id).await {
            Ok(report) => summary.add(&report),
            Err(err) => {
                error!(user_id, error = %err, "Reconciliation failed for user");
                summary.failures += 1;
            }
        }
    }

    summary
}

#[instrument(skip(pool, config))]
pub async fn reconcile_organization(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    organization_id: i64,
) -> Result<ReconcileSummary, AppError> {
    get_organization(pool, organization_id).await?;

    let user_ids: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM users WHERE organization_id = ? ORDER BY id")
            .bind(organization_id)
            .fetch_all(pool)
            .await?;

    let summary = reconcile_users(pool, config, user_ids).await;
    info!(?summary, "Organization reconciled");
    Ok(summary)
}

#[instrument(skip(pool, config))]
pub async fn reconcile_all(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
) -> Result<ReconcileSummary, AppError> {
    let user_ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM users ORDER BY id")
        .fetch_all(pool)
        .await?;

    let summary = reconcile_users(pool, config, user_ids).await;
    info!(?summary, "Reconciliation pass finished");
    Ok(summary)
}
