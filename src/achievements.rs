use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::auth::User;
use crate::config::GamificationConfig;
use crate::db::get_user;
use crate::error::AppError;
use crate::leaderboard::get_user_rank;
use crate::ledger::{NewTransaction, append_points, find_user_points};
use crate::models::{
    Achievement, AchievementKind, DbAchievement, ReasonCode, UserAchievement, timestamp_now,
};
use crate::progress::total_watch_minutes;
use crate::streak::get_streak;

const ACHIEVEMENT_COLUMNS: &str = "id, name, description, icon, kind, requirement, points_reward";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewAchievement {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    #[validate(length(max = 500, message = "Description is limited to 500 characters"))]
    pub description: String,
    #[validate(length(max = 200, message = "Icon reference is limited to 200 characters"))]
    pub icon: String,
    pub kind: AchievementKind,
    #[validate(range(min = 1, message = "Requirement must be at least 1"))]
    pub requirement: i64,
    #[validate(range(min = 0, message = "Reward cannot be negative"))]
    pub points_reward: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AchievementUpdate {
    #[validate(length(max = 500, message = "Description is limited to 500 characters"))]
    pub description: Option<String>,
    #[validate(length(max = 200, message = "Icon reference is limited to 200 characters"))]
    pub icon: Option<String>,
    #[validate(range(min = 1, message = "Requirement must be at least 1"))]
    pub requirement: Option<i64>,
    #[validate(range(min = 0, message = "Reward cannot be negative"))]
    pub points_reward: Option<i64>,
}

fn definition(
    name: &str,
    description: &str,
    icon: &str,
    kind: AchievementKind,
    requirement: i64,
    points_reward: i64,
) -> NewAchievement {
    NewAchievement {
        name: name.to_string(),
        description: description.to_string(),
        icon: icon.to_string(),
        kind,
        requirement,
        points_reward,
    }
}

pub fn default_catalog() -> Vec<NewAchievement> {
    vec![
        definition("First Steps", "Complete your first lesson", "footprints", AchievementKind::FirstLesson, 1, 10),
        definition("Course Finisher", "Complete a course", "graduation-cap", AchievementKind::CourseComplete, 1, 50),
        definition("Knowledge Collector", "Complete five courses", "books", AchievementKind::CourseComplete, 5, 200),
        definition("On Fire", "Study seven days in a row", "flame", AchievementKind::Streak, 7, 70),
        definition("Unstoppable", "Study thirty days in a row", "rocket", AchievementKind::Streak, 30, 300),
        definition("Marathon", "Watch ten hours of lessons", "clock", AchievementKind::TimeSpent, 600, 100),
        definition("Top Student", "Reach the top three of your organization", "trophy", AchievementKind::TopStudent, 3, 150),
    ]
}

/// Ledger key for the reward of one unlock. Shared with reconciliation so a
/// missed reward can be credited exactly once.
pub fn achievement_reward_key(user_id: i64, achievement_id: i64) -> String {
    format!("achievement:{}:{}", user_id, achievement_id)
}

/// Everything the unlock predicates look at, read once per evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStats {
    pub total_points: i64,
    pub courses_completed: i64,
    pub lessons_completed: i64,
    pub longest_streak: i64,
    pub watch_minutes: i64,
    /// All-time rank in the organization; `None` when not ranked.
    pub rank: Option<i64>,
}

/// Unlock condition for each achievement type. Streaks are measured against
/// the longest streak so an unlock never depends on a streak still running.
pub fn is_satisfied(kind: AchievementKind, requirement: i64, stats: &UserStats) -> bool {
    match kind {
        AchievementKind::CourseComplete => stats.courses_completed >= requirement,
        AchievementKind::Streak => stats.longest_streak >= requirement,
        AchievementKind::TimeSpent => stats.watch_minutes >= requirement,
        AchievementKind::FirstLesson => stats.lessons_completed >= requirement,
        AchievementKind::TopStudent => stats.rank.is_some_and(|rank| rank <= requirement),
    }
}

#[instrument(skip(pool))]
pub async fn list_achievements(pool: &Pool<Sqlite>) -> Result<Vec<Achievement>, AppError> {
    sqlx::query_as::<_, DbAchievement>(&format!(
        "SELECT {} FROM achievements ORDER BY id",
        ACHIEVEMENT_COLUMNS
    ))
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(Achievement::try_from)
    .collect()
}

#[instrument(skip(pool))]
pub async fn get_achievement(pool: &Pool<Sqlite>, id: i64) -> Result<Achievement, AppError> {
    let row = sqlx::query_as::<_, DbAchievement>(&format!(
        "SELECT {} FROM achievements WHERE id = ?",
        ACHIEVEMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Achievement::try_from(row),
        None => Err(AppError::NotFound(format!("Achievement with id {} not found", id))),
    }
}

async fn insert_definition(
    pool: &Pool<Sqlite>,
    new: &NewAchievement,
) -> Result<Option<i64>, AppError> {
    let id: Option<i64> = sqlx::query_scalar(
        "INSERT INTO achievements
             (name, description, icon, kind, requirement, points_reward, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (name) DO NOTHING
         RETURNING id",
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.icon)
    .bind(new.kind.as_str())
    .bind(new.requirement)
    .bind(new.points_reward)
    .bind(timestamp_now())
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

/// Seed the default catalog when none exists. Safe to call on every start
/// and from concurrent callers: names are unique, so a racing seed inserts
/// nothing twice.
#[instrument(skip(pool))]
pub async fn initialize_catalog(pool: &Pool<Sqlite>) -> Result<usize, AppError> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM achievements")
        .fetch_one(pool)
        .await?;

    if existing > 0 {
        debug!(existing, "Achievement catalog already seeded");
        return Ok(0);
    }

    let mut inserted = 0;
    for new in default_catalog() {
        if insert_definition(pool, &new).await?.is_some() {
            inserted += 1;
        }
    }

    info!(inserted, "Seeded achievement catalog");
    Ok(inserted)
}

#[instrument(skip(pool))]
pub async fn create_achievement(
    pool: &Pool<Sqlite>,
    new: &NewAchievement,
) -> Result<i64, AppError> {
    info!("Creating achievement");
    insert_definition(pool, new).await?.ok_or_else(|| {
        AppError::Validation(format!("Achievement '{}' already exists", new.name))
    })
}

/// Edits never revoke unlocks that already happened.
#[instrument(skip(pool))]
pub async fn update_achievement(
    pool: &Pool<Sqlite>,
    id: i64,
    update: &AchievementUpdate,
) -> Result<Achievement, AppError> {
    info!("Updating achievement");
    let current = get_achievement(pool, id).await?;

    sqlx::query(
        "UPDATE achievements
         SET description = ?, icon = ?, requirement = ?, points_reward = ?
         WHERE id = ?",
    )
    .bind(update.description.as_ref().unwrap_or(&current.description))
    .bind(update.icon.as_ref().unwrap_or(&current.icon))
    .bind(update.requirement.unwrap_or(current.requirement))
    .bind(update.points_reward.unwrap_or(current.points_reward))
    .bind(id)
    .execute(pool)
    .await?;

    get_achievement(pool, id).await
}

#[instrument(skip(pool))]
pub async fn get_user_achievements(
    pool: &Pool<Sqlite>,
    user_id: i64,
) -> Result<Vec<UserAchievement>, AppError> {
    let rows = sqlx::query_as::<_, UserAchievement>(
        "SELECT ua.user_id, ua.achievement_id, a.name, ua.unlocked_at
         FROM user_achievements ua
         JOIN achievements a ON a.id = ua.achievement_id
         WHERE ua.user_id = ?
         ORDER BY ua.unlocked_at, ua.id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn load_stats(
    pool: &Pool<Sqlite>,
    user: &User,
    needs_rank: bool,
) -> Result<UserStats, AppError> {
    let points = find_user_points(pool, user.id).await?;
    let streak = get_streak(pool, user.id).await?;

    let mut stats = UserStats {
        watch_minutes: total_watch_minutes(pool, user.id).await?,
        longest_streak: streak.map(|s| s.longest_streak).unwrap_or(0),
        ..UserStats::default()
    };

    if let Some(points) = points {
        stats.total_points = points.total_points;
        stats.courses_completed = points.courses_completed;
        stats.lessons_completed = points.lessons_completed;
        stats.longest_streak = stats.longest_streak.max(points.longest_streak);
    }

    // Nobody tops a board with nothing on it.
    if needs_rank && user.organization_id.is_some() && stats.total_points > 0 {
        stats.rank = Some(get_user_rank(pool, user.id).await?.rank);
    }

    Ok(stats)
}

/// Insert the unlock row. `false` when the user already had it.
async fn grant(pool: &Pool<Sqlite>, user_id: i64, achievement_id: i64) -> Result<bool, AppError> {
    let res = sqlx::query(
        "INSERT INTO user_achievements (user_id, achievement_id, unlocked_at)
         VALUES (?, ?, ?)
         ON CONFLICT (user_id, achievement_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(achievement_id)
    .bind(timestamp_now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Grant every achievement the user now qualifies for and credit its
/// reward. Returns only the achievements unlocked by this call.
///
/// The unlock row is the durable fact. If crediting the reward fails the
/// unlock stays and reconciliation credits the points later under the same
/// idempotency key.
#[instrument(skip(pool, config))]
pub async fn evaluate_and_award(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    user_id: i64,
) -> Result<Vec<Achievement>, AppError> {
    let user = get_user(pool, user_id).await?;
    let catalog = list_achievements(pool).await?;
    if catalog.is_empty() {
        return Err(AppError::AchievementCatalogEmpty);
    }

    let mut newly_unlocked: Vec<Achievement> = Vec::new();

    // Rewards raise the user's points, which can satisfy a top-student
    // achievement, so run again until a pass unlocks nothing.
    loop {
        let unlocked: Vec<i64> =
            sqlx::query_scalar("SELECT achievement_id FROM user_achievements WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(pool)
                .await?;

        let pending: Vec<&Achievement> = catalog
            .iter()
            .filter(|a| !unlocked.contains(&a.id))
            .collect();
        if pending.is_empty() {
            break;
        }

        let needs_rank = pending.iter().any(|a| a.kind == AchievementKind::TopStudent);
        let stats = load_stats(pool, &user, needs_rank).await?;
        debug!(?stats, pending = pending.len(), "Evaluating achievements");

        let mut granted_this_pass = 0;
        for achievement in pending {
            if !is_satisfied(achievement.kind, achievement.requirement, &stats) {
                continue;
            }
            if !grant(pool, user_id, achievement.id).await? {
                continue;
            }

            granted_this_pass += 1;
            info!(achievement = %achievement.name, "Achievement unlocked");

            if achievement.points_reward != 0 || config.allow_zero_delta {
                let key = achievement_reward_key(user_id, achievement.id);
                let description = format!("Achievement unlocked: {}", achievement.name);
                let reward = append_points(
                    pool,
                    config,
                    NewTransaction {
                        user_id,
                        delta: achievement.points_reward,
                        reason: ReasonCode::AchievementUnlocked,
                        description: &description,
                        idempotency_key: Some(&key),
                    },
                )
                .await;

                if let Err(err) = reward {
                    warn!(
                        achievement_id = achievement.id,
                        error = %err,
                        "Achievement reward not credited, left for reconciliation"
                    );
                }
            }

            newly_unlocked.push(achievement.clone());
        }

        if granted_this_pass == 0 {
            break;
        }
    }

    Ok(newly_unlocked)
}
