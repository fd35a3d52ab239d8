use chrono::{NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Current UTC time at millisecond precision, the resolution every stored
/// timestamp uses so text comparisons in SQLite stay ordered.
pub fn timestamp_now() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    LessonComplete,
    CourseComplete,
    QuizPass,
    CertificateEarned,
    StreakBonus,
    ForumParticipation,
    HelpfulAnswer,
    AdminAdjustment,
    AchievementUnlocked,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 9] = [
        ReasonCode::LessonComplete,
        ReasonCode::CourseComplete,
        ReasonCode::QuizPass,
        ReasonCode::CertificateEarned,
        ReasonCode::StreakBonus,
        ReasonCode::ForumParticipation,
        ReasonCode::HelpfulAnswer,
        ReasonCode::AdminAdjustment,
        ReasonCode::AchievementUnlocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::LessonComplete => "lesson_complete",
            ReasonCode::CourseComplete => "course_complete",
            ReasonCode::QuizPass => "quiz_pass",
            ReasonCode::CertificateEarned => "certificate_earned",
            ReasonCode::StreakBonus => "streak_bonus",
            ReasonCode::ForumParticipation => "forum_participation",
            ReasonCode::HelpfulAnswer => "helpful_answer",
            ReasonCode::AdminAdjustment => "admin_adjustment",
            ReasonCode::AchievementUnlocked => "achievement_unlocked",
        }
    }
}

impl FromStr for ReasonCode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReasonCode::ALL
            .iter()
            .find(|code| code.as_str() == s)
            .copied()
            .ok_or_else(|| AppError::UnknownReasonCode(s.to_string()))
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointTransaction {
    pub id: i64,
    pub user_id: i64,
    pub delta: i64,
    pub reason: ReasonCode,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbPointTransaction {
    pub id: i64,
    pub user_id: i64,
    pub delta: i64,
    pub reason: String,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub created_at: NaiveDateTime,
}

impl TryFrom<DbPointTransaction> for PointTransaction {
    type Error = AppError;

    fn try_from(row: DbPointTransaction) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            delta: row.delta,
            reason: row.reason.parse()?,
            description: row.description,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct UserPoints {
    pub user_id: i64,
    pub organization_id: Option<i64>,
    pub total_points: i64,
    pub courses_completed: i64,
    pub lessons_completed: i64,
    pub quizzes_passed: i64,
    pub certificates_earned: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_activity_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct StudyStreak {
    pub user_id: i64,
    pub current_streak: i64,
    pub longest_streak: i64,
    pub last_study_date: NaiveDate,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementKind {
    CourseComplete,
    Streak,
    TimeSpent,
    FirstLesson,
    TopStudent,
}

impl AchievementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AchievementKind::CourseComplete => "course_complete",
            AchievementKind::Streak => "streak",
            AchievementKind::TimeSpent => "time_spent",
            AchievementKind::FirstLesson => "first_lesson",
            AchievementKind::TopStudent => "top_student",
        }
    }
}

impl FromStr for AchievementKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "course_complete" => Ok(AchievementKind::CourseComplete),
            "streak" => Ok(AchievementKind::Streak),
            "time_spent" => Ok(AchievementKind::TimeSpent),
            "first_lesson" => Ok(AchievementKind::FirstLesson),
            "top_student" => Ok(AchievementKind::TopStudent),
            _ => Err(AppError::Validation(format!(
                "Unknown achievement type: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for AchievementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Achievement {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub kind: AchievementKind,
    pub requirement: i64,
    pub points_reward: i64,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbAchievement {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub kind: String,
    pub requirement: i64,
    pub points_reward: i64,
}

impl TryFrom<DbAchievement> for Achievement {
    type Error = AppError;

    fn try_from(row: DbAchievement) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            icon: row.icon,
            kind: row.kind.parse()?,
            requirement: row.requirement,
            points_reward: row.points_reward,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct UserAchievement {
    pub user_id: i64,
    pub achievement_id: i64,
    pub name: String,
    pub unlocked_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardWindow {
    AllTime,
    Weekly,
}

impl FromStr for LeaderboardWindow {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_time" => Ok(LeaderboardWindow::AllTime),
            "weekly" => Ok(LeaderboardWindow::Weekly),
            _ => Err(AppError::Validation(format!(
                "Unknown leaderboard window: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub user_id: i64,
    pub display_name: String,
    pub organization_id: i64,
    pub total_points: i64,
    pub courses_completed: i64,
    pub current_streak: i64,
    pub achievement_count: i64,
    pub last_activity_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRank {
    pub user_id: i64,
    pub rank: i64,
    pub total_points: i64,
    pub total_users_in_organization: i64,
}
