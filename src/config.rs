use std::{env, fmt::Display, str::FromStr};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::ReasonCode;

/// Point values per event type plus the knobs of the ranking engine.
/// Everything here comes from the environment so tenants can tune rewards
/// without a rebuild.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GamificationConfig {
    pub lesson_complete_points: i64,
    pub course_complete_points: i64,
    pub quiz_pass_points: i64,
    pub certificate_earned_points: i64,
    pub forum_participation_points: i64,
    pub helpful_answer_points: i64,
    pub streak_bonus_points: i64,
    pub allow_zero_delta: bool,
    pub weekly_window_days: i64,
    pub default_leaderboard_limit: i64,
    pub max_leaderboard_limit: i64,
    pub reconcile_interval_secs: u64,
}

impl Default for GamificationConfig {
    fn default() -> Self {
        Self {
            lesson_complete_points: 10,
            course_complete_points: 100,
            quiz_pass_points: 20,
            certificate_earned_points: 50,
            forum_participation_points: 2,
            helpful_answer_points: 5,
            streak_bonus_points: 5,
            allow_zero_delta: false,
            weekly_window_days: 7,
            default_leaderboard_limit: 10,
            max_leaderboard_limit: 100,
            reconcile_interval_secs: 3600,
        }
    }
}

impl GamificationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let config = Self {
            lesson_complete_points: try_load("POINTS_LESSON_COMPLETE", defaults.lesson_complete_points)?,
            course_complete_points: try_load("POINTS_COURSE_COMPLETE", defaults.course_complete_points)?,
            quiz_pass_points: try_load("POINTS_QUIZ_PASS", defaults.quiz_pass_points)?,
            certificate_earned_points: try_load(
                "POINTS_CERTIFICATE_EARNED",
                defaults.certificate_earned_points,
            )?,
            forum_participation_points: try_load(
                "POINTS_FORUM_PARTICIPATION",
                defaults.forum_participation_points,
            )?,
            helpful_answer_points: try_load("POINTS_HELPFUL_ANSWER", defaults.helpful_answer_points)?,
            streak_bonus_points: try_load("POINTS_STREAK_BONUS", defaults.streak_bonus_points)?,
            allow_zero_delta: try_load("ALLOW_ZERO_DELTA", defaults.allow_zero_delta)?,
            weekly_window_days: try_load("LEADERBOARD_WEEKLY_DAYS", defaults.weekly_window_days)?,
            default_leaderboard_limit: try_load(
                "LEADERBOARD_DEFAULT_LIMIT",
                defaults.default_leaderboard_limit,
            )?,
            max_leaderboard_limit: try_load("LEADERBOARD_MAX_LIMIT", defaults.max_leaderboard_limit)?,
            reconcile_interval_secs: try_load(
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            )?,
        };

        config.validate()?;
        info!(?config, "Loaded gamification config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.weekly_window_days < 1 {
            return Err(AppError::Validation(
                "LEADERBOARD_WEEKLY_DAYS must be at least 1".to_string(),
            ));
        }
        if self.max_leaderboard_limit < 1 || self.default_leaderboard_limit < 1 {
            return Err(AppError::Validation(
                "Leaderboard limits must be at least 1".to_string(),
            ));
        }
        if !self.allow_zero_delta {
            for reason in ReasonCode::ALL {
                if self.points_for(reason) == Some(0) {
                    warn!(reason = %reason, "Configured point value is zero and will be rejected by the ledger");
                }
            }
        }
        Ok(())
    }

    /// Configured award for a reason. Reasons whose amount is decided by
    /// the caller (adjustments, achievement rewards) have none.
    pub fn points_for(&self, reason: ReasonCode) -> Option<i64> {
        match reason {
            ReasonCode::LessonComplete => Some(self.lesson_complete_points),
            ReasonCode::CourseComplete => Some(self.course_complete_points),
            ReasonCode::QuizPass => Some(self.quiz_pass_points),
            ReasonCode::CertificateEarned => Some(self.certificate_earned_points),
            ReasonCode::ForumParticipation => Some(self.forum_participation_points),
            ReasonCode::HelpfulAnswer => Some(self.helpful_answer_points),
            ReasonCode::StreakBonus => Some(self.streak_bonus_points),
            ReasonCode::AdminAdjustment | ReasonCode::AchievementUnlocked => None,
        }
    }

    pub fn clamp_limit(&self, limit: Option<i64>) -> i64 {
        limit
            .unwrap_or(self.default_leaderboard_limit)
            .clamp(1, self.max_leaderboard_limit)
    }
}

fn try_load<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            warn!("Invalid {key} value: {e}");
            AppError::Validation(format!("Invalid {key} value {raw:?}: {e}"))
        }),
        Err(_) => {
            debug!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}
