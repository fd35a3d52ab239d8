//! Learning events coming from the rest of the platform, turned into
//! ledger entries, streak touches and achievement checks.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument, warn};

use crate::achievements::evaluate_and_award;
use crate::config::GamificationConfig;
use crate::error::AppError;
use crate::ledger::{NewTransaction, append_points_at, record_points_at};
use crate::models::{Achievement, ReasonCode};
use crate::streak::{StreakUpdate, TouchOutcome, touch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    LessonCompleted { lesson_id: i64 },
    CourseCompleted { course_id: i64 },
    QuizPassed { quiz_id: i64 },
    CertificateEarned { certificate_id: i64 },
    ForumPost { post_id: i64 },
    HelpfulAnswer { answer_id: i64 },
}

impl DomainEvent {
    pub fn reason(&self) -> ReasonCode {
        match self {
            DomainEvent::LessonCompleted { .. } => ReasonCode::LessonComplete,
            DomainEvent::CourseCompleted { .. } => ReasonCode::CourseComplete,
            DomainEvent::QuizPassed { .. } => ReasonCode::QuizPass,
            DomainEvent::CertificateEarned { .. } => ReasonCode::CertificateEarned,
            DomainEvent::ForumPost { .. } => ReasonCode::ForumParticipation,
            DomainEvent::HelpfulAnswer { .. } => ReasonCode::HelpfulAnswer,
        }
    }

    /// Studying counts toward the daily streak; forum activity does not.
    pub fn is_study(&self) -> bool {
        matches!(
            self,
            DomainEvent::LessonCompleted { .. }
                | DomainEvent::CourseCompleted { .. }
                | DomainEvent::QuizPassed { .. }
        )
    }

    /// Derived from the source entity, so a redelivered event is credited
    /// once.
    pub fn idempotency_key(&self, user_id: i64) -> String {
        match self {
            DomainEvent::LessonCompleted { lesson_id } => format!("lesson:{}:{}", user_id, lesson_id),
            DomainEvent::CourseCompleted { course_id } => format!("course:{}:{}", user_id, course_id),
            DomainEvent::QuizPassed { quiz_id } => format!("quiz:{}:{}", user_id, quiz_id),
            DomainEvent::CertificateEarned { certificate_id } => {
                format!("certificate:{}:{}", user_id, certificate_id)
            }
            DomainEvent::ForumPost { post_id } => format!("forum:{}:{}", user_id, post_id),
            DomainEvent::HelpfulAnswer { answer_id } => format!("answer:{}:{}", user_id, answer_id),
        }
    }

    fn description(&self) -> String {
        match self {
            DomainEvent::LessonCompleted { lesson_id } => format!("Completed lesson {}", lesson_id),
            DomainEvent::CourseCompleted { course_id } => format!("Completed course {}", course_id),
            DomainEvent::QuizPassed { quiz_id } => format!("Passed quiz {}", quiz_id),
            DomainEvent::CertificateEarned { certificate_id } => {
                format!("Earned certificate {}", certificate_id)
            }
            DomainEvent::ForumPost { post_id } => format!("Forum post {}", post_id),
            DomainEvent::HelpfulAnswer { answer_id } => {
                format!("Answer {} marked helpful", answer_id)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventOutcome {
    /// `None` when the configured value for the event is zero.
    pub transaction_id: Option<i64>,
    pub streak: Option<StreakUpdate>,
    pub streak_bonus_transaction: Option<i64>,
    pub unlocked: Vec<Achievement>,
}

pub fn streak_bonus_key(user_id: i64, activity_at: NaiveDateTime) -> String {
    format!("streak:{}:{}", user_id, activity_at.date())
}

#[instrument(skip(pool, config))]
pub async fn handle_event(
    pool: &Pool<Sqlite>,
    config: &GamificationConfig,
    user_id: i64,
    event: DomainEvent,
    occurred_at: NaiveDateTime,
) -> Result<EventOutcome, AppError> {
    let reason = event.reason();
    let delta = config.points_for(reason).ok_or_else(|| {
        AppError::Internal(format!("No configured point value for {}", reason))
    })?;

    // A redelivered event matches its earlier transaction; only a fresh one
    // may move the streak.
    let (transaction_id, fresh) = if delta == 0 && !config.allow_zero_delta {
        debug!(%reason, "Event is worth no points, nothing ledgered");
        (None, true)
    } else {
        let key = event.idempotency_key(user_id);
        let description = event.description();
        let recorded = record_points_at(
            pool,
            config,
            NewTransaction {
                user_id,
                delta,
                reason,
                description: &description,
                idempotency_key: Some(&key),
            },
            occurred_at,
        )
        .await?;
        (Some(recorded.transaction.id), recorded.inserted)
    };

    let mut streak = None;
    let mut streak_bonus_transaction = None;

    if !fresh {
        debug!(?transaction_id, "Event already processed, streak left alone");
    } else if event.is_study() {
        // The points above are already durable. A late event for an earlier
        // day is left for reconciliation instead of failing the redelivery.
        match touch(pool, user_id, occurred_at.date()).await {
            Ok(update) => streak = Some(update),
            Err(err @ AppError::OutOfOrderActivity { .. }) => {
                err.log_and_record("Streak touch for domain event");
            }
            Err(err) => return Err(err),
        }

        let extended = streak
            .as_ref()
            .is_some_and(|update| update.outcome == TouchOutcome::Extended);

        if extended && config.streak_bonus_points != 0 {
            let key = streak_bonus_key(user_id, occurred_at);
            let description = format!("Study streak bonus for {}", occurred_at.date());
            streak_bonus_transaction = Some(
                append_points_at(
                    pool,
                    config,
                    NewTransaction {
                        user_id,
                        delta: config.streak_bonus_points,
                        reason: ReasonCode::StreakBonus,
                        description: &description,
                        idempotency_key: Some(&key),
                    },
                    occurred_at,
                )
                .await?,
            );
        }
    }

    let unlocked = match evaluate_and_award(pool, config, user_id).await {
        Ok(unlocked) => unlocked,
        Err(AppError::AchievementCatalogEmpty) => {
            warn!("Achievement catalog is empty, skipping evaluation");
            Vec::new()
        }
        Err(err) => return Err(err),
    };

    info!(
        ?transaction_id,
        unlocked = unlocked.len(),
        "Domain event processed"
    );

    Ok(EventOutcome {
        transaction_id,
        streak,
        streak_bonus_transaction,
        unlocked,
    })
}
