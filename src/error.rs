use chrono::NaiveDate;
use opentelemetry_semantic_conventions::{attribute::OTEL_STATUS_CODE, trace::ERROR_TYPE};
use rocket::http::Status;
use thiserror::Error;
use tracing::{Span, error, warn};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid point delta {delta}: zero-point events are not recorded")]
    InvalidDelta { delta: i64 },

    #[error("Activity on {activity_date} is earlier than last study date {last_study_date}")]
    OutOfOrderActivity {
        activity_date: NaiveDate,
        last_study_date: NaiveDate,
    },

    #[error("Unknown reason code: {0}")]
    UnknownReasonCode(String),

    #[error("Achievement catalog is empty, seed it before evaluating")]
    AchievementCatalogEmpty,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::InvalidDelta { .. } => "invalid_delta",
            AppError::OutOfOrderActivity { .. } => "out_of_order_activity",
            AppError::UnknownReasonCode(_) => "unknown_reason_code",
            AppError::AchievementCatalogEmpty => "achievement_catalog_empty",
            AppError::Authentication(_) => "authentication_error",
            AppError::Authorization(_) => "authorization_error",
            AppError::NotFound(_) => "not_found_error",
            AppError::Validation(_) => "validation_error",
            AppError::Conflict(_) => "conflict_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn log_and_record(&self, ctx: &str) {
        let current_span = Span::current();
        let is_valid_span = !current_span.is_none();

        let message = self.to_string();
        let error_kind = self.kind();

        match self {
            AppError::Database(err) => {
                error!(error = %message, context = %ctx, db_error = %err, "Database error");
            }
            AppError::Internal(msg) => {
                error!(message = %msg, context = %ctx, "Internal server error");
            }
            AppError::OutOfOrderActivity {
                activity_date,
                last_study_date,
            } => {
                warn!(
                    context = %ctx,
                    %activity_date,
                    %last_study_date,
                    "Out of order streak activity, route to reconciliation"
                );
            }
            _ => {
                warn!(message = %message, context = %ctx, kind = error_kind, "Request rejected");
            }
        }

        if is_valid_span {
            current_span.record("error", tracing::field::display(true));
            current_span.record(ERROR_TYPE, tracing::field::display(error_kind));
            current_span.record("error.message", tracing::field::display(&message));

            if matches!(self, AppError::Database(_) | AppError::Internal(_)) {
                current_span.record(OTEL_STATUS_CODE, tracing::field::display("ERROR"));
            }
        }
    }

    pub fn status_code(&self) -> Status {
        match self {
            AppError::Database(_) => Status::InternalServerError,
            AppError::InvalidDelta { .. } => Status::BadRequest,
            AppError::OutOfOrderActivity { .. } => Status::Conflict,
            AppError::UnknownReasonCode(_) => Status::BadRequest,
            AppError::AchievementCatalogEmpty => Status::PreconditionFailed,
            AppError::Authentication(_) => Status::Unauthorized,
            AppError::Authorization(_) => Status::Forbidden,
            AppError::NotFound(_) => Status::NotFound,
            AppError::Validation(_) => Status::BadRequest,
            AppError::Conflict(_) => Status::Conflict,
            AppError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn to_status_with_log(&self, context: &str) -> Status {
        self.log_and_record(context);
        self.status_code()
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for AppError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        self.to_status_with_log(&format!("Request to {} {}", req.method(), req.uri()))
            .respond_to(req)
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.to_status_with_log("Error conversion into Status")
    }
}
