use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde_json::{Value, json};
use sqlx::SqlitePool;

use crate::db::get_user;
use crate::error::AppError;

use super::User;

/// Header set by the identity gateway in front of this service.
pub const USER_ID_HEADER: &str = "X-User-Id";

#[rocket::async_trait]
impl<'r> FromRequest<'r> for User {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let auth_span = tracing::info_span!("user_identity_guard");
        let _guard = auth_span.enter();

        let Some(raw_id) = request.headers().get_one(USER_ID_HEADER) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };

        let user_id = match raw_id.trim().parse::<i64>() {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!(header = %raw_id, "Malformed user id header");
                return Outcome::Error((Status::Unauthorized, ()));
            }
        };

        let db = match request.rocket().state::<SqlitePool>() {
            Some(pool) => pool,
            _ => {
                tracing::error!("Database pool not found in managed state");
                return Outcome::Error((Status::InternalServerError, ()));
            }
        };

        match get_user(db, user_id).await {
            Ok(user) if !user.active => {
                tracing::warn!(user_id, "Deactivated user rejected");
                Outcome::Error((Status::Forbidden, ()))
            }
            Ok(user) => {
                tracing::debug!(user_id, role = %user.role.as_str(), "User identified");
                Outcome::Success(user)
            }
            Err(AppError::NotFound(_)) => {
                tracing::warn!(user_id, "Unknown user id");
                Outcome::Error((Status::Unauthorized, ()))
            }
            Err(err) => {
                tracing::error!(user_id, error = ?err, "Failed to load user");
                Outcome::Error((Status::InternalServerError, ()))
            }
        }
    }
}

#[catch(401)]
pub fn unauthorized_api(_req: &Request) -> Custom<Json<Value>> {
    let error_json = json!({
        "error": "Unauthorized",
        "message": "Authentication required"
    });

    Custom(Status::Unauthorized, Json(error_json))
}

#[catch(403)]
pub fn forbidden_api(_req: &Request) -> Custom<Json<Value>> {
    let error_json = json!({
        "error": "Forbidden",
        "message": "User is not allowed to perform this action"
    });

    Custom(Status::Forbidden, Json(error_json))
}
