use chrono::{NaiveDate, NaiveDateTime};
use rocket::State;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use sqlx::{Pool, Sqlite};
use validator::Validate;

use crate::achievements::{
    AchievementUpdate, NewAchievement, create_achievement, evaluate_and_award,
    get_user_achievements, initialize_catalog, list_achievements, update_achievement,
};
use crate::auth::{Permission, Role, User};
use crate::config::GamificationConfig;
use crate::db::{create_organization, create_user, get_user, set_user_active};
use crate::events::{DomainEvent, EventOutcome, handle_event};
use crate::leaderboard::{get_leaderboard, get_user_rank};
use crate::ledger::{HistoryPage, NewTransaction, append_points, get_user_points, history};
use crate::models::{
    Achievement, LeaderboardEntry, LeaderboardWindow, ReasonCode, StudyStreak, UserAchievement,
    UserPoints, UserRank, timestamp_now,
};
use crate::progress::record_watch_time;
use crate::reconcile::{ReconcileSummary, reconcile_organization};
use crate::streak::{StreakUpdate, get_streak, touch};
use crate::validation::{
    ApiError, ApiResult, AppErrorExt, JsonValidateExt, ValidationResponse,
};

const DEFAULT_HISTORY_PAGE: i64 = 20;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct CreatedResponse {
    pub id: i64,
}

fn created(id: i64) -> Custom<Json<CreatedResponse>> {
    Custom(Status::Created, Json(CreatedResponse { id }))
}

/// Load the user a request is about and check the caller may act on them.
async fn load_target(
    db: &Pool<Sqlite>,
    caller: &User,
    target_id: i64,
    own_permission: Permission,
    permission: Permission,
) -> ApiResult<User> {
    let target = get_user(db, target_id).await.validate_custom()?;
    caller
        .require_access_to(&target, own_permission, permission)
        .validate_custom()?;
    Ok(target)
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

#[get("/me")]
pub async fn api_me(user: User) -> Json<User> {
    Json(user)
}

#[derive(Deserialize, Validate, Clone)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    name: String,
}

#[post("/organizations", data = "<request>")]
pub async fn api_create_organization(
    request: Json<CreateOrganizationRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Custom<Json<CreatedResponse>>> {
    user.require_permission(Permission::ManageOrganizations)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let id = create_organization(db, &validated.name)
        .await
        .validate_custom()?;
    Ok(created(id))
}

#[derive(Deserialize, Validate, Clone)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 100, message = "Display name must be 1-100 characters"))]
    display_name: String,
    role: Role,
    organization_id: Option<i64>,
}

#[post("/users", data = "<request>")]
pub async fn api_create_user(
    request: Json<CreateUserRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Custom<Json<CreatedResponse>>> {
    user.require_permission(Permission::ManageUsers)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    if validated.role == Role::Superadmin {
        user.require_permission(Permission::ManageOrganizations)
            .validate_custom()?;
    }
    if let Some(org) = validated.organization_id {
        user.require_organization_access(org).validate_custom()?;
    }

    let id = create_user(
        db,
        &validated.display_name,
        validated.role,
        validated.organization_id,
    )
    .await
    .validate_custom()?;
    Ok(created(id))
}

#[derive(Deserialize, Validate)]
pub struct SetActiveRequest {
    active: bool,
}

#[put("/users/<id>/active", data = "<request>")]
pub async fn api_set_user_active(
    id: i64,
    request: Json<SetActiveRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Status> {
    load_target(db, &user, id, Permission::ManageUsers, Permission::ManageUsers).await?;
    let validated = request.validate_custom()?;

    set_user_active(db, id, validated.active)
        .await
        .validate_custom()?;
    Ok(Status::Ok)
}

#[derive(Deserialize, Validate)]
pub struct AppendPointsRequest {
    user_id: i64,
    delta: i64,
    reason: String,
    #[validate(length(max = 500, message = "Description is limited to 500 characters"))]
    description: String,
    #[validate(length(min = 1, max = 200, message = "Idempotency key must be 1-200 characters"))]
    idempotency_key: Option<String>,
}

#[post("/points", data = "<request>")]
pub async fn api_append_points(
    request: Json<AppendPointsRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<GamificationConfig>,
) -> ApiResult<Custom<Json<CreatedResponse>>> {
    let validated = request.validate_custom()?;
    load_target(
        db,
        &user,
        validated.user_id,
        Permission::AdjustPoints,
        Permission::AdjustPoints,
    )
    .await?;

    let reason = validated.reason.parse::<ReasonCode>().validate_custom()?;

    let id = append_points(
        db,
        config,
        NewTransaction {
            user_id: validated.user_id,
            delta: validated.delta,
            reason,
            description: &validated.description,
            idempotency_key: validated.idempotency_key.as_deref(),
        },
    )
    .await
    .validate_custom()?;
    Ok(created(id))
}

#[get("/users/<id>/points")]
pub async fn api_get_points(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<UserPoints>> {
    load_target(
        db,
        &user,
        id,
        Permission::ViewOwnProgress,
        Permission::ViewOrganizationProgress,
    )
    .await?;

    let points = get_user_points(db, id).await.validate_custom()?;
    Ok(Json(points))
}

#[get("/users/<id>/history?<before>&<limit>")]
pub async fn api_get_history(
    id: i64,
    before: Option<i64>,
    limit: Option<i64>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<HistoryPage>> {
    load_target(
        db,
        &user,
        id,
        Permission::ViewOwnProgress,
        Permission::ViewOrganizationProgress,
    )
    .await?;

    let page = history(db, id, before, limit.unwrap_or(DEFAULT_HISTORY_PAGE))
        .await
        .validate_custom()?;
    Ok(Json(page))
}

#[get("/users/<id>/streak")]
pub async fn api_get_streak(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<Option<StudyStreak>>> {
    load_target(
        db,
        &user,
        id,
        Permission::ViewOwnProgress,
        Permission::ViewOrganizationProgress,
    )
    .await?;

    let streak = get_streak(db, id).await.validate_custom()?;
    Ok(Json(streak))
}

#[get("/users/<id>/achievements")]
pub async fn api_get_user_achievements(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<Vec<UserAchievement>>> {
    load_target(
        db,
        &user,
        id,
        Permission::ViewOwnProgress,
        Permission::ViewOrganizationProgress,
    )
    .await?;

    let unlocked = get_user_achievements(db, id).await.validate_custom()?;
    Ok(Json(unlocked))
}

#[get("/users/<id>/rank")]
pub async fn api_get_rank(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<UserRank>> {
    load_target(
        db,
        &user,
        id,
        Permission::ViewOwnProgress,
        Permission::ViewOrganizationProgress,
    )
    .await?;

    let rank = get_user_rank(db, id).await.validate_custom()?;
    Ok(Json(rank))
}

#[derive(Deserialize, Validate)]
pub struct ActivityRequest {
    activity_date: Option<NaiveDate>,
}

#[post("/users/<id>/activity", data = "<request>")]
pub async fn api_record_activity(
    id: i64,
    request: Json<ActivityRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<StreakUpdate>> {
    load_target(db, &user, id, Permission::RecordOwnActivity, Permission::RecordActivity).await?;
    let validated = request.validate_custom()?;

    let date = validated
        .activity_date
        .unwrap_or_else(|| timestamp_now().date());
    let update = touch(db, id, date).await.validate_custom()?;
    Ok(Json(update))
}

#[derive(Deserialize)]
pub struct EventRequest {
    event: DomainEvent,
    occurred_at: Option<NaiveDateTime>,
}

#[post("/users/<id>/events", data = "<request>")]
pub async fn api_handle_event(
    id: i64,
    request: Json<EventRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<GamificationConfig>,
) -> ApiResult<Json<EventOutcome>> {
    // Point-earning events come from the course side, never from the learner.
    load_target(db, &user, id, Permission::RecordActivity, Permission::RecordActivity).await?;
    let request = request.into_inner();

    let occurred_at = request.occurred_at.unwrap_or_else(timestamp_now);
    let outcome = handle_event(db, config, id, request.event, occurred_at)
        .await
        .validate_custom()?;
    Ok(Json(outcome))
}

#[derive(Deserialize, Validate)]
pub struct WatchTimeRequest {
    lesson_id: i64,
    #[validate(range(min = 0, message = "Watched seconds cannot be negative"))]
    watched_seconds: i64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct WatchTimeResponse {
    pub lesson_id: i64,
    pub watched_seconds: i64,
}

#[post("/users/<id>/watch-time", data = "<request>")]
pub async fn api_record_watch_time(
    id: i64,
    request: Json<WatchTimeRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<WatchTimeResponse>> {
    load_target(db, &user, id, Permission::RecordOwnActivity, Permission::RecordActivity).await?;
    let validated = request.validate_custom()?;

    let watched_seconds = record_watch_time(db, id, validated.lesson_id, validated.watched_seconds)
        .await
        .validate_custom()?;
    Ok(Json(WatchTimeResponse {
        lesson_id: validated.lesson_id,
        watched_seconds,
    }))
}

#[post("/users/<id>/achievements/evaluate")]
pub async fn api_evaluate_achievements(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<GamificationConfig>,
) -> ApiResult<Json<Vec<Achievement>>> {
    load_target(db, &user, id, Permission::RecordOwnActivity, Permission::RecordActivity).await?;

    let unlocked = evaluate_and_award(db, config, id).await.validate_custom()?;
    Ok(Json(unlocked))
}

#[get("/achievements")]
pub async fn api_list_achievements(
    _user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<Vec<Achievement>>> {
    let catalog = list_achievements(db).await.validate_custom()?;
    Ok(Json(catalog))
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct SeedResponse {
    pub inserted: usize,
}

#[post("/achievements/seed")]
pub async fn api_seed_achievements(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<SeedResponse>> {
    user.require_permission(Permission::ManageAchievements)
        .validate_custom()?;

    let inserted = initialize_catalog(db).await.validate_custom()?;
    Ok(Json(SeedResponse { inserted }))
}

#[post("/achievements", data = "<request>")]
pub async fn api_create_achievement(
    request: Json<NewAchievement>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Custom<Json<CreatedResponse>>> {
    user.require_permission(Permission::ManageAchievements)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let id = create_achievement(db, &validated).await.validate_custom()?;
    Ok(created(id))
}

#[put("/achievements/<id>", data = "<request>")]
pub async fn api_update_achievement(
    id: i64,
    request: Json<AchievementUpdate>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> ApiResult<Json<Achievement>> {
    user.require_permission(Permission::ManageAchievements)
        .validate_custom()?;
    let validated = request.validate_custom()?;

    let updated = update_achievement(db, id, &validated)
        .await
        .validate_custom()?;
    Ok(Json(updated))
}

#[get("/organizations/<id>/leaderboard?<limit>&<window>")]
pub async fn api_get_leaderboard(
    id: i64,
    limit: Option<i64>,
    window: Option<&str>,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<GamificationConfig>,
) -> ApiResult<Json<Vec<LeaderboardEntry>>> {
    user.require_permission(Permission::ViewLeaderboard)
        .validate_custom()?;
    user.require_organization_access(id).validate_custom()?;

    let window = match window {
        Some(raw) => raw.parse::<LeaderboardWindow>().map_err(|_| invalid_window(raw))?,
        None => LeaderboardWindow::AllTime,
    };

    let entries = get_leaderboard(db, config, id, limit, window)
        .await
        .validate_custom()?;
    Ok(Json(entries))
}

fn invalid_window(raw: &str) -> ApiError {
    Custom(
        Status::BadRequest,
        Json(ValidationResponse::with_error(
            "window",
            &format!("Unknown leaderboard window '{}', expected all_time or weekly", raw),
        )),
    )
}

#[post("/organizations/<id>/reconcile")]
pub async fn api_reconcile_organization(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<GamificationConfig>,
) -> ApiResult<Json<ReconcileSummary>> {
    user.require_permission(Permission::RunReconciliation)
        .validate_custom()?;
    user.require_organization_access(id).validate_custom()?;

    let summary = reconcile_organization(db, config, id)
        .await
        .validate_custom()?;
    Ok(Json(summary))
}
