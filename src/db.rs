use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};

use crate::auth::{DbUser, Role, User};
use crate::error::AppError;
use crate::models::timestamp_now;

const USER_COLUMNS: &str = "id, display_name, role, organization_id, active, created_at";

#[derive(Debug, Clone, Serialize, PartialEq, sqlx::FromRow)]
pub struct Organization {
    pub id: i64,
    pub name: String,
}

#[instrument]
pub async fn create_organization(pool: &Pool<Sqlite>, name: &str) -> Result<i64, AppError> {
    info!("Creating organization");

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM organizations WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    if existing.is_some() {
        return Err(AppError::Validation(format!(
            "Organization '{}' already exists",
            name
        )));
    }

    let res = sqlx::query("INSERT INTO organizations (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(timestamp_now())
        .execute(pool)
        .await?;

    Ok(res.last_insert_rowid())
}

#[instrument]
pub async fn get_organization(pool: &Pool<Sqlite>, id: i64) -> Result<Organization, AppError> {
    sqlx::query_as::<_, Organization>("SELECT id, name FROM organizations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Organization with id {} not found", id)))
}

/// Identity is owned by the external provider; this mirrors the parts the
/// engine needs (role, tenant, active flag).
#[instrument]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    display_name: &str,
    role: Role,
    organization_id: Option<i64>,
) -> Result<i64, AppError> {
    info!("Creating user");

    match (role, organization_id) {
        (Role::Superadmin, Some(_)) => {
            return Err(AppError::Validation(
                "Superadmins are platform-wide and cannot belong to an organization".to_string(),
            ));
        }
        (Role::Superadmin, None) => {}
        (_, None) => {
            return Err(AppError::Validation(format!(
                "A {} must belong to an organization",
                role
            )));
        }
        (_, Some(org)) => {
            get_organization(pool, org).await?;
        }
    }

    let res = sqlx::query(
        "INSERT INTO users (display_name, role, organization_id, active, created_at)
         VALUES (?, ?, ?, TRUE, ?)",
    )
    .bind(display_name)
    .bind(role.as_str())
    .bind(organization_id)
    .bind(timestamp_now())
    .execute(pool)
    .await?;

    Ok(res.last_insert_rowid())
}

#[instrument]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    let row = sqlx::query_as::<_, DbUser>(&format!(
        "SELECT {} FROM users WHERE id = ?",
        USER_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(user) => User::try_from(user),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument]
pub async fn get_users_in_organization(
    pool: &Pool<Sqlite>,
    organization_id: i64,
    include_inactive: bool,
) -> Result<Vec<User>, AppError> {
    let query = if include_inactive {
        format!(
            "SELECT {} FROM users WHERE organization_id = ? ORDER BY id",
            USER_COLUMNS
        )
    } else {
        format!(
            "SELECT {} FROM users WHERE organization_id = ? AND active = TRUE ORDER BY id",
            USER_COLUMNS
        )
    };

    sqlx::query_as::<_, DbUser>(&query)
        .bind(organization_id)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(User::try_from)
        .collect()
}

/// Soft (de)activation. Users are never deleted while ledger rows point at them.
#[instrument]
pub async fn set_user_active(
    pool: &Pool<Sqlite>,
    user_id: i64,
    active: bool,
) -> Result<bool, AppError> {
    info!("Toggling user active status");

    let res = sqlx::query("UPDATE users SET active = ? WHERE id = ?")
        .bind(active)
        .bind(user_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            user_id
        )));
    }

    Ok(active)
}
