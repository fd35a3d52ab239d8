use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::AppError;

use super::{Permission, Role};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub display_name: String,
    pub role: Role,
    pub organization_id: Option<i64>,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbUser {
    pub id: i64,
    pub display_name: String,
    pub role: String,
    pub organization_id: Option<i64>,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

impl TryFrom<DbUser> for User {
    type Error = AppError;

    fn try_from(user: DbUser) -> Result<Self, Self::Error> {
        Ok(Self {
            id: user.id,
            display_name: user.display_name,
            role: user.role.parse()?,
            organization_id: user.organization_id,
            active: user.active,
            created_at: user.created_at,
        })
    }
}

impl User {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    pub fn require_permission(&self, permission: Permission) -> Result<(), AppError> {
        if self.role.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(
                user_id = self.id,
                role = %self.role.as_str(),
                permission = ?permission,
                "Permission denied"
            );
            Err(AppError::Authorization(format!(
                "Role {} lacks {:?}",
                self.role, permission
            )))
        }
    }

    pub fn belongs_to(&self, organization_id: i64) -> bool {
        self.organization_id == Some(organization_id)
    }

    /// Acting on another user's gamification state needs `permission` and,
    /// unless the caller can see every organization, a shared organization.
    pub fn require_access_to(
        &self,
        target: &User,
        own_permission: Permission,
        permission: Permission,
    ) -> Result<(), AppError> {
        if self.id == target.id {
            return self.require_permission(own_permission);
        }

        self.require_permission(permission)?;

        if self.has_permission(Permission::ViewAllOrganizations) {
            return Ok(());
        }

        match target.organization_id {
            Some(org) if self.belongs_to(org) => Ok(()),
            _ => {
                tracing::warn!(
                    user_id = self.id,
                    target_user_id = target.id,
                    "Cross-organization access denied"
                );
                Err(AppError::Authorization(
                    "User belongs to another organization".to_string(),
                ))
            }
        }
    }

    pub fn require_organization_access(&self, organization_id: i64) -> Result<(), AppError> {
        if self.belongs_to(organization_id)
            || self.has_permission(Permission::ViewAllOrganizations)
        {
            Ok(())
        } else {
            Err(AppError::Authorization(format!(
                "No access to organization {}",
                organization_id
            )))
        }
    }
}
