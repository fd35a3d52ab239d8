use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewOwnProgress,
    RecordOwnActivity,
    ViewLeaderboard,

    ViewOrganizationProgress,
    RecordActivity,

    AdjustPoints,
    ManageUsers,
    RunReconciliation,

    ManageAchievements,
    ManageOrganizations,
    ViewAllOrganizations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Professor,
    Admin,
    Superadmin,
}

static STUDENT_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.insert(Permission::ViewOwnProgress);
    permissions.insert(Permission::RecordOwnActivity);
    permissions.insert(Permission::ViewLeaderboard);

    permissions
});

static PROFESSOR_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.extend(STUDENT_PERMISSIONS.iter().copied());

    permissions.insert(Permission::ViewOrganizationProgress);
    permissions.insert(Permission::RecordActivity);

    permissions
});

static ADMIN_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.extend(PROFESSOR_PERMISSIONS.iter().copied());

    permissions.insert(Permission::AdjustPoints);
    permissions.insert(Permission::ManageUsers);
    permissions.insert(Permission::RunReconciliation);

    permissions
});

static SUPERADMIN_PERMISSIONS: Lazy<HashSet<Permission>> = Lazy::new(|| {
    let mut permissions = HashSet::new();

    permissions.extend(ADMIN_PERMISSIONS.iter().copied());

    permissions.insert(Permission::ManageAchievements);
    permissions.insert(Permission::ManageOrganizations);
    permissions.insert(Permission::ViewAllOrganizations);

    permissions
});

impl Role {
    pub fn permissions(&self) -> &'static HashSet<Permission> {
        match self {
            Role::Student => &STUDENT_PERMISSIONS,
            Role::Professor => &PROFESSOR_PERMISSIONS,
            Role::Admin => &ADMIN_PERMISSIONS,
            Role::Superadmin => &SUPERADMIN_PERMISSIONS,
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Professor => "professor",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "professor" => Ok(Role::Professor),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::Superadmin),
            _ => Err(AppError::Validation(format!("Unknown role: {}", s))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
