use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://lms_gamification.db";

fn env_files_for_profile(profile: &str) -> [&'static str; 3] {
    match profile {
        "production" | "release" => ["config/common.env", "config/prod.env", ".secrets.env"],
        _ => ["config/common.env", "config/dev.env", ".secrets.env"],
    }
}

/// Load the env files for the active Rocket profile, later files overriding
/// earlier ones. Missing files are skipped. Returns the files that were read.
pub fn load_environment() -> Result<Vec<PathBuf>, dotenvy::Error> {
    let profile = dotenvy::var("ROCKET_PROFILE").unwrap_or_else(|_| "development".to_string());

    let mut loaded = Vec::new();
    for file in env_files_for_profile(&profile) {
        if let Some(path) = load_env_file(file)? {
            loaded.push(path);
        }
    }

    info!(%profile, files = ?loaded, "Environment loaded");
    Ok(loaded)
}

fn load_env_file(path: &str) -> Result<Option<PathBuf>, dotenvy::Error> {
    let path = Path::new(path);
    if !path.exists() {
        debug!(path = %path.display(), "Environment file not found, skipping");
        return Ok(None);
    }

    dotenvy::from_filename_override(path)?;
    Ok(Some(path.to_path_buf()))
}

pub fn database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}
