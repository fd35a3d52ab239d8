#[macro_use]
extern crate rocket;

pub mod achievements;
pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod db;
pub mod env;
pub mod error;
pub mod events;
pub mod leaderboard;
pub mod ledger;
pub mod models;
pub mod progress;
pub mod reconcile;
pub mod streak;
pub mod telemetry;
pub mod validation;
#[cfg(test)]
mod test;

use api::{
    api_append_points, api_create_achievement, api_create_organization, api_create_user,
    api_evaluate_achievements, api_get_history, api_get_leaderboard, api_get_points,
    api_get_rank, api_get_streak, api_get_user_achievements, api_handle_event,
    api_list_achievements, api_me, api_reconcile_organization, api_record_activity,
    api_record_watch_time, api_seed_achievements, api_set_user_active, api_update_achievement,
    health,
};
use auth::{forbidden_api, unauthorized_api};
use config::GamificationConfig;
use rocket::{Build, Rocket};
use sqlx::SqlitePool;
use telemetry::TelemetryFairing;
use tracing::info;

pub fn build_rocket(pool: SqlitePool, config: GamificationConfig) -> Rocket<Build> {
    info!("Starting gamification engine");

    rocket::build()
        .manage(pool)
        .manage(config)
        .mount(
            "/api",
            routes![
                api_me,
                api_create_organization,
                api_create_user,
                api_set_user_active,
                api_append_points,
                api_get_points,
                api_get_history,
                api_get_streak,
                api_get_user_achievements,
                api_get_rank,
                api_record_activity,
                api_handle_event,
                api_record_watch_time,
                api_evaluate_achievements,
                api_list_achievements,
                api_seed_achievements,
                api_create_achievement,
                api_update_achievement,
                api_get_leaderboard,
                api_reconcile_organization,
            ],
        )
        .register("/api", catchers![unauthorized_api, forbidden_api])
        .mount("/api", routes![health])
        .attach(TelemetryFairing)
}
