
mod api;
mod migrations;
mod streak;
