pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod jobs;
pub mod messaging;
pub mod models;
pub mod routes;
pub mod users;
