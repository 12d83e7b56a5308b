pub mod alerts;
pub mod analytics;
pub mod api;
pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod cursor;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod trends;
