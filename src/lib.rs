// ABOUTME: Library crate for ak-survey-sync
// ABOUTME: Materializes ActionKit survey actions into one queryable table per survey

pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod filters;
pub mod postgres;
pub mod preflight;
pub mod survey;
pub mod utils;

pub use config::{ConfigLayer, DbType, SyncConfig};
pub use error::SurveySyncError;
