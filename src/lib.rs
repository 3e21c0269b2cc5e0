//! # Rim Weighting Library
//!
//! Computes per-respondent survey weights so that a sample matches population
//! targets, and stores them per response weighting context.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repositories;
pub mod telemetry;
pub mod weighting;
pub use migration;
