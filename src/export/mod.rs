//! Operational metrics export.

pub mod health;

pub use health::HealthMetrics;
