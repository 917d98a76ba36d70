//! HTTP API handlers for mta-audit

pub mod audit;
pub mod health;

pub use audit::audit_routes;
pub use health::health_routes;
