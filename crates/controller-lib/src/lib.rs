//! Controller library for cost-aware capacity overlays
//!
//! This crate provides the core functionality for:
//! - Aggregating Savings Plan and Reserved Instance data
//! - Threshold-based capacity decisions
//! - Parsing NodePool preference annotations
//! - Rendering and reconciling `NodeOverlay` objects
//! - Health checks and observability

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod decision;
pub mod generator;
pub mod health;
pub mod models;
pub mod observability;
pub mod preference;
pub mod reconcile;
pub mod source;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, MetricsSink, NoopMetrics, StructuredLogger};
