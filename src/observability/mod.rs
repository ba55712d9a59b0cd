//! Observability for the alert control service
//!
//! Structured logging, the global metrics collector and the HTTP health
//! endpoints used by operators and orchestration platforms.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{lifecycle_span, message_span, mqtt_span, state_span};
