//! Observability: structured logging, counters and the health endpoint

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, CounterMetrics, MetricsSink, MetricsSnapshot, NoopMetrics};

pub use logging::{query_span, subscription_span};
