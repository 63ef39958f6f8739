//! Metrics collection and the Prometheus recorder

pub mod metrics;
pub mod recorder;

pub use self::metrics::*;
pub use recorder::{MetricsManager, get_metrics_manager, init_metrics};
