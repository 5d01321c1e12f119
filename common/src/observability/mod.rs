//! Observability utilities (metrics + tracing).

mod metrics;
mod tracing;

pub use self::metrics::{MetricsContext, MetricsServerConfig};
pub use self::tracing::{init_tracing, ColorWhen};
