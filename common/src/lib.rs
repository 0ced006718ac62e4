mod metrics;
mod tracing;

pub use metrics::{MetricsBuilder, MetricsReporter};
pub use tracing::init_tracing;
