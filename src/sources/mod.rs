//! Source bookkeeping: per-source metrics and the registry owning them

pub mod metrics;
pub mod registry;

pub use metrics::{MetricsSnapshot, SourceMetrics};
pub use registry::SourceRegistry;
