//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! servers, endpoints, calls:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, histograms via the metrics facade)
//! ```
//!
//! # Design Decisions
//! - Telemetry hooks are explicit values registered on a server
//! - No exporter is bundled; the embedding binary installs one if wanted

pub mod logging;
pub mod metrics;

pub use self::metrics::MetricsStats;
