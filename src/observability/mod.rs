//! Observability for the apply engine
//!
//! - Structured JSON logging with typed events
//! - Counter metrics owned by whoever wires the engine
//! - Begin/complete scopes around batches and recovery
//!
//! Observability never changes apply behavior: log write failures are
//! swallowed and metrics are relaxed atomics.

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{ApplyMetrics, MetricsSnapshot};
pub use scope::ObservationScope;

/// Log `event` at the severity its kind implies.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_fatal() {
        Severity::Fatal
    } else {
        Severity::Info
    };
    Logger::log(severity, event.as_str(), fields);
}
