//! Tracing and logging setup shared by every binary that hosts the
//! download engine.

/// Install the process-wide subscriber, configured from the environment.
///
/// Later calls leave the first subscriber in place.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
