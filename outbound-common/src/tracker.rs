use std::fmt;

use tracing::{error, warn};

use crate::error::OutboundError;
use crate::metrics_consts::TRACKED_ERRORS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Observability sink for non-fatal errors.
///
/// Tracking is fire-and-forget: it never blocks the pipeline and never alters
/// its control flow, so implementations must not fail nor wait on I/O.
pub trait Tracker: Send + Sync {
    fn track_error(&self, error: &OutboundError, severity: Severity);
}

/// Tracks errors as tracing events, counted per severity.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogTracker;

impl Tracker for LogTracker {
    fn track_error(&self, error: &OutboundError, severity: Severity) {
        match severity {
            Severity::Warning => warn!(%severity, "tracked error: {}", error),
            Severity::Error => error!(%severity, "tracked error: {}", error),
        }
        metrics::counter!(TRACKED_ERRORS, "severity" => severity.to_string()).increment(1);
    }
}
