// =============================================================================
// Error taxonomy
// =============================================================================
//
// `CoordinatorError` gives each error kind in the design document a typed
// variant so call sites can match on disposition (fatal / retried / logged).
// Everywhere else just propagates with `anyhow::Context`.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Missing or malformed configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Collaborator initialization failure. Fatal before entering the loop.
    #[error("init error: {0}")]
    Init(String),

    /// Network/timeout on exchange or model call. Retried per policy; a
    /// logged failure after exhaustion, does not kill the heartbeat.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Exchange rejected the request outright (4xx/5xx with a body).
    #[error("exchange API error {code}: {message}")]
    Api { code: u16, message: String },

    /// Risk manager refused a trade. Not an error — logged at info.
    #[error("trade rejected: {0}")]
    ValidationRejection(String),

    /// Fewer than `K_min` models responded this cycle.
    #[error("insufficient models responded: {responded}/{required}")]
    ModelUnavailable { responded: usize, required: usize },

    /// Attempt to downgrade a terminal order state or violate an invariant.
    /// Logged at error; the offending write is dropped.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// Emergency-shutdown threshold crossed. Sets the latch; heartbeat exits.
    #[error("fatal invariant violation: {0}")]
    FatalInvariant(String),
}

impl CoordinatorError {
    /// Severity this error should be logged and surfaced to the EventSink at.
    pub fn severity(&self) -> crate::events::Severity {
        use crate::events::Severity;
        match self {
            Self::Config(_) | Self::Init(_) | Self::FatalInvariant(_) => Severity::Critical,
            Self::Api { .. } | Self::DataIntegrity(_) => Severity::Error,
            Self::TransientIo(_) | Self::ModelUnavailable { .. } => Severity::Warning,
            Self::ValidationRejection(_) => Severity::Info,
        }
    }
}
