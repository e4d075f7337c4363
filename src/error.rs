//! Error types for listener registration and message dispatch.

use thiserror::Error;

/// Broker API status reported when a stream or consumer does not exist.
pub const NOT_FOUND: u16 = 404;

/// Broker API status reported when a create request conflicts with
/// existing broker state.
pub const BAD_REQUEST: u16 = 400;

/// Errors that can occur while provisioning, subscribing or dispatching.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Broker admin API rejected a request.
    ///
    /// `code` follows HTTP-style status semantics; [`NOT_FOUND`] marks a
    /// missing stream or consumer.
    #[error("broker api error {code}: {description}")]
    Api { code: u16, description: String },

    /// Connection or IO level broker failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Stream or consumer provisioning failed for one listener.
    #[error("failed to provision listener {listener}: {reason}")]
    Provisioning { listener: String, reason: String },

    /// Binding a subscription to a provisioned consumer failed.
    #[error("failed to subscribe listener {listener}: {reason}")]
    Subscribe { listener: String, reason: String },

    /// A listener cannot accept the payload type it declares.
    #[error("listener {listener} is not a usable message handler: {reason}")]
    Capability { listener: String, reason: String },

    /// Message body could not be converted into the handler's payload type.
    #[error("cannot convert message to {type_name}: {reason}")]
    Decode {
        type_name: &'static str,
        reason: String,
    },

    /// The user handler reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Worker pool queue is full and the listener rejects on saturation.
    #[error("worker pool for listener {listener} is saturated")]
    PoolSaturated { listener: String },

    /// Work was submitted after the pool stopped accepting it.
    #[error("worker pool is closed")]
    PoolClosed,

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required configuration value is missing.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Two listeners were registered under the same name.
    #[error("listener already registered: {0}")]
    DuplicateListener(String),

    /// `start()` was called on a container that already started.
    #[error("listener container already started")]
    AlreadyStarted,

    /// The container or broker has been shut down.
    #[error("listener container is shut down")]
    ShutDown,

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ListenerError {
    // ---
    /// Shorthand for a broker API error.
    pub fn api(code: u16, description: impl Into<String>) -> Self {
        Self::Api {
            code,
            description: description.into(),
        }
    }

    /// Returns `true` for a broker "not found" status.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code, .. } if *code == NOT_FOUND)
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Error type returned by user message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;
