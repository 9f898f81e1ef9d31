use thiserror::Error;

/// Failure taxonomy for the controller core. Nothing here is fatal to the
/// process: every variant is either surfaced to the caller as a typed outcome
/// or logged and absorbed at the edge that produced it.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Dispatch target resolves to no live session. Reported to the caller,
    /// never retried.
    #[error("target device '{0}' not live")]
    TargetNotLive(String),

    /// Registration payload carried an empty device identifier.
    #[error("missing device identifier in registration payload")]
    MissingIdentifier,

    /// Heartbeat or response from a handle the registry does not know.
    /// Recovered by re-issuing the registration prompt.
    #[error("unknown sender handle '{0}'")]
    UnknownSender(String),

    /// Chunk or response payload failed basic shape checks.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Archive or stream write failed; the operation degrades, protocol state
    /// is unaffected.
    #[error("persistence failure: {0}")]
    Persistence(#[from] std::io::Error),
}
