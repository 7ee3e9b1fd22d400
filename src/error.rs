use thiserror::Error;

/// Error taxonomy of the sender core.
///
/// Variants are `Clone` so the supervisor can record the first fatal cause for
/// `stop()` while the task (or caller) that hit it surfaces the same value.
#[derive(Debug, Clone, Error)]
pub enum FmtpError {
    /// A precondition of `send_product` was violated. Surfaces synchronously
    /// to the caller and leaves all other state undisturbed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A multicast or unicast send/receive failed. Fatal to the sender.
    #[error("egress failed: {0}")]
    EgressFailed(String),

    /// Interface, bind or socket-option setup failed.
    #[error("configuration failed: {0}")]
    ConfigFailed(String),

    /// The product-index delay queue was disabled by `stop()`. Internal, not
    /// surfaced through the public API.
    #[error("product-index delay queue is disabled")]
    Disabled,

    /// Framing violation on a recovery stream; the worker closes.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
}
