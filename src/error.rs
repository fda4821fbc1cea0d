//! Error taxonomy for the NPU runtime core.
//!
//! Every variant corresponds to one of the error kinds enumerated in the
//! design's error-handling section. Driver-reported failures are retained
//! verbatim on the failing request; nothing here is swallowed silently.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the device manager, device scheduler, shared
/// memory pool, and inference operator.
#[derive(Debug, Error)]
pub enum Error {
    /// Shape/attribute mismatch, malformed grouping policy, non-unix
    /// socket address requested together with shared memory.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operator used before lazy initialisation completed, or an
    /// attribute/size mismatch discovered at load time.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// No execution group could be created, or no shared-memory name
    /// could be generated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The driver daemon could not be reached.
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    /// The device was closed by signal-triggered teardown.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A load collided with an existing primary model id.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The driver returned an unexpected non-OK status, a response/request
    /// size mismatch, or a name absent from a response.
    #[error("internal error: {0}")]
    Internal(String),

    /// A buffer copy size exceeded its target.
    #[error("out of range: {0}")]
    OutOfRange(String),
}

impl Error {
    /// Short machine-readable kind, used in log fields and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Error::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Aborted(_) => "ABORTED",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::Internal(_) => "INTERNAL",
            Error::OutOfRange(_) => "OUT_OF_RANGE",
        }
    }
}
