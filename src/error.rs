//! Errors raised while running a build.

use std::fmt::{self, Display};
use std::time::Duration;

use thiserror::Error;

use crate::cloud::SpecError;
use crate::context::MissingStateError;
use crate::keygen::KeygenError;
use crate::steps::StepName;
use crate::transport::ProvisionError;

/// Failure raised by a build step.
#[derive(Debug, Error)]
pub enum BuildError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when the provider rejects or fails to answer a request.
    #[error("{operation} request failed: {source}")]
    ProviderRequest {
        /// Cloud operation that failed.
        operation: &'static str,
        /// Provider specific error.
        #[source]
        source: ProviderError,
    },
    /// Raised when an asynchronous provider action reports failure.
    #[error("action {action} failed: {message}")]
    ActionFailed {
        /// Command of the failed action.
        action: String,
        /// Message reported by the provider.
        message: String,
    },
    /// Raised when a poll loop reaches its deadline.
    #[error("timed out after {}s waiting for {waiting_for}", .waited.as_secs())]
    PollTimeout {
        /// What the loop was waiting for.
        waiting_for: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// Raised when an image filter matches nothing.
    #[error("no image matches selector {selector:?}")]
    NoMatchingImage {
        /// Label selector used.
        selector: String,
    },
    /// Raised when an image filter matches several images and the most recent
    /// one was not requested.
    #[error("{count} images match selector {selector:?}; set most_recent or narrow the selector")]
    AmbiguousImage {
        /// Label selector used.
        selector: String,
        /// Number of matching images.
        count: usize,
    },
    /// Raised when the server never accepts connections.
    #[error("server at {address}:{port} did not accept connections: {last_error}")]
    ConnectivityTimeout {
        /// Address probed.
        address: String,
        /// Port probed.
        port: u16,
        /// Last error reported by the transport.
        last_error: String,
    },
    /// Raised when the server has no address the transport could use.
    #[error("server {server} has no reachable address")]
    MissingAddress {
        /// Server identifier.
        server: String,
    },
    /// Raised when a step reads state no earlier step produced.
    #[error(transparent)]
    MissingState(#[from] MissingStateError),
    /// Raised when a server request cannot be assembled.
    #[error("invalid server request: {0}")]
    InvalidRequest(#[from] SpecError),
    /// Raised when the ephemeral keypair cannot be generated.
    #[error("failed to generate keypair: {0}")]
    KeyGeneration(#[from] KeygenError),
    /// Raised when the external provisioning phase fails.
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisionError),
    /// Raised when the build is cancelled.
    #[error("build cancelled")]
    Cancelled,
}

impl<ProviderError> BuildError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Wraps a provider error raised by `operation`.
    pub const fn provider(operation: &'static str, source: ProviderError) -> Self {
        Self::ProviderRequest { operation, source }
    }

    /// Returns a closure mapping provider errors for `operation`, for use with
    /// `map_err`.
    pub fn request(operation: &'static str) -> impl FnOnce(ProviderError) -> Self {
        move |source| Self::provider(operation, source)
    }
}

/// Cleanup that failed while unwinding a build.
#[derive(Debug)]
pub struct CleanupFailure<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Step whose cleanup failed.
    pub step: StepName,
    /// Cleanup error.
    pub error: BuildError<ProviderError>,
}

impl<ProviderError> Display for CleanupFailure<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}: {}", self.step, self.error)
    }
}

/// Appends cleanup failures to a primary error message.
pub(crate) fn append_cleanup_note<E: Display>(message: String, cleanup_errors: &[E]) -> String {
    if cleanup_errors.is_empty() {
        return message;
    }
    let notes = cleanup_errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!("{message} (cleanup also failed: {notes})")
}
