//! Error types for control-plane clients.

use thiserror::Error;

/// Errors raised by a [`CloudClient`](super::CloudClient).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClientError {
    /// The provider accepted the request but rejected the action.
    #[error("{action} failed with {code}: {message}")]
    Api {
        /// Control-plane action that was invoked (for example `RunInstances`).
        action: String,
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },
    /// The request never produced a provider response.
    #[error("{action} request failed: {message}")]
    Transport {
        /// Control-plane action that was invoked.
        action: String,
        /// Transport level error message.
        message: String,
    },
    /// The provider response could not be decoded.
    #[error("{action} returned an unreadable response: {message}")]
    Decode {
        /// Control-plane action that was invoked.
        action: String,
        /// Decoder error message.
        message: String,
    },
}

impl ClientError {
    /// Builds an [`ClientError::Api`] value.
    #[must_use]
    pub fn api(
        action: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Api {
            action: action.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}
