//! Error types of the harness library.

use reqwest::StatusCode;

/// Errors that can happen while talking to the storage service or its metrics endpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request could not be sent, or its response body could not be read.
    ///
    /// These are network errors as well as errors decoding the response.
    #[error("request failed: {context}")]
    Reqwest {
        /// What the request was trying to do.
        context: String,
        /// The underlying client error.
        #[source]
        cause: reqwest::Error,
    },
    /// The service answered with a non-success status code.
    #[error("{context}: unexpected status {status}: {body}")]
    Status {
        /// What the request was trying to do.
        context: String,
        /// The returned status code.
        status: StatusCode,
        /// The response body, as far as it could be read.
        body: String,
    },
    /// The service endpoint is not a usable URL.
    #[error("{message}")]
    InvalidUrl {
        /// The URL error message.
        message: String,
    },
    /// The metrics exposition could not be parsed.
    #[error("invalid metrics exposition")]
    Parse {
        /// The underlying parser error.
        #[source]
        cause: std::io::Error,
    },
}

impl Error {
    pub(crate) fn reqwest(context: impl Into<String>, cause: reqwest::Error) -> Self {
        Self::Reqwest {
            context: context.into(),
            cause,
        }
    }
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
