//! Error types surfaced by the autodiscover protocol.
//!
//! Transport- and parse-level failures are swallowed inside the step
//! machine and only drive fallthrough to the next step. Callers see a
//! resolved protocol or one of the variants below.

use thiserror::Error;

/// Errors that can reach the caller of [`discover`](crate::discover).
#[derive(Debug, Error)]
pub enum AutodiscoverError {
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    /// The server was found, but it has no mailbox for this address.
    #[error("The SMTP address has no mailbox associated with it")]
    NonExistentMailbox,

    /// An error envelope with a code and message we do not recognize.
    #[error("Unknown autodiscover error {code}: {message}")]
    ServerError { code: String, message: String },

    #[error("We were redirected to an email address we have already seen")]
    CircularRedirect,

    #[error("DNS resolver setup failed: {0}")]
    Dns(String),

    #[error("HTTP client setup failed: {0}")]
    Http(String),

    #[error(
        "All steps in the autodiscover protocol failed for email {0}. If you think this is an \
         error, consider doing an official test at https://testconnectivity.microsoft.com"
    )]
    Failed(String),
}
