//! Autodiscover client for Exchange Web Services.
//!
//! Given an email address and credentials, this crate walks the
//! autodiscover protocol to find the EWS endpoint serving that mailbox:
//! probing the well-known HTTPS URLs for the domain, harvesting HTTP
//! redirects, and falling back to the `_autodiscover._tcp` SRV record.
//! Results are cached per `(domain, credentials)` in memory and on disk,
//! so repeat lookups cost one HTTP request and zero DNS queries.
//!
//! ```no_run
//! use ews_autodiscover::{discover, Credentials};
//!
//! # fn main() -> Result<(), ews_autodiscover::AutodiscoverError> {
//! let credentials = Credentials::new("john@example.com", "topsecret");
//! let discovered = discover("john@example.com", &credentials)?;
//! println!("EWS endpoint: {}", discovered.protocol.service_endpoint());
//! # Ok(())
//! # }
//! ```
//!
//! For repeated discoveries, or to supply your own transport, resolver or
//! cache, use [`Autodiscovery`] directly.

pub mod cache;
pub mod credentials;
pub mod discovery;
pub mod dns;
pub mod error;
pub mod protocol;
pub mod response;
pub mod retry;
pub mod transport;

pub use credentials::Credentials;
pub use discovery::{Autodiscovery, Discovered};
pub use error::AutodiscoverError;
pub use protocol::{Configuration, Protocol};
pub use response::{AutodiscoverResponse, ProtocolType, Settings};
pub use retry::RetryPolicy;
pub use transport::AuthType;

use cache::AUTODISCOVER_CACHE;

/// Resolve `email` to its EWS endpoint using the process-wide cache.
pub fn discover(
    email: &str,
    credentials: &Credentials,
) -> Result<Discovered, AutodiscoverError> {
    Autodiscovery::new()?.discover(email, credentials)
}

/// Empty the process-wide endpoint cache, both the in-memory and the
/// persisted layer.
pub fn clear_cache() {
    AUTODISCOVER_CACHE.clear();
}

/// Drop the in-memory layer of the process-wide cache. The persisted
/// layer stays; a later lookup rehydrates from it.
pub fn close_connections() {
    AUTODISCOVER_CACHE.close();
}
