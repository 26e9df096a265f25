//! Resolved protocol descriptor handed back to the caller.
//!
//! The autodiscover and EWS servers are usually not the same machine, so a
//! successful discovery produces a fresh [`Protocol`] pointing at the EWS
//! endpoint. The actual SOAP traffic is the caller's business.

use url::Url;

use crate::credentials::Credentials;
use crate::retry::RetryPolicy;
use crate::transport::AuthType;

/// Connection settings for an EWS endpoint.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub service_endpoint: Url,
    pub credentials: Credentials,
    /// `None` means "auto-detect on first real use". The auth package
    /// hinted at by the autodiscover response can be wrong, so it is not
    /// forced on the caller.
    pub auth_type: Option<AuthType>,
    /// Exchange build string, e.g. `15.01.2507.016`, when the response
    /// carried one.
    pub version: Option<String>,
    pub retry_policy: RetryPolicy,
}

/// A connection-capable descriptor for the resolved EWS service.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub config: Configuration,
}

impl Protocol {
    pub fn service_endpoint(&self) -> &Url {
        &self.config.service_endpoint
    }
}
