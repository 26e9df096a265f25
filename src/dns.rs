//! DNS adapter for autodiscover lookups.
//!
//! Step 4 of the protocol queries SRV records on `_autodiscover._tcp.{domain}`,
//! and redirect validation canonicalizes hostnames through CNAME. Lookups go
//! through the [`DnsLookup`] trait so the engine can be tested without a
//! resolver; the production implementation uses a blocking `hickory-resolver`.

use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::Resolver;
use tracing::debug;

use crate::error::AutodiscoverError;

/// Bounded timeout for every DNS query.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// One SRV answer, e.g. `8 100 443 webmail.example.com.`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

pub trait DnsLookup: Send + Sync {
    /// The canonical name of `hostname`, or `None` when there is no CNAME
    /// or the canonical name equals the input.
    fn cname(&self, hostname: &str) -> Option<String>;

    /// All usable SRV records for `name`. A missing record set
    /// (NXDOMAIN, no answer, no nameservers) is "not configured", not an
    /// error, and yields an empty list.
    fn srv(&self, name: &str) -> Vec<SrvRecord>;
}

impl<D: DnsLookup + ?Sized> DnsLookup for &D {
    fn cname(&self, hostname: &str) -> Option<String> {
        (**self).cname(hostname)
    }

    fn srv(&self, name: &str) -> Vec<SrvRecord> {
        (**self).srv(name)
    }
}

/// Select the TLS-capable record to follow: port 443 only, highest
/// priority. Ties are broken deterministically by lowest weight, then
/// lexicographically smallest target.
pub fn select_best_srv(records: &[SrvRecord]) -> Option<&SrvRecord> {
    records
        .iter()
        .filter(|record| record.port == 443)
        .max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.weight.cmp(&a.weight))
                .then(b.target.cmp(&a.target))
        })
}

/// Blocking system resolver.
pub struct HickoryDns {
    resolver: Resolver,
}

impl HickoryDns {
    pub fn new() -> Result<Self, AutodiscoverError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = DNS_TIMEOUT;
        let resolver = Resolver::new(ResolverConfig::default(), opts)
            .map_err(|e| AutodiscoverError::Dns(e.to_string()))?;
        Ok(Self { resolver })
    }
}

impl DnsLookup for HickoryDns {
    fn cname(&self, hostname: &str) -> Option<String> {
        debug!("Attempting to get canonical name for {hostname}");
        let lookup = match self.resolver.lookup(hostname, RecordType::CNAME) {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!("CNAME lookup failed for {hostname}: {e}");
                return None;
            }
        };
        for rdata in lookup.iter() {
            if let RData::CNAME(cname) = rdata {
                let canonical = cname.0.to_utf8();
                let canonical = canonical.trim_end_matches('.').to_lowercase();
                if canonical != hostname.trim_end_matches('.').to_lowercase() {
                    debug!("{hostname} has canonical name {canonical}");
                    return Some(canonical);
                }
            }
        }
        None
    }

    fn srv(&self, name: &str) -> Vec<SrvRecord> {
        debug!("Attempting to get SRV records for {name}");
        let lookup = match self.resolver.srv_lookup(name) {
            Ok(lookup) => lookup,
            Err(e) => {
                debug!("DNS lookup failure for {name}: {e}");
                return Vec::new();
            }
        };
        let mut records = Vec::new();
        for srv in lookup.iter() {
            let target = srv.target().to_utf8();
            let target = target.trim_end_matches('.').to_string();
            // A target of "." means the service is explicitly not available.
            if target.is_empty() {
                debug!("Skipping unusable SRV record for {name}");
                continue;
            }
            let record = SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target,
            };
            debug!("Found SRV record {record:?}");
            records.push(record);
        }
        records
    }
}
