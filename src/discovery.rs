//! The autodiscover step machine.
//!
//! Finding the EWS endpoint for an email address means walking a fixed
//! sequence of candidate URLs:
//!
//! 1. `https://{domain}/Autodiscover/Autodiscover.xml`
//! 2. `https://autodiscover.{domain}/Autodiscover/Autodiscover.xml`
//! 3. An unauthenticated GET on the plain-HTTP variant of URL 2, hoping
//!    for an HTTP redirect to a usable HTTPS URL
//! 4. The target of the `_autodiscover._tcp.{domain}` SRV record
//! 5. Evaluation of whatever response a step produced
//! 6. Give up
//!
//! Every transport or parse failure along the way only means "try the next
//! step". The one restart point sits above the steps: a `redirectAddr`
//! response abandons the whole run and starts over with the new address,
//! with its own loop guard, and without holding the discovery lock across
//! the restart.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{AutodiscoverCache, CacheEntry, CacheKey, AUTODISCOVER_CACHE};
use crate::credentials::Credentials;
use crate::dns::{select_best_srv, DnsLookup, HickoryDns};
use crate::error::AutodiscoverError;
use crate::protocol::{Configuration, Protocol};
use crate::response::{error_from_envelope, parse, payload, AutodiscoverResponse, Settings};
use crate::retry::RetryPolicy;
use crate::transport::{
    auth_type_from_response, AuthType, HttpTransport, Method, ReqwestTransport, Request, Response,
    TransportError,
};

/// Hard bound on followed URL redirects within one discovery run. Both
/// HTTP `Location` redirects and XML `redirectUrl` responses count.
const MAX_REDIRECTS: u32 = 10;

/// Cool-down before re-probing a URL after a transient connection error,
/// when the probe retry policy allows retrying at all.
const RETRY_WAIT: Duration = Duration::from_secs(10);

/// A successful discovery: the parsed settings plus a connection-capable
/// protocol descriptor for the EWS endpoint they point at.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub settings: Settings,
    pub protocol: Protocol,
}

/// The autodiscover engine.
///
/// Holds the transport and resolver for the lifetime of one or more
/// discoveries, so connections and resolver state get reused. The default
/// construction talks to the real network and the process-wide cache;
/// both seams are swappable for tests via [`with_parts`](Self::with_parts).
pub struct Autodiscovery<'a, T = ReqwestTransport, D = HickoryDns> {
    transport: T,
    dns: D,
    cache: &'a AutodiscoverCache,
    auth_type: Option<AuthType>,
    retry_policy: RetryPolicy,
    probe_retry_policy: RetryPolicy,
}

impl Autodiscovery<'static, ReqwestTransport, HickoryDns> {
    /// An engine wired to the real network and the process-wide cache.
    pub fn new() -> Result<Self, AutodiscoverError> {
        Ok(Self::with_parts(
            ReqwestTransport::new()?,
            HickoryDns::new()?,
            Lazy::force(&AUTODISCOVER_CACHE),
        ))
    }
}

impl<'a, T: HttpTransport, D: DnsLookup> Autodiscovery<'a, T, D> {
    pub fn with_parts(transport: T, dns: D, cache: &'a AutodiscoverCache) -> Self {
        Self {
            transport,
            dns,
            cache,
            auth_type: None,
            retry_policy: RetryPolicy::default(),
            // Discovery probes fail fast by default; waiting out a dead
            // candidate URL would stall every remaining step.
            probe_retry_policy: RetryPolicy::fail_fast(),
        }
    }

    /// Force this auth type onto the resolved protocol instead of
    /// auto-detection.
    pub fn requested_auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_type = Some(auth_type);
        self
    }

    /// Retry policy handed to the resolved protocol. Does not affect the
    /// discovery probes themselves.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Retry policy for the discovery probes.
    pub fn probe_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_retry_policy = policy;
        self
    }

    /// Resolve `email` to its EWS endpoint, restarting on address
    /// redirects.
    pub fn discover(
        &self,
        email: &str,
        credentials: &Credentials,
    ) -> Result<Discovered, AutodiscoverError> {
        let mut email = email.trim().to_string();
        let mut emails_visited: HashSet<String> = HashSet::new();
        loop {
            emails_visited.insert(email.to_lowercase());
            let domain = get_domain(&email)?;
            info!("Attempting autodiscover on email {email}");
            let outcome = {
                // Held for the duration of one run. Released before a
                // restart so a redirect across domains cannot wedge other
                // threads behind a chain of runs.
                let _guard = self.cache.lock_discovery();
                let mut run = Run {
                    engine: self,
                    email: &email,
                    domain: &domain,
                    credentials,
                    state: DiscoveryState::default(),
                };
                run.resolve()?
            };
            match outcome {
                Outcome::RedirectAddress(new_email) => {
                    debug!("Got a redirect address: {new_email}");
                    if emails_visited.contains(&new_email.trim().to_lowercase()) {
                        return Err(AutodiscoverError::CircularRedirect);
                    }
                    email = new_email.trim().to_string();
                }
                Outcome::Settings(settings) => {
                    return self.build_result(settings, &email, credentials)
                }
            }
        }
    }

    fn build_result(
        &self,
        mut settings: Settings,
        email: &str,
        credentials: &Credentials,
    ) -> Result<Discovered, AutodiscoverError> {
        if settings.primary_smtp_address.is_none() {
            // Not all servers report the primary address. The address we
            // asked about got a settings answer, so it is usable.
            settings.primary_smtp_address = Some(email.to_string());
        }
        let service_endpoint = Url::parse(&settings.ews_url).map_err(|e| {
            warn!("Unusable EWS URL {}: {e}", settings.ews_url);
            AutodiscoverError::Failed(email.to_string())
        })?;
        info!("Autodiscover succeeded for {email}: EWS endpoint is {service_endpoint}");
        let protocol = Protocol {
            config: Configuration {
                service_endpoint,
                credentials: credentials.clone(),
                auth_type: self.auth_type,
                version: settings.server_version.clone(),
                retry_policy: self.retry_policy.clone(),
            },
        };
        Ok(Discovered { settings, protocol })
    }
}

fn get_domain(email: &str) -> Result<String, AutodiscoverError> {
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => {
            Ok(domain.to_lowercase())
        }
        _ => Err(AutodiscoverError::InvalidEmail(email.to_string())),
    }
}

/// What one run (one email address) can produce.
enum Outcome {
    Settings(Settings),
    RedirectAddress(String),
}

/// Why the cached-endpoint fast path could not produce an outcome.
enum QuickFailure {
    /// The cached endpoint answered authoritatively; stop here.
    Fatal(AutodiscoverError),
    /// The cached endpoint is no longer usable; purge it and walk the
    /// full steps.
    Stale(String),
}

/// Guards that are scoped to one run and reset on an address redirect.
#[derive(Default)]
struct DiscoveryState {
    urls_visited: HashSet<String>,
    redirect_count: u32,
}

struct Run<'r, 'a, T, D> {
    engine: &'r Autodiscovery<'a, T, D>,
    email: &'r str,
    domain: &'r str,
    credentials: &'r Credentials,
    state: DiscoveryState,
}

impl<T: HttpTransport, D: DnsLookup> Run<'_, '_, T, D> {
    fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.domain, self.credentials)
    }

    fn resolve(&mut self) -> Result<Outcome, AutodiscoverError> {
        let key = self.cache_key();
        if let Some(entry) = self.engine.cache.lookup(&key) {
            debug!("Cache hit for {key:?}: {}", entry.endpoint);
            match self.quick(&entry) {
                Ok(outcome) => return Ok(outcome),
                Err(QuickFailure::Fatal(err)) => return Err(err),
                Err(QuickFailure::Stale(reason)) => {
                    debug!("Cached endpoint for {key:?} is stale ({reason}); purging");
                    self.engine.cache.delete(&key);
                }
            }
        }
        self.step_1()
    }

    /// Skip the steps and ask the cached endpoint directly. Only a
    /// definitive "no such mailbox" is final; anything else sends us back
    /// to the full walk.
    fn quick(&mut self, entry: &CacheEntry) -> Result<Outcome, QuickFailure> {
        let response = self
            .authenticated_probe(&entry.endpoint)
            .map_err(|e| QuickFailure::Stale(format!("response error: {e}")))?;
        if response.status != 200 {
            return Err(QuickFailure::Stale(format!(
                "invalid response code {}",
                response.status
            )));
        }
        let doc =
            parse(&response.body).map_err(|e| QuickFailure::Stale(format!("bad response: {e}")))?;
        match self.step_5(doc) {
            Ok(outcome) => Ok(outcome),
            Err(err @ AutodiscoverError::NonExistentMailbox) => Err(QuickFailure::Fatal(err)),
            Err(err) => Err(QuickFailure::Stale(err.to_string())),
        }
    }

    fn step_1(&mut self) -> Result<Outcome, AutodiscoverError> {
        let url = format!("https://{}/Autodiscover/Autodiscover.xml", self.domain);
        info!("Step 1: trying autodiscover on {url} for {}", self.email);
        match self.attempt(&url) {
            Some(doc) => self.step_5(doc),
            None => self.step_2(),
        }
    }

    fn step_2(&mut self) -> Result<Outcome, AutodiscoverError> {
        let url = format!(
            "https://autodiscover.{}/Autodiscover/Autodiscover.xml",
            self.domain
        );
        info!("Step 2: trying autodiscover on {url} for {}", self.email);
        match self.attempt(&url) {
            Some(doc) => self.step_5(doc),
            None => self.step_3(),
        }
    }

    /// An unauthenticated plain-HTTP GET, only useful for harvesting an
    /// HTTP redirect to somewhere that speaks TLS.
    fn step_3(&mut self) -> Result<Outcome, AutodiscoverError> {
        let url = format!(
            "http://autodiscover.{}/Autodiscover/Autodiscover.xml",
            self.domain
        );
        info!("Step 3: trying autodiscover on {url} for {}", self.email);
        if let Ok(from) = Url::parse(&url) {
            match self.unauthenticated_probe(&from, Method::Get) {
                Ok((_, response)) => {
                    if let Some(location) = response.redirect_location() {
                        if let Some(redirect) = self.normalized_redirect(&from, location) {
                            if self.redirect_url_is_valid(&redirect) {
                                if let Some(doc) = self.attempt(redirect.as_str()) {
                                    return self.step_5(doc);
                                }
                            } else {
                                debug!("Invalid redirect URL: {redirect}");
                            }
                        }
                    }
                }
                Err(e) => debug!("Step 3 request failed: {e}"),
            }
        }
        self.step_4()
    }

    /// SRV lookup. Only a TLS-capable record is worth following.
    fn step_4(&mut self) -> Result<Outcome, AutodiscoverError> {
        let name = format!("_autodiscover._tcp.{}", self.domain);
        info!("Step 4: trying autodiscover on {name} for {}", self.email);
        let records = self.engine.dns.srv(&name);
        let Some(record) = select_best_srv(&records) else {
            debug!("No usable SRV records for {name}");
            return self.step_6();
        };
        let url = format!("https://{}/Autodiscover/Autodiscover.xml", record.target);
        let Ok(url) = Url::parse(&url) else {
            debug!("SRV target {} does not form a URL", record.target);
            return self.step_6();
        };
        if self.redirect_url_is_valid(&url) {
            if let Some(doc) = self.attempt(url.as_str()) {
                return self.step_5(doc);
            }
        } else {
            debug!("Invalid redirect URL: {url}");
        }
        self.step_6()
    }

    /// Evaluate a well-formed response document. `redirectUrl` responses
    /// are chased here, one validated hop at a time.
    fn step_5(&mut self, mut doc: AutodiscoverResponse) -> Result<Outcome, AutodiscoverError> {
        loop {
            info!("Step 5: checking response");
            match doc {
                AutodiscoverResponse::Error { code, message } => {
                    return Err(error_from_envelope(&code, &message));
                }
                AutodiscoverResponse::RedirectAddress { email } => {
                    return Ok(Outcome::RedirectAddress(email));
                }
                AutodiscoverResponse::RedirectUrl { url } => {
                    debug!("Response requests a redirect to {url}");
                    let redirect = match Url::parse(&url) {
                        Ok(redirect) => redirect,
                        Err(e) => {
                            debug!("Unparseable redirect URL {url}: {e}");
                            return self.step_6();
                        }
                    };
                    if !self.redirect_url_is_valid(&redirect) {
                        debug!("Invalid redirect URL: {redirect}");
                        return self.step_6();
                    }
                    match self.attempt(redirect.as_str()) {
                        Some(next) => doc = next,
                        None => return self.step_6(),
                    }
                }
                AutodiscoverResponse::Settings(settings) => {
                    return Ok(Outcome::Settings(settings));
                }
            }
        }
    }

    fn step_6(&self) -> Result<Outcome, AutodiscoverError> {
        Err(AutodiscoverError::Failed(self.email.to_string()))
    }

    /// Try to get a well-formed response document from `url`: sniff the
    /// auth method with an unauthenticated POST, re-probe with credentials
    /// when the endpoint wants them, and follow validated HTTP redirects
    /// one hop at a time. A well-formed non-`redirectUrl` document marks
    /// `url` as the working endpoint for this domain and caches it.
    fn attempt(&mut self, url: &str) -> Option<AutodiscoverResponse> {
        let mut url = match Url::parse(url) {
            Ok(url) => url,
            Err(e) => {
                debug!("Unparseable URL {url}: {e}");
                return None;
            }
        };
        loop {
            self.state.urls_visited.insert(url.as_str().to_lowercase());
            debug!("Attempting to get a valid response from {url}");
            let (auth_type, response) = match self.probe(&url) {
                Ok(probed) => probed,
                Err(e) => {
                    debug!("Failed to get a response from {url}: {e}");
                    return None;
                }
            };
            if let Some(location) = response.redirect_location() {
                if let Some(redirect) = self.normalized_redirect(&url, location) {
                    if self.redirect_url_is_valid(&redirect) {
                        url = redirect;
                        continue;
                    }
                    debug!("Invalid redirect URL: {redirect}");
                }
                return None;
            }
            if response.status != 200 {
                debug!("Unexpected response status {} from {url}", response.status);
                return None;
            }
            match parse(&response.body) {
                Ok(doc) => {
                    if !doc.is_redirect_url() {
                        let key = self.cache_key();
                        debug!("Adding cache entry for {key:?}: {url}");
                        self.engine.cache.store(
                            &key,
                            CacheEntry {
                                endpoint: url,
                                auth_type: Some(auth_type),
                            },
                        );
                    }
                    return Some(doc);
                }
                Err(e) => {
                    debug!("Invalid response from {url}: {e}");
                    return None;
                }
            }
        }
    }

    fn probe(&self, url: &Url) -> Result<(AuthType, Response), TransportError> {
        let (auth_type, response) = self.unauthenticated_probe(url, Method::Post)?;
        if auth_type == AuthType::NoAuth {
            return Ok((auth_type, response));
        }
        debug!("Endpoint {url} wants {auth_type:?} auth");
        let response = self.authenticated_probe(url)?;
        Ok((auth_type, response))
    }

    /// One credential-less request, retried through transient connection
    /// errors while the probe retry policy allows it. TLS failures are
    /// persistent and never retried.
    fn unauthenticated_probe(
        &self,
        url: &Url,
        method: Method,
    ) -> Result<(AuthType, Response), TransportError> {
        let policy = &self.engine.probe_retry_policy;
        let body = (method == Method::Post).then(|| payload(self.email));
        let started = Instant::now();
        let response = loop {
            policy.back_off_if_needed();
            let request = Request {
                method,
                url: url.as_str(),
                body: body.as_deref(),
                credentials: None,
            };
            match self.engine.transport.send(request) {
                Ok(response) => break response,
                Err(err @ TransportError::Tls(_)) => return Err(err),
                Err(err @ (TransportError::Connection(_) | TransportError::Timeout(_))) => {
                    if !policy.may_retry(started.elapsed()) {
                        return Err(err);
                    }
                    debug!("Connection error on {url}: {err}. Cooling down before retrying");
                    policy.back_off(RETRY_WAIT);
                }
                Err(err) => return Err(err),
            }
        };
        Ok((auth_type_from_response(&response), response))
    }

    /// Replay the POST with the caller's credentials. Only HTTP Basic is
    /// attempted during discovery, whatever auth type was sniffed; an
    /// endpoint that insists on NTLM or Negotiate answers 401 here and is
    /// treated like any other endpoint that refuses our login. A 401 only
    /// means this is not the right endpoint for these credentials.
    fn authenticated_probe(&self, url: &Url) -> Result<Response, TransportError> {
        let body = payload(self.email);
        let request = Request {
            method: Method::Post,
            url: url.as_str(),
            body: Some(&body),
            credentials: Some(self.credentials),
        };
        let response = self.engine.transport.send(request)?;
        if response.status == 401 {
            return Err(TransportError::Unauthorized);
        }
        Ok(response)
    }

    /// Absolutize the redirect target against the URL that issued it,
    /// then canonicalize the hostname: follow its CNAME and drop a
    /// leading `www.`. A redirect that, after normalization, points back
    /// at the issuing host is going nowhere and is dropped.
    fn normalized_redirect(&self, from: &Url, location: &str) -> Option<Url> {
        let mut target = match from.join(location) {
            Ok(target) => target,
            Err(e) => {
                debug!("Unusable redirect location {location}: {e}");
                return None;
            }
        };
        let mut host = target.host_str()?.to_lowercase();
        if let Some(canonical) = self.engine.dns.cname(&host) {
            debug!("Canonical name of {host} is {canonical}");
            host = canonical.to_lowercase();
        }
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        if from.host_str().is_some_and(|h| h.eq_ignore_ascii_case(&host)) {
            debug!("Same-host redirect from {from}");
            return None;
        }
        if let Err(e) = target.set_host(Some(&host)) {
            debug!("Unusable redirect host {host}: {e}");
            return None;
        }
        Some(target)
    }

    /// Redirect targets must be new to this run, within the redirect
    /// budget, HTTPS, and actually answer on the wire.
    fn redirect_url_is_valid(&mut self, url: &Url) -> bool {
        if self
            .state
            .urls_visited
            .contains(&url.as_str().to_lowercase())
        {
            warn!("We have already tried this URL: {url}");
            return false;
        }
        if self.state.redirect_count >= MAX_REDIRECTS {
            warn!("We reached max redirects at URL {url}");
            return false;
        }
        if url.scheme() != "https" {
            debug!("Redirect URL {url} does not use TLS");
            return false;
        }
        // Quick test that the endpoint answers and the TLS handshake
        // holds up, before we commit a full POST to it.
        if let Err(e) = self.unauthenticated_probe(url, Method::Head) {
            debug!("Redirect URL {url} does not answer: {e}");
            return false;
        }
        self.state.redirect_count += 1;
        true
    }
}
