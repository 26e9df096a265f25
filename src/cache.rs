//! Two-tier autodiscover endpoint cache.
//!
//! Resolving an endpoint costs several DNS queries and HTTP probes, so the
//! result is cached per `(domain, credentials)`: once in memory and once in
//! a JSON file shared between processes. The persisted layer stores only
//! domain, endpoint URL and auth type; credentials never hit disk.
//!
//! The cache also owns the process-wide discovery lock. The lock serializes
//! the entire cache-check-and-resolve decision, not just map access, and
//! must never be held across an email-redirect restart.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::credentials::Credentials;
use crate::transport::AuthType;

/// The process-wide cache used by [`discover`](crate::discover).
pub(crate) static AUTODISCOVER_CACHE: Lazy<AutodiscoverCache> =
    Lazy::new(|| AutodiscoverCache::new(default_store_path()));

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    domain: String,
    credentials: Credentials,
}

impl CacheKey {
    pub fn new(domain: impl Into<String>, credentials: &Credentials) -> Self {
        Self {
            domain: domain.into(),
            credentials: credentials.clone(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// A resolved autodiscover service endpoint for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub endpoint: Url,
    pub auth_type: Option<AuthType>,
}

/// What the persisted layer stores per domain. No credential material.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    endpoint: String,
    auth_type: Option<AuthType>,
}

pub struct AutodiscoverCache {
    discovery_lock: Mutex<()>,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    store_path: PathBuf,
}

impl AutodiscoverCache {
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            discovery_lock: Mutex::new(()),
            entries: Mutex::new(HashMap::new()),
            store_path,
        }
    }

    /// Acquire the discovery lock. The guard must be dropped before any
    /// restart with a redirected email address.
    pub fn lock_discovery(&self) -> MutexGuard<'_, ()> {
        debug!("Waiting for autodiscover cache lock");
        let guard = self
            .discovery_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        debug!("Autodiscover cache lock acquired");
        guard
    }

    /// Memory first, then the persisted layer. A persisted hit is
    /// rehydrated into memory bound to this key's credentials.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(key) {
                return Some(entry.clone());
            }
        }
        let store = self.read_store();
        let persisted = store.get(key.domain())?;
        let endpoint = match Url::parse(&persisted.endpoint) {
            Ok(url) => url,
            Err(e) => {
                debug!("Dropping unusable persisted entry for {}: {e}", key.domain());
                return None;
            }
        };
        let entry = CacheEntry {
            endpoint,
            auth_type: persisted.auth_type,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), entry.clone());
        Some(entry)
    }

    /// Write through to both layers.
    pub fn store(&self, key: &CacheKey, entry: CacheEntry) {
        let mut store = self.read_store();
        store.insert(
            key.domain().to_string(),
            PersistedEntry {
                endpoint: entry.endpoint.to_string(),
                auth_type: entry.auth_type,
            },
        );
        self.write_store(&store);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), entry);
    }

    /// Remove from both layers. Discovery may race and delete the same key
    /// twice, so deleting an absent key is fine.
    pub fn delete(&self, key: &CacheKey) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(key);
        }
        let mut store = self.read_store();
        if store.remove(key.domain()).is_some() {
            self.write_store(&store);
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(key) {
            return true;
        }
        drop(entries);
        self.read_store().contains_key(key.domain())
    }

    /// Wipe both layers.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        drop(entries);
        if let Err(e) = fs::remove_file(&self.store_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove cache store {}: {e}", self.store_path.display());
            }
        }
    }

    /// Drop all in-memory entries, releasing any live connections they
    /// hold. The persisted layer is left intact.
    pub fn close(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    /// Read the persisted layer. The file is shared between processes and
    /// a crashed writer may leave it corrupt; in that case it is deleted
    /// and recreated empty instead of failing the caller.
    fn read_store(&self) -> HashMap<String, PersistedEntry> {
        let bytes = match fs::read(&self.store_path) {
            Ok(bytes) => bytes,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    "Autodiscover cache store {} is unreadable ({e}), recreating",
                    self.store_path.display()
                );
                let _ = fs::remove_file(&self.store_path);
                HashMap::new()
            }
        }
    }

    /// Storage failures are logged, never surfaced: the persisted layer is
    /// an optimization.
    fn write_store(&self, store: &HashMap<String, PersistedEntry>) {
        let bytes = match serde_json::to_vec(store) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Could not serialize cache store: {e}");
                return;
            }
        };
        if let Err(e) = fs::write(&self.store_path, bytes) {
            debug!("Could not write cache store {}: {e}", self.store_path.display());
        }
    }
}

/// The store file lives in the shared temp directory, namespaced per OS
/// user and per crate major version to avoid cross-version format issues.
fn default_store_path() -> PathBuf {
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into());
    let major = env!("CARGO_PKG_VERSION_MAJOR");
    env::temp_dir().join(format!("ews-autodiscover.cache.{user}.v{major}.json"))
}
