//! Endpoint selection: primary host, shuffled fallback order, and caching of
//! a known-good fallback.
//!
//! Two instances exist per client, one for REST and one for realtime, sharing
//! the same candidate semantics. The realtime side mirrors its active host
//! into the REST router so REST requests follow the live connection.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::options::ClientOptions;

pub(crate) struct Hosts {
    primary: String,
    /// Shuffled once at construction; iteration order within a retry cycle is
    /// fixed.
    fallbacks: Vec<String>,
    visited: HashSet<String>,
    cached: Option<CachedHost>,
    /// Active realtime host mirrored in by the connection.
    primary_fallback: Option<String>,
    fallback_retry_timeout: Duration,
}

struct CachedHost {
    host: String,
    expires_at: Instant,
}

impl Hosts {
    pub fn rest(opts: &ClientOptions) -> Self {
        Self::new(opts.primary_rest_host(), opts)
    }

    pub fn realtime(opts: &ClientOptions) -> Self {
        Self::new(opts.primary_realtime_host(), opts)
    }

    fn new(primary: String, opts: &ClientOptions) -> Self {
        let mut fallbacks = opts.fallback_host_list();
        fallbacks.shuffle(&mut rand::thread_rng());
        Hosts {
            primary,
            fallbacks,
            visited: HashSet::new(),
            cached: None,
            primary_fallback: None,
            fallback_retry_timeout: opts.fallback_retry_timeout,
        }
    }

    pub fn primary_host(&self) -> &str {
        &self.primary
    }

    /// The host to try first: a cached known-good fallback while its expiry
    /// has not passed, else the mirrored realtime host, else the primary.
    pub fn preferred_host(&mut self) -> String {
        self.expire_cache();
        let host = match (&self.cached, &self.primary_fallback) {
            (Some(cached), _) => cached.host.clone(),
            (None, Some(host)) => host.clone(),
            (None, None) => self.primary.clone(),
        };
        self.visited.insert(host.clone());
        host
    }

    /// The next unvisited candidate, or `None` once the cycle is exhausted.
    /// The primary participates in the cycle unless it was already handed out
    /// as the preferred host.
    pub fn fallback_host(&mut self) -> Option<String> {
        let next = std::iter::once(&self.primary)
            .chain(self.fallbacks.iter())
            .find(|h| !self.visited.contains(h.as_str()))
            .cloned()?;
        self.visited.insert(next.clone());
        Some(next)
    }

    /// Number of candidates not yet tried in this cycle.
    pub fn fallback_hosts_remaining(&self) -> usize {
        std::iter::once(&self.primary)
            .chain(self.fallbacks.iter())
            .filter(|h| !self.visited.contains(h.as_str()))
            .count()
    }

    /// Start a fresh cycle after a successful exchange with the primary.
    pub fn reset_visited(&mut self) {
        self.visited.clear();
    }

    /// Record a successful exchange with a non-primary candidate; it becomes
    /// the preferred host until the expiry passes.
    pub fn cache_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if host == self.primary {
            self.cached = None;
            return;
        }
        self.cached = Some(CachedHost {
            host,
            expires_at: Instant::now() + self.fallback_retry_timeout,
        });
    }

    pub fn cached_host(&mut self) -> Option<&str> {
        self.expire_cache();
        self.cached.as_ref().map(|c| c.host.as_str())
    }

    /// Used by the realtime connection to share its active host with the REST
    /// router.
    pub fn set_primary_fallback_host(&mut self, host: impl Into<String>) {
        self.primary_fallback = Some(host.into());
    }

    fn expire_cache(&mut self) {
        if let Some(cached) = &self.cached {
            if Instant::now() >= cached.expires_at {
                self.cached = None;
            }
        }
    }
}
