//! Per-issuer JWKS cache with refresh, staleness, and degradation policy.
//!
//! # Architecture
//!
//! ```text
//! token arrives → extract iss, kid
//!               → check decoded-key layer (L1, bounded TTL)
//!               → read persisted entry from the JwksStore
//!               → entry missing or past next_update_at?
//!                   → serialize on the per-issuer refresh lock,
//!                     fetch via the JwksFetcher, persist on success,
//!                     degrade to the cached entry on failure
//!               → entry past expires_at? treat as empty key set
//!               → find key by kid, convert JWK → DecodingKey, cache in L1
//! ```
//!
//! # Cache strategy
//!
//! - Persisted entries expire after [`crate::jwks::DEFAULT_JWKS_EXPIRY_SECS`]
//!   and become due for refresh after
//!   [`crate::jwks::DEFAULT_JWKS_NEXT_UPDATE_SECS`]; both computed
//!   at fetch/set time (there are no cache-control directives to trust).
//! - [`JwksCache::get_cached_jwks`] never fetches and never waits on an
//!   in-flight refresh — staleness is visible as an empty key set, not an
//!   error.
//! - Fetch failures during key resolution degrade to whatever is cached
//!   (possibly nothing); the only error the enclosing validation sees is
//!   [`SciTokenError::KeyNotFound`] if no usable key remains.
//! - Refreshes for the same issuer serialize on a per-issuer async lock;
//!   unrelated issuers never block each other.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey};
use moka::future::Cache;
use parking_lot::{Mutex, RwLock};

use crate::{
    error::{Result, SciTokenError},
    jwks::{Jwks, JwksCacheEntry, decoding_key_from_jwk},
};

/// Default TTL for the in-memory decoded-key layer (5 minutes).
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(300);

/// Default maximum capacity of the in-memory decoded-key layer.
pub const DEFAULT_KEY_CAPACITY: u64 = 1_000;

/// Default bound on a single JWKS fetch (10 seconds). A timeout is an
/// ordinary fetch failure — stale/empty cache fallback, never fatal.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistence capability for JWKS cache entries.
///
/// Implementations store one entry per issuer. Production deployments use
/// [`FileJwksStore`] with a principal-scoped root so distinct operating
/// system principals never share cache state; tests use
/// [`MemoryJwksStore`].
#[async_trait]
pub trait JwksStore: Send + Sync {
    /// Reads the entry for an issuer, if one exists.
    async fn get(&self, issuer: &str) -> Result<Option<JwksCacheEntry>>;

    /// Writes (or replaces) the entry for `entry.issuer`.
    async fn put(&self, entry: &JwksCacheEntry) -> Result<()>;

    /// Removes the entry for an issuer. Removing a missing entry is not an
    /// error.
    async fn remove(&self, issuer: &str) -> Result<()>;
}

/// Network capability for retrieving an issuer's current JWKS.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    /// Fetches the issuer's published key set.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] on any transport, timeout, or
    /// document failure. The cache treats every fetch error identically.
    async fn fetch(&self, issuer: &str) -> Result<Jwks>;
}

/// In-memory [`JwksStore`] for tests and short-lived processes.
#[derive(Default)]
pub struct MemoryJwksStore {
    entries: RwLock<HashMap<String, JwksCacheEntry>>,
}

impl MemoryJwksStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JwksStore for MemoryJwksStore {
    async fn get(&self, issuer: &str) -> Result<Option<JwksCacheEntry>> {
        Ok(self.entries.read().get(issuer).cloned())
    }

    async fn put(&self, entry: &JwksCacheEntry) -> Result<()> {
        self.entries.write().insert(entry.issuer.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, issuer: &str) -> Result<()> {
        self.entries.write().remove(issuer);
        Ok(())
    }
}

/// File-backed [`JwksStore`]: one JSON document per issuer under a
/// configured root directory.
///
/// Entries survive process restarts. Writes go through a temp file and
/// rename so a crashed process never leaves a torn entry behind. The root
/// must be scoped to the invoking principal — use
/// [`for_current_user`](Self::for_current_user) unless the caller has its
/// own isolation scheme.
pub struct FileJwksStore {
    root: PathBuf,
}

impl FileJwksStore {
    /// Creates a store rooted at `root`. The directory is created lazily on
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates a store under the current user's cache directory
    /// (`$XDG_CACHE_HOME/scitokens` or `$HOME/.cache/scitokens`), so two
    /// principals on the same host never observe each other's entries.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] if neither `XDG_CACHE_HOME` nor
    /// `HOME` is set.
    pub fn for_current_user() -> Result<Self> {
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .ok_or_else(|| {
                SciTokenError::cache_io("cannot locate a per-user cache directory: neither XDG_CACHE_HOME nor HOME is set")
            })?;
        Ok(Self::new(base.join("scitokens")))
    }

    fn path_for(&self, issuer: &str) -> PathBuf {
        // Issuers are URLs; encode to get a flat, collision-free filename.
        self.root.join(format!("{}.json", URL_SAFE_NO_PAD.encode(issuer)))
    }
}

#[async_trait]
impl JwksStore for FileJwksStore {
    async fn get(&self, issuer: &str) -> Result<Option<JwksCacheEntry>> {
        let path = self.path_for(issuer);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SciTokenError::cache_io(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            },
        };
        let entry = serde_json::from_slice(&contents).map_err(|e| {
            SciTokenError::cache_io(format!("corrupt cache entry {}: {e}", path.display()))
        })?;
        Ok(Some(entry))
    }

    async fn put(&self, entry: &JwksCacheEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SciTokenError::cache_io(format!("creating cache root: {e}")))?;

        let path = self.path_for(&entry.issuer);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec(entry)
            .map_err(|e| SciTokenError::cache_io(format!("encoding cache entry: {e}")))?;

        tokio::fs::write(&tmp, &contents)
            .await
            .map_err(|e| SciTokenError::cache_io(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SciTokenError::cache_io(format!("committing {}: {e}", path.display())))
    }

    async fn remove(&self, issuer: &str) -> Result<()> {
        let path = self.path_for(issuer);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(SciTokenError::cache_io(format!("removing {}: {err}", path.display())))
            },
        }
    }
}

/// HTTP [`JwksFetcher`] using OIDC discovery.
///
/// Resolves `{issuer}/.well-known/openid-configuration`, follows the
/// advertised `jwks_uri`, and parses the key set. Every request is bounded
/// by the configured timeout.
pub struct HttpJwksFetcher {
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Creates a fetcher with [`DEFAULT_FETCH_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] if the HTTP client cannot be
    /// constructed.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    /// Creates a fetcher with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] if the HTTP client cannot be
    /// constructed.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SciTokenError::cache_io(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| SciTokenError::cache_io(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| SciTokenError::cache_io(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| SciTokenError::cache_io(format!("decoding {url}: {e}")))
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, issuer: &str) -> Result<Jwks> {
        let discovery_url =
            format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'));
        let discovery = self.get_json(&discovery_url).await?;

        let jwks_uri = discovery
            .get("jwks_uri")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                SciTokenError::cache_io(format!(
                    "discovery document at {discovery_url} has no jwks_uri"
                ))
            })?;

        let document = self.get_json(jwks_uri).await?;
        let jwks: Jwks = serde_json::from_value(document)
            .map_err(|e| SciTokenError::cache_io(format!("invalid JWKS from {jwks_uri}: {e}")))?;

        tracing::debug!(issuer, keys = jwks.keys.len(), "fetched JWKS");
        Ok(jwks)
    }
}

/// Process-wide JWKS cache: persisted per-issuer entries plus a bounded
/// in-memory decoded-key layer.
///
/// The cache is an explicitly constructed, injectable service — tests
/// supply isolated [`MemoryJwksStore`]/mock-fetcher instances, production
/// wires a [`FileJwksStore`] and [`HttpJwksFetcher`].
///
/// # Concurrency
///
/// Safe to share behind `Arc` across tasks. Refreshes for one issuer
/// serialize on a per-issuer async lock; [`get_cached_jwks`](Self::get_cached_jwks)
/// takes no lock and observes whatever is durably committed at call time.
pub struct JwksCache {
    store: Arc<dyn JwksStore>,
    fetcher: Arc<dyn JwksFetcher>,
    /// Decoded verification keys, keyed `{generation}:{alg}:{issuer}:{kid}`.
    decoded: Cache<String, Arc<DecodingKey>>,
    /// Per-issuer refresh locks; the outer map lock is never held across
    /// await. Entries are removed once no task holds them, so the map is
    /// bounded by in-flight refreshes, not by issuers ever seen.
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Per-issuer generation counters, bumped on refresh/set so the decoded
    /// layer can never shadow an explicit update. One word per issuer ever
    /// seen; counters are never evicted because a counter reset could
    /// collide with decoded-layer entries still inside their TTL.
    generations: Mutex<HashMap<String, u64>>,
}

impl JwksCache {
    /// Creates a cache over the given persistence and fetch capabilities,
    /// with default decoded-key TTL and capacity.
    #[must_use]
    pub fn new(store: Arc<dyn JwksStore>, fetcher: Arc<dyn JwksFetcher>) -> Self {
        Self::with_key_ttl(store, fetcher, DEFAULT_KEY_TTL, DEFAULT_KEY_CAPACITY)
    }

    /// Creates a cache with a custom decoded-key layer TTL and capacity.
    #[must_use]
    pub fn with_key_ttl(
        store: Arc<dyn JwksStore>,
        fetcher: Arc<dyn JwksFetcher>,
        key_ttl: Duration,
        key_capacity: u64,
    ) -> Self {
        Self {
            store,
            fetcher,
            decoded: Cache::builder().time_to_live(key_ttl).max_capacity(key_capacity).build(),
            refresh_locks: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
        }
    }

    fn generation(&self, issuer: &str) -> u64 {
        self.generations.lock().get(issuer).copied().unwrap_or(0)
    }

    fn bump_generation(&self, issuer: &str) {
        *self.generations.lock().entry(issuer.to_owned()).or_insert(0) += 1;
    }

    fn refresh_lock(&self, issuer: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.refresh_locks
                .lock()
                .entry(issuer.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drops an issuer's refresh lock entry once no task holds it.
    fn release_refresh_lock(&self, issuer: &str) {
        let mut locks = self.refresh_locks.lock();
        if locks.get(issuer).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(issuer);
        }
    }

    /// Unconditionally fetches and replaces the cache entry for an issuer.
    ///
    /// Concurrent refreshes for the same issuer serialize; unrelated
    /// issuers proceed independently.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] if the fetch or the persistence
    /// write fails. On failure the prior entry, if any, is left untouched.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_jwks(&self, issuer: &str) -> Result<()> {
        let lock = self.refresh_lock(issuer);
        let result = async {
            let _guard = lock.lock().await;

            let jwks = self.fetcher.fetch(issuer).await?;
            let entry = JwksCacheEntry::fresh(issuer, jwks, Utc::now());
            self.store.put(&entry).await?;
            self.bump_generation(issuer);

            tracing::debug!(issuer, keys = entry.jwks.keys.len(), "refreshed JWKS cache entry");
            Ok(())
        }
        .await;

        drop(lock);
        self.release_refresh_lock(issuer);
        result
    }

    /// Returns the cached key set for an issuer, without any network I/O.
    ///
    /// An absent or expired entry is reported as a key set with zero keys
    /// — staleness is never an error. This call does not wait on in-flight
    /// refreshes; it observes whatever is durably committed.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] only if the persistence read
    /// itself fails.
    pub async fn get_cached_jwks(&self, issuer: &str) -> Result<Jwks> {
        let now = Utc::now();
        Ok(self
            .store
            .get(issuer)
            .await?
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.jwks)
            .unwrap_or_else(Jwks::empty))
    }

    /// Replaces the cache entry for an issuer with a caller-supplied key
    /// set.
    ///
    /// The entry's lifetime follows the standard directive-less policy, as
    /// if it had been freshly fetched from the issuer.
    ///
    /// # Errors
    ///
    /// Returns [`SciTokenError::CacheIo`] if the persistence write fails.
    #[tracing::instrument(skip(self, jwks))]
    pub async fn set_jwks(&self, issuer: &str, jwks: Jwks) -> Result<()> {
        let entry = JwksCacheEntry::fresh(issuer, jwks, Utc::now());
        self.store.put(&entry).await?;
        self.bump_generation(issuer);
        Ok(())
    }

    /// Resolves a verification key for `issuer` + `kid`, refreshing the
    /// cache entry first if it is missing or due for an update.
    ///
    /// A fetch failure degrades to the cached entry (possibly empty); the
    /// caller only ever sees [`SciTokenError::KeyNotFound`] when no usable
    /// key remains.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn resolve_key(
        &self,
        issuer: &str,
        kid: Option<&str>,
        algorithm: Algorithm,
    ) -> Result<Arc<DecodingKey>> {
        let l1_key = |generation: u64| {
            format!("{generation}:{algorithm:?}:{issuer}:{}", kid.unwrap_or("*"))
        };

        if let Some(key) = self.decoded.get(&l1_key(self.generation(issuer))).await {
            tracing::debug!(cache = "decoded", "cache hit");
            return Ok(key);
        }

        let now = Utc::now();
        let mut entry = match self.store.get(issuer).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(issuer, error = %err, "cache read failed during key resolution");
                None
            },
        };

        if entry.as_ref().is_none_or(|e| e.needs_update(now)) {
            let lock = self.refresh_lock(issuer);
            {
                let _guard = lock.lock().await;

                // Another task may have refreshed while we waited on the lock.
                if let Ok(Some(fresh)) = self.store.get(issuer).await {
                    entry = Some(fresh);
                }

                if entry.as_ref().is_none_or(|e| e.needs_update(now)) {
                    match self.fetcher.fetch(issuer).await {
                        Ok(jwks) => {
                            let fresh = JwksCacheEntry::fresh(issuer, jwks, now);
                            if let Err(err) = self.store.put(&fresh).await {
                                tracing::warn!(issuer, error = %err, "failed to persist refreshed JWKS");
                            }
                            self.bump_generation(issuer);
                            entry = Some(fresh);
                        },
                        Err(err) => {
                            tracing::warn!(
                                issuer,
                                error = %err,
                                "JWKS refresh failed; falling back to cached keys"
                            );
                        },
                    }
                }
            }
            drop(lock);
            self.release_refresh_lock(issuer);
        }

        let jwks = entry
            .filter(|e| !e.is_expired(now))
            .map(|e| e.jwks)
            .unwrap_or_else(Jwks::empty);

        for candidate in jwks.candidates(kid) {
            match decoding_key_from_jwk(candidate, algorithm) {
                Ok(key) => {
                    let key = Arc::new(key);
                    self.decoded.insert(l1_key(self.generation(issuer)), Arc::clone(&key)).await;
                    return Ok(key);
                },
                Err(err) => {
                    tracing::debug!(issuer, error = %err, "skipping unusable JWKS candidate");
                },
            }
        }

        Err(SciTokenError::key_not_found(kid.unwrap_or("<any>")))
    }

    /// Synchronizes pending decoded-layer operations.
    ///
    /// Call before asserting on cache state in tests.
    #[cfg(test)]
    pub(crate) async fn sync(&self) {
        self.decoded.run_pending_tasks().await;
    }

    #[cfg(test)]
    pub(crate) fn refresh_lock_count(&self) -> usize {
        self.refresh_locks.lock().len()
    }
}
