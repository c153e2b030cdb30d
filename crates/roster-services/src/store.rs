//! Registry stores — the shared key-value backend for registry discovery.
//!
//! The registry transport needs set with expiry, get (with time left), and glob-prefix key
//! listing, plus connect/ping for its watchdog. [`RedisStore`] is the
//! production backend; [`MemoryStore`] serves single-host setups and tests.
//!
//! Stores do not time out on their own and do not track readiness. The
//! transport wraps every call in a timeout and owns the ready flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::time::Instant;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Establish (or re-establish) the backend connection.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Cheap liveness probe on the current connection.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Write `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Value under `key` and the time it has left before expiring. A key
    /// without expiry reports `Duration::MAX`.
    async fn get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>, StoreError>;

    /// Keys matching a glob. Only a trailing `*` is guaranteed to be
    /// understood by every backend.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Short label for logs, e.g. `redis://10.0.0.1:6379/0`.
    fn describe(&self) -> String;
}

// ── Redis ─────────────────────────────────────────────────────────────────────

/// Redis-backed store. One multiplexed connection shared by all callers.
pub struct RedisStore {
    client: redis::Client,
    url: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Parse the URL. Does not connect; call [`RegistryStore::connect`].
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            url: url.to_string(),
            conn: Mutex::new(None),
        })
    }

    /// Clone of the current connection. Multiplexed connections are cheap
    /// to clone and every clone shares the same socket.
    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?
            .clone()
            .ok_or(StoreError::NotReady)
    }
}

#[async_trait]
impl RegistryStore for RedisStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        *self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))? = Some(conn);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>, StoreError> {
        let mut conn = self.connection()?;
        let (value, pttl) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async::<_, (Option<String>, i64)>(&mut conn)
            .await?;
        // PTTL: -1 no expiry, -2 gone since the GET.
        Ok(match (value, pttl) {
            (Some(v), ms) if ms >= 0 => Some((v, Duration::from_millis(ms as u64))),
            (Some(v), -1) => Some((v, Duration::MAX)),
            _ => None,
        })
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection()?;
        Ok(redis::cmd("KEYS")
            .arg(pattern)
            .query_async::<_, Vec<String>>(&mut conn)
            .await?)
    }

    fn describe(&self) -> String {
        // Strip credentials before this reaches a log line.
        match self.url.split_once('@') {
            Some((scheme_and_auth, host)) => {
                let scheme = scheme_and_auth.split("://").next().unwrap_or("redis");
                format!("{scheme}://{host}")
            }
            None => self.url.clone(),
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

/// Process-local store with per-key expiry.
///
/// Clones share the same data, so several discovery instances in one
/// process see each other. [`set_available`](Self::set_available) simulates
/// a backend outage.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, (String, Instant)>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle the simulated backend. While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Glob match supporting `*` (any run) and `?` (one char).
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.value().1 > now)
            .map(|e| e.value().0.clone()))
    }

    async fn get_with_expiry(&self, key: &str) -> Result<Option<(String, Duration)>, StoreError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.value().1 > now)
            .map(|e| (e.value().0.clone(), e.value().1 - now)))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
        Ok(self
            .entries
            .iter()
            .filter(|e| glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    #[error("registry connection not ready")]
    NotReady,

    #[error("redis: {0}")]
    Backend(#[from] redis::RedisError),
}
