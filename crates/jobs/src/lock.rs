//! Distributed lock provider.
//!
//! Guarantees at-most-one concurrent run of a singleton job across all
//! worker processes. Acquisition never blocks: contention yields `None`.
//! TTL expiry is the crash-safety backstop; [`LockGuard`] releases on every
//! other exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use platform_core::{SharedClock, SystemClock, add_std};

/// Proof of ownership of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    /// Unique per acquisition; release and extend compare against it.
    pub token: String,
}

impl LockHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::now_v7().to_string(),
        }
    }
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take the lock if nobody holds it (or the holder's TTL ran out).
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError>;

    /// Release the lock. `false` when it had already expired or changed hands.
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Push the expiry to `now + ttl`. `false` when the lock is no longer ours.
    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError>;
}

pub type SharedLockProvider = Arc<dyn LockProvider>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend connection error: {0}")]
    Connection(String),
    #[error("lock backend command error: {0}")]
    Command(String),
}

/// Scoped lock ownership.
///
/// Call [`LockGuard::release`] on the normal path; dropping an unreleased
/// guard schedules the release on the current runtime.
pub struct LockGuard {
    provider: SharedLockProvider,
    handle: Option<LockHandle>,
    ttl: Duration,
}

impl LockGuard {
    pub async fn acquire(
        provider: SharedLockProvider,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        let handle = provider.acquire(key, ttl).await?;
        Ok(handle.map(|handle| Self {
            provider,
            handle: Some(handle),
            ttl,
        }))
    }

    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renew for another full TTL.
    pub async fn extend(&self) -> Result<bool, LockError> {
        match &self.handle {
            Some(handle) => self.provider.extend(handle, self.ttl).await,
            None => Ok(false),
        }
    }

    pub async fn release(mut self) -> Result<bool, LockError> {
        match self.handle.take() {
            Some(handle) => self.provider.release(&handle).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Outside a runtime the TTL reclaims the lock.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let provider = self.provider.clone();
            runtime.spawn(async move {
                if let Err(e) = provider.release(&handle).await {
                    tracing::warn!(key = %handle.key, error = %e, "failed to release dropped lock");
                }
            });
        }
    }
}

#[derive(Debug)]
struct HeldLock {
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-process lock table with clock-driven expiry.
#[derive(Debug)]
pub struct InMemoryLockProvider {
    clock: SharedClock,
    locks: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.locks
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|held| held.expires_at > now)
    }
}

impl Default for InMemoryLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockHandle>, LockError> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).is_some_and(|held| held.expires_at > now) {
            return Ok(None);
        }
        let handle = LockHandle::new(key);
        locks.insert(
            key.to_string(),
            HeldLock {
                token: handle.token.clone(),
                expires_at: add_std(now, ttl),
            },
        );
        Ok(Some(handle))
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&handle.key) {
            Some(held) if held.token == handle.token => {
                let live = held.expires_at > now;
                locks.remove(&handle.key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }

    async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(&handle.key) {
            Some(held) if held.token == handle.token && held.expires_at > now => {
                held.expires_at = add_std(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform_core::ManualClock;

    fn provider() -> (ManualClock, Arc<InMemoryLockProvider>) {
        let clock = ManualClock::new(Utc::now());
        let provider = Arc::new(InMemoryLockProvider::with_clock(Arc::new(clock.clone())));
        (clock, provider)
    }

    #[tokio::test]
    async fn second_acquire_is_rejected_immediately() {
        let (_, locks) = provider();
        let ttl = Duration::from_secs(5);

        let first = locks.acquire("job-lock:cleanup", ttl).await.unwrap();
        let second = locks.acquire("job-lock:cleanup", ttl).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(locks.acquire("job-lock:other", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_locks_are_reclaimable() {
        let (clock, locks) = provider();
        let ttl = Duration::from_secs(5);

        let stale = locks.acquire("k", ttl).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let fresh = locks.acquire("k", ttl).await.unwrap().unwrap();
        assert!(!locks.extend(&stale, ttl).await.unwrap());
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.is_held("k"));

        assert!(locks.release(&fresh).await.unwrap());
        assert!(!locks.is_held("k"));
    }

    #[tokio::test]
    async fn extend_pushes_expiry() {
        let (clock, locks) = provider();
        let ttl = Duration::from_secs(5);

        let handle = locks.acquire("k", ttl).await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(4));
        assert!(locks.extend(&handle, ttl).await.unwrap());
        clock.advance(chrono::Duration::seconds(4));

        assert!(locks.is_held("k"));
        assert!(locks.acquire("k", ttl).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_guard_releases_lock() {
        let (_, locks) = provider();
        let shared: SharedLockProvider = locks.clone();

        let guard = LockGuard::acquire(shared.clone(), "k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(LockGuard::acquire(shared.clone(), "k", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        drop(guard);
        for _ in 0..10 {
            if !locks.is_held("k") {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!locks.is_held("k"));
    }
}
