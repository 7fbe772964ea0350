//! Conversation → sandbox session registry.
//!
//! Each conversation owns at most one live sandbox. Entries are extended on
//! every reuse and torn down by a periodic sweep once they go idle for longer
//! than the configured session timeout.
//!
//! Every conversation has its own slot lock, so an `acquire`, a `release` and
//! the sweep never interleave on the same entry. The map lock is only held for
//! lookups and is never held across an await on a slot.

use crate::{
    config::SessionConfig,
    engine::{SandboxHandle, SandboxProvider},
    errors::{Result, SandboxError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Read-only view of a conversation's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
}

impl SessionStatus {
    fn absent() -> Self {
        Self {
            exists: false,
            expires_in_ms: None,
            sandbox_id: None,
        }
    }
}

struct SessionEntry {
    handle: SandboxHandle,
    expires_at: Instant,
}

impl SessionEntry {
    fn is_reusable(&self, now: Instant) -> bool {
        self.expires_at > now && self.handle.sandbox().is_alive()
    }
}

type Slot = Arc<Mutex<Option<SessionEntry>>>;

pub struct SessionRegistry {
    provider: Arc<dyn SandboxProvider>,
    config: SessionConfig,
    slots: Mutex<HashMap<String, Slot>>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionRegistry {
    /// Create a registry without a background sweep
    pub fn new(provider: Arc<dyn SandboxProvider>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            slots: Mutex::new(HashMap::new()),
            sweeper: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a registry and start its periodic sweep on the current runtime
    pub fn init(provider: Arc<dyn SandboxProvider>, config: SessionConfig) -> Arc<Self> {
        let registry = Arc::new(Self::new(provider, config));
        let task = tokio::spawn(sweep_loop(
            Arc::downgrade(&registry),
            registry.config.sweep_interval,
        ));
        if let Ok(mut sweeper) = registry.sweeper.lock() {
            *sweeper = Some(task);
        }
        info!(
            "[REGISTRY] Started with provider '{}' (timeout={:?}, sweep every {:?})",
            registry.provider.name(),
            registry.config.session_timeout,
            registry.config.sweep_interval
        );
        registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return the conversation's sandbox, creating one if none is live.
    ///
    /// Reuse extends the expiry to `now + session_timeout`. A provisioning
    /// failure is returned as [`SandboxError::Provisioning`] and leaves no entry,
    /// as is any call made after [`shutdown`](Self::shutdown).
    pub async fn acquire(&self, conversation_id: &str) -> Result<SandboxHandle> {
        loop {
            if self.is_closed() {
                return Err(shut_down());
            }
            let slot = self.slot_for(conversation_id).await;
            let mut entry = slot.lock().await;

            if self.is_closed() {
                self.unregister(conversation_id, &slot).await;
                return Err(shut_down());
            }

            // The sweep may have dropped this slot while we waited on it
            if !self.is_registered(conversation_id, &slot).await {
                continue;
            }

            let now = Instant::now();
            if let Some(current) = entry.as_mut() {
                if current.is_reusable(now) {
                    current.expires_at = now + self.config.session_timeout;
                    debug!(
                        "[REGISTRY] Reusing sandbox {} for conversation {}",
                        current.handle.id(),
                        conversation_id
                    );
                    return Ok(current.handle.clone());
                }
            }

            if let Some(stale) = entry.take() {
                info!(
                    "[REGISTRY] Replacing stale sandbox {} for conversation {}",
                    stale.handle.id(),
                    conversation_id
                );
                teardown(conversation_id, &stale.handle).await;
            }

            info!(
                "[REGISTRY] Creating sandbox for conversation {} via {}",
                conversation_id,
                self.provider.name()
            );
            let created =
                tokio::time::timeout(self.config.provisioning_timeout, self.provider.create())
                    .await;
            let sandbox = match created {
                Ok(Ok(sandbox)) => sandbox,
                Ok(Err(e)) => {
                    self.unregister(conversation_id, &slot).await;
                    warn!(
                        "[REGISTRY] Provisioning failed for conversation {}: {}",
                        conversation_id, e
                    );
                    return Err(match e {
                        SandboxError::Provisioning(msg) => SandboxError::Provisioning(msg),
                        other => SandboxError::Provisioning(other.to_string()),
                    });
                }
                Err(_) => {
                    self.unregister(conversation_id, &slot).await;
                    return Err(SandboxError::Provisioning(format!(
                        "sandbox creation timed out after {:?}",
                        self.config.provisioning_timeout
                    )));
                }
            };

            let handle = SandboxHandle::new(sandbox);
            if self.is_closed() {
                self.unregister(conversation_id, &slot).await;
                teardown(conversation_id, &handle).await;
                return Err(shut_down());
            }
            *entry = Some(SessionEntry {
                handle: handle.clone(),
                expires_at: Instant::now() + self.config.session_timeout,
            });
            info!(
                "[REGISTRY] Sandbox {} ready for conversation {}",
                handle.id(),
                conversation_id
            );
            return Ok(handle);
        }
    }

    /// Tear down the conversation's sandbox now. Absent entries are a no-op.
    pub async fn release(&self, conversation_id: &str) {
        let slot = self.slots.lock().await.get(conversation_id).cloned();
        let Some(slot) = slot else {
            return;
        };

        let mut entry = slot.lock().await;
        let taken = entry.take();
        self.unregister(conversation_id, &slot).await;
        drop(entry);

        if let Some(session) = taken {
            info!(
                "[REGISTRY] Releasing sandbox {} for conversation {}",
                session.handle.id(),
                conversation_id
            );
            teardown(conversation_id, &session.handle).await;
        }
    }

    /// Status probe; never extends the expiry.
    pub async fn describe(&self, conversation_id: &str) -> SessionStatus {
        let slot = self.slots.lock().await.get(conversation_id).cloned();
        let Some(slot) = slot else {
            return SessionStatus::absent();
        };

        let entry = slot.lock().await;
        match entry.as_ref() {
            Some(session) => {
                let remaining = session
                    .expires_at
                    .saturating_duration_since(Instant::now());
                SessionStatus {
                    exists: true,
                    expires_in_ms: Some(remaining.as_millis() as u64),
                    sandbox_id: Some(session.handle.id().to_string()),
                }
            }
            None => SessionStatus::absent(),
        }
    }

    /// Tear down every expired or dead entry; returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let snapshot: Vec<(String, Slot)> = self
            .slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut removed = 0;
        for (conversation_id, slot) in snapshot {
            let mut entry = slot.lock().await;
            let now = Instant::now();
            let expired = match entry.as_ref() {
                Some(session) => !session.is_reusable(now),
                None => true,
            };
            if !expired {
                continue;
            }

            let taken = entry.take();
            self.unregister(&conversation_id, &slot).await;
            drop(entry);

            if let Some(session) = taken {
                teardown(&conversation_id, &session.handle).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("[REGISTRY] Swept {} expired session(s)", removed);
        }
        removed
    }

    /// Number of conversations currently holding a sandbox
    pub async fn active_count(&self) -> usize {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Stop the sweep and tear down every sandbox. Later `acquire` calls fail.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(task) = sweeper.take() {
                task.abort();
            }
        }

        let drained: Vec<(String, Slot)> = self.slots.lock().await.drain().collect();
        info!("[REGISTRY] Shutting down {} session(s)", drained.len());

        let teardowns = drained.into_iter().map(|(conversation_id, slot)| async move {
            let taken = slot.lock().await.take();
            if let Some(session) = taken {
                teardown(&conversation_id, &session.handle).await;
            }
        });
        futures::future::join_all(teardowns).await;
    }

    #[cfg(test)]
    pub(crate) async fn expires_at(&self, conversation_id: &str) -> Option<Instant> {
        let slot = self.slots.lock().await.get(conversation_id).cloned()?;
        let entry = slot.lock().await;
        entry.as_ref().map(|session| session.expires_at)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn slot_for(&self, conversation_id: &str) -> Slot {
        self.slots
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    async fn is_registered(&self, conversation_id: &str, slot: &Slot) -> bool {
        self.slots
            .lock()
            .await
            .get(conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop the map entry if it still points at `slot`. Call with the slot locked.
    async fn unregister(&self, conversation_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        if slots
            .get(conversation_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(conversation_id);
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(task) = sweeper.take() {
                task.abort();
            }
        }
    }
}

async fn sweep_loop(registry: Weak<SessionRegistry>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.sweep_expired().await;
    }
}

fn shut_down() -> SandboxError {
    SandboxError::Provisioning("registry shut down".to_string())
}

/// Kill a sandbox; failures are logged and swallowed.
async fn teardown(conversation_id: &str, handle: &SandboxHandle) {
    match handle.sandbox().kill().await {
        Ok(()) => info!(
            "[REGISTRY] Sandbox {} for conversation {} terminated",
            handle.id(),
            conversation_id
        ),
        Err(e) => warn!(
            "[REGISTRY] Failed to terminate sandbox {} for conversation {}: {}",
            handle.id(),
            conversation_id,
            e
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Sandbox;
    use crate::testing::FakeProvider;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    fn registry(provider: &Arc<FakeProvider>) -> SessionRegistry {
        SessionRegistry::new(provider.clone(), SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_extends_expiry() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        let first = registry.acquire("c1").await.unwrap();
        let first_expiry = registry.expires_at("c1").await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = registry.acquire("c1").await.unwrap();
        let second_expiry = registry.expires_at("c1").await.unwrap();

        assert!(first.same_sandbox(&second));
        assert_eq!(first.id(), second.id());
        assert!(second_expiry >= first_expiry + Duration::from_secs(30));
        assert_eq!(provider.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_gets_new_sandbox() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        let first = registry.acquire("c1").await.unwrap();
        tokio::time::advance(2 * HOUR + Duration::from_secs(1)).await;
        let second = registry.acquire("c1").await.unwrap();

        assert!(!first.same_sandbox(&second));
        assert_ne!(first.id(), second.id());
        assert!(provider.sandbox(0).is_killed());
        assert_eq!(provider.created_count(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        registry.acquire("c1").await.unwrap();
        registry.release("c1").await;
        registry.release("c1").await;
        registry.release("never-seen").await;

        assert!(provider.sandbox(0).is_killed());
        assert!(!registry.describe("c1").await.exists);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_swallows_teardown_failure() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        registry.acquire("c1").await.unwrap();
        provider.sandbox(0).fail_kill();
        registry.release("c1").await;

        assert!(!registry.describe("c1").await.exists);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_not_cached() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        provider.fail_provisioning("NBSANDBOX_API_KEY is not set");
        let err = registry.acquire("c1").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(_)));
        assert!(err.to_string().contains("NBSANDBOX_API_KEY"));
        assert!(!registry.describe("c1").await.exists);

        provider.recover();
        let handle = registry.acquire("c1").await.unwrap();
        assert_eq!(
            registry.describe("c1").await.sandbox_id.as_deref(),
            Some(handle.id())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_does_not_extend() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        registry.acquire("c1").await.unwrap();
        let before = registry.expires_at("c1").await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        let status = registry.describe("c1").await;
        assert!(status.exists);
        assert_eq!(status.expires_in_ms, Some((2 * HOUR - Duration::from_secs(60)).as_millis() as u64));
        assert_eq!(registry.expires_at("c1").await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired_entries() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        registry.acquire("old").await.unwrap();
        tokio::time::advance(HOUR).await;
        registry.acquire("live").await.unwrap();
        let live_expiry = registry.expires_at("live").await.unwrap();

        // old is 50 minutes past expiry, live has 10 minutes left
        tokio::time::advance(HOUR + Duration::from_secs(50 * 60)).await;
        let removed = registry.sweep_expired().await;

        assert_eq!(removed, 1);
        assert!(!registry.describe("old").await.exists);
        assert!(provider.sandbox(0).is_killed());

        let live = registry.describe("live").await;
        assert!(live.exists);
        assert_eq!(live.expires_in_ms, Some(10 * 60 * 1000));
        assert_eq!(registry.expires_at("live").await.unwrap(), live_expiry);
        assert!(!provider.sandbox(1).is_killed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_continues_past_teardown_failure() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        registry.acquire("a").await.unwrap();
        registry.acquire("b").await.unwrap();
        provider.sandbox(0).fail_kill();

        tokio::time::advance(3 * HOUR).await;
        assert_eq!(registry.sweep_expired().await, 2);
        assert_eq!(registry.active_count().await, 0);
        assert!(provider.sandbox(1).is_killed());
    }

    #[tokio::test]
    async fn test_dead_sandbox_is_replaced() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        let first = registry.acquire("c1").await.unwrap();
        provider.sandbox(0).mark_dead();
        let second = registry.acquire("c1").await.unwrap();

        assert!(!first.same_sandbox(&second));
        assert_eq!(provider.created_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_one_sandbox() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        let (a, b) = tokio::join!(registry.acquire("c1"), registry.acquire("c1"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.same_sandbox(&b));
        assert_eq!(provider.created_count(), 1);
    }

    #[tokio::test]
    async fn test_conversations_are_independent() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        let a = registry.acquire("a").await.unwrap();
        let b = registry.acquire("b").await.unwrap();
        assert!(!a.same_sandbox(&b));

        registry.release("a").await;
        assert!(registry.describe("b").await.exists);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_runs() {
        let provider = Arc::new(FakeProvider::new());
        let config = SessionConfig {
            session_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            ..Default::default()
        };
        let registry = SessionRegistry::init(provider.clone(), config);

        registry.acquire("c1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(301)).await;

        assert_eq!(registry.active_count().await, 0);
        assert!(provider.sandbox(0).is_killed());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let provider = Arc::new(FakeProvider::new());
        let registry = SessionRegistry::init(provider.clone(), SessionConfig::default());

        registry.acquire("a").await.unwrap();
        registry.acquire("b").await.unwrap();
        registry.shutdown().await;

        assert_eq!(registry.active_count().await, 0);
        assert!(provider.sandbox(0).is_killed());
        assert!(provider.sandbox(1).is_killed());
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_is_refused() {
        let provider = Arc::new(FakeProvider::new());
        let registry = SessionRegistry::init(provider.clone(), SessionConfig::default());

        registry.acquire("a").await.unwrap();
        registry.shutdown().await;

        let err = registry.acquire("a").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(ref msg) if msg == "registry shut down"));
        assert!(registry.acquire("b").await.is_err());
        assert_eq!(provider.created_count(), 1);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_timeout_leaves_no_entry() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);
        provider.slow_create(Duration::from_secs(120));

        let started = Instant::now();
        let err = registry.acquire("c1").await.unwrap_err();

        assert!(matches!(err, SandboxError::Provisioning(ref msg) if msg.contains("timed out")));
        let waited = started.elapsed();
        assert!(waited >= registry.config().provisioning_timeout);
        assert!(waited < Duration::from_secs(120));
        assert!(!registry.describe("c1").await.exists);
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(provider.created_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_during_replacement_keeps_new_sandbox() {
        let provider = Arc::new(FakeProvider::new());
        let registry = registry(&provider);

        registry.acquire("c1").await.unwrap();
        tokio::time::advance(2 * HOUR + Duration::from_secs(1)).await;
        provider.slow_create(Duration::from_secs(10));

        let sweep = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            registry.sweep_expired().await
        };
        let (acquired, removed) = tokio::join!(registry.acquire("c1"), sweep);
        let handle = acquired.unwrap();

        assert_eq!(removed, 0);
        assert!(provider.sandbox(0).is_killed());
        assert!(!provider.sandbox(1).is_killed());
        assert_eq!(handle.id(), provider.sandbox(1).id());

        let status = registry.describe("c1").await;
        assert!(status.exists);
        assert_eq!(status.sandbox_id.as_deref(), Some(handle.id()));
    }
}
