//! Session manager - pools and serializes access to per-target agent sessions

use crate::agent::{AgentConnector, AgentSession, TargetId};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tunables for session reuse
#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
    /// Cached sessions unused for this long are closed by [`SessionManager::evict_idle`]
    pub idle_timeout: Duration,

    /// Upper bound on how long one task may hold a target's session
    pub lease_timeout: Option<Duration>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(90),
            lease_timeout: None,
        }
    }
}

struct CachedSession {
    session: Arc<dyn AgentSession>,
    last_used: Instant,
}

/// Per-target lease. The tokio mutex hands the lease to waiters in FIFO order.
#[derive(Default)]
struct SessionSlot {
    lease: tokio::sync::Mutex<Option<CachedSession>>,
}

/// Executes tasks against targets, one task per target at a time
pub struct SessionManager {
    connector: Arc<dyn AgentConnector>,
    registry: Mutex<HashMap<TargetId, Arc<SessionSlot>>>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn AgentConnector>, config: SessionManagerConfig) -> Self {
        Self {
            connector,
            registry: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Run `task` with exclusive access to the target's session, opening one
    /// if none is cached.
    ///
    /// Task failures are returned unchanged. Failure to open a session is
    /// reported as [`Error::ConnectionUnavailable`] and nothing is cached.
    pub async fn run<T, F, Fut>(&self, target: &TargetId, task: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn AgentSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let slot = self.slot(target);
        let mut lease = slot.lease.lock().await;

        let reusable = lease
            .as_ref()
            .filter(|cached| cached.session.is_connected())
            .map(|cached| Arc::clone(&cached.session));
        let session = match reusable {
            Some(session) => session,
            None => {
                if let Some(stale) = lease.take() {
                    tracing::info!("Discarding disconnected session to {}", target);
                    stale.session.disconnect().await;
                }
                match self.connector.connect(target).await {
                    Ok(session) => {
                        tracing::info!("Opened session to {}", target);
                        session
                    }
                    Err(e) => {
                        tracing::warn!("Failed to open session to {}: {}", target, e);
                        drop(lease);
                        self.release_slot(target, &slot);
                        return Err(match e {
                            Error::ConnectionUnavailable { .. } => e,
                            other => Error::ConnectionUnavailable {
                                target: target.to_string(),
                                reason: other.to_string(),
                            },
                        });
                    }
                }
            }
        };

        let outcome = match self.config.lease_timeout {
            Some(limit) => match tokio::time::timeout(limit, task(Arc::clone(&session))).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::LeaseTimeout {
                    target: target.to_string(),
                    seconds: limit.as_secs(),
                }),
            },
            None => task(Arc::clone(&session)).await,
        };

        let broken =
            !session.is_connected() || matches!(&outcome, Err(e) if e.is_session_fatal());
        if broken {
            tracing::warn!("Evicting unusable session to {}", target);
            session.disconnect().await;
            *lease = None;
            drop(lease);
            self.release_slot(target, &slot);
        } else {
            *lease = Some(CachedSession {
                session,
                last_used: Instant::now(),
            });
        }

        outcome
    }

    /// Close the target's cached session, waiting for an in-flight task to
    /// finish first. Returns whether a session was closed.
    pub async fn disconnect(&self, target: &TargetId) -> bool {
        let slot = match self.registry().get(target) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let mut lease = slot.lease.lock().await;
        let closed = match lease.take() {
            Some(cached) => {
                tracing::info!("Disconnecting session to {}", target);
                cached.session.disconnect().await;
                true
            }
            None => false,
        };
        drop(lease);
        self.release_slot(target, &slot);
        closed
    }

    /// Close every cached session idle for at least the configured timeout.
    /// Sessions currently leased are skipped. Returns the number closed.
    pub async fn evict_idle(&self) -> usize {
        let slots: Vec<(TargetId, Arc<SessionSlot>)> = self
            .registry()
            .iter()
            .map(|(target, slot)| (target.clone(), Arc::clone(slot)))
            .collect();

        let mut evicted = 0;
        for (target, slot) in slots {
            let Ok(mut lease) = slot.lease.try_lock() else {
                continue;
            };
            let idle = lease
                .as_ref()
                .is_some_and(|cached| cached.last_used.elapsed() >= self.config.idle_timeout);
            if idle {
                if let Some(cached) = lease.take() {
                    tracing::info!("Closing idle session to {}", target);
                    cached.session.disconnect().await;
                    evicted += 1;
                }
            }
            drop(lease);
            self.release_slot(&target, &slot);
        }
        evicted
    }

    /// Periodically evict idle sessions until the handle is aborted
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!("Reaper closed {} idle session(s)", evicted);
                }
            }
        })
    }

    /// Targets with an in-flight or cached session
    pub fn cached_targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self.registry().keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Close every session
    pub async fn shutdown(&self) {
        for target in self.cached_targets() {
            self.disconnect(&target).await;
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<TargetId, Arc<SessionSlot>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, target: &TargetId) -> Arc<SessionSlot> {
        Arc::clone(self.registry().entry(target.clone()).or_default())
    }

    /// Drop the registry entry once nobody holds or waits on it and it
    /// caches no session
    fn release_slot(&self, target: &TargetId, slot: &Arc<SessionSlot>) {
        let mut registry = self.registry();
        let Some(current) = registry.get(target) else {
            return;
        };
        if !Arc::ptr_eq(current, slot) || Arc::strong_count(slot) > 2 {
            return;
        }
        let empty = slot
            .lease
            .try_lock()
            .map(|lease| lease.is_none())
            .unwrap_or(false);
        if empty {
            registry.remove(target);
        }
    }
}
