//! Broker wiring: everything the connection handlers, scheduler, and
//! watchdog share, behind a single `Arc<Broker>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::collaborators::{
    AccountsProvider, AuditEntry, AuditSink, BrokerEvent, SettingsStore,
};
use crate::config::BrokerConfig;
use crate::correlator::Correlator;
use crate::registry::Registry;
use crate::replication::CopyTracker;
use crate::wire::RateLimiter;
use crate::{scheduler, server};

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Broker {
    pub config: BrokerConfig,
    pub registry: Registry,
    pub correlator: Correlator,
    pub tracker: CopyTracker,
    pub limiter: RateLimiter,
    pub accounts: Arc<dyn AccountsProvider>,
    pub settings: Arc<dyn SettingsStore>,
    pub audit: Arc<dyn AuditSink>,
    events: broadcast::Sender<BrokerEvent>,
    shutting_down: AtomicBool,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        accounts: Arc<dyn AccountsProvider>,
        settings: Arc<dyn SettingsStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            limiter: RateLimiter::new(
                config.rate_limit_window(),
                config.rate_limit_max_per_window,
            ),
            correlator: Correlator::new(config.request_timeout()),
            registry: Registry::new(),
            tracker: CopyTracker::new(),
            config,
            accounts,
            settings,
            audit,
            events,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Run the accept loop plus background tasks until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        tokio::spawn(scheduler::run(Arc::clone(self)));
        tokio::spawn(watchdog(Arc::clone(self)));
        server::run(Arc::clone(self)).await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub async fn record_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(entry).await {
            warn!(error = %e, "audit record failed");
        }
    }

    /// Fan an event out to status observers; lagging or absent receivers
    /// are fine.
    pub fn broadcast(&self, kind: &str, data: Value) {
        let _ = self.events.send(BrokerEvent {
            kind: kind.to_string(),
            data,
            at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }
}

/// Flip sessions with dead sockets or stale traffic offline, and expire
/// correlator entries whose timeout task was lost.
async fn watchdog(broker: Arc<Broker>) {
    let mut interval = tokio::time::interval(broker.config.watchdog_interval());
    loop {
        interval.tick().await;
        if broker.is_shutting_down() {
            return;
        }
        let flipped = broker.registry.watchdog_sweep(broker.config.offline_after()).await;
        for key in flipped {
            info!(
                user_id = %key.user_id,
                role = key.role.as_str(),
                ea_id = %key.ea_id,
                "watchdog marked session offline"
            );
            broker.record_audit(AuditEntry::ea_disconnected(&key)).await;
            broker.broadcast("ea_disconnected", serde_json::to_value(&key).unwrap_or_default());
        }
        broker.correlator.sweep_stale().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::collaborators::{MemoryAccounts, MemoryAudit, MemorySettings};

    /// Broker over in-memory collaborators with the given allowed users.
    pub async fn memory_broker(users: &[&str]) -> Arc<Broker> {
        let accounts = Arc::new(MemoryAccounts::with_users(users.iter().copied()));
        let settings = Arc::new(MemorySettings::default());
        let audit = Arc::new(MemoryAudit::default());
        Broker::new(BrokerConfig::default(), accounts, settings, audit)
    }
}
