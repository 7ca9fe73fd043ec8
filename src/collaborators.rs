//! Pluggable collaborator seams: account lookup, per-EA settings storage,
//! and the audit trail. The broker core only talks to these traits; the
//! sqlite-backed implementations live in `db`, and in-memory versions here
//! back tests and secretless dev setups.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::registry::SessionKey;

#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub user_id: String,
    pub display_name: Option<String>,
    pub blocked: bool,
}

#[async_trait]
pub trait AccountsProvider: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<Option<AccountRecord>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self, user_id: &str, ea_id: &str) -> Result<Option<Value>>;
    async fn save(&self, user_id: &str, ea_id: &str, settings: &Value) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    EaConnected,
    EaDisconnected,
    SettingsUpdated,
    Warning,
    TradeCopied,
    TradeAction,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::EaConnected => "ea_connected",
            AuditKind::EaDisconnected => "ea_disconnected",
            AuditKind::SettingsUpdated => "settings_updated",
            AuditKind::Warning => "warning",
            AuditKind::TradeCopied => "trade_copied",
            AuditKind::TradeAction => "trade_action",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub user_id: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    fn new(kind: AuditKind, user_id: &str, detail: String) -> Self {
        Self {
            kind,
            user_id: user_id.to_string(),
            detail,
            at: Utc::now(),
        }
    }

    pub fn ea_connected(key: &SessionKey, account: Option<&str>) -> Self {
        Self::new(
            AuditKind::EaConnected,
            &key.user_id,
            format!(
                "{} {} (account {})",
                key.role.as_str(),
                key.ea_id,
                account.unwrap_or("-")
            ),
        )
    }

    pub fn ea_disconnected(key: &SessionKey) -> Self {
        Self::new(
            AuditKind::EaDisconnected,
            &key.user_id,
            format!("{} {}", key.role.as_str(), key.ea_id),
        )
    }

    pub fn settings_updated(user_id: &str, ea_id: &str) -> Self {
        Self::new(AuditKind::SettingsUpdated, user_id, ea_id.to_string())
    }

    pub fn warning(user_id: &str, detail: String) -> Self {
        Self::new(AuditKind::Warning, user_id, detail)
    }

    pub fn trade_copied(user_id: &str, detail: String) -> Self {
        Self::new(AuditKind::TradeCopied, user_id, detail)
    }

    pub fn trade_action(user_id: &str, detail: String) -> Self {
        Self::new(AuditKind::TradeAction, user_id, detail)
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// One broadcast fan-out item for status observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEvent {
    pub kind: String,
    pub data: Value,
    pub at: DateTime<Utc>,
}

// --- in-memory implementations ---

#[derive(Default)]
pub struct MemoryAccounts {
    accounts: RwLock<HashMap<String, AccountRecord>>,
}

impl MemoryAccounts {
    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accounts = users
            .into_iter()
            .map(|u| {
                let user_id = u.into();
                (
                    user_id.clone(),
                    AccountRecord {
                        user_id,
                        display_name: None,
                        blocked: false,
                    },
                )
            })
            .collect();
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    pub async fn block(&self, user_id: &str) {
        if let Some(a) = self.accounts.write().await.get_mut(user_id) {
            a.blocked = true;
        }
    }
}

#[async_trait]
impl AccountsProvider for MemoryAccounts {
    async fn lookup(&self, user_id: &str) -> Result<Option<AccountRecord>> {
        Ok(self.accounts.read().await.get(user_id).cloned())
    }
}

#[derive(Default)]
pub struct MemorySettings {
    by_ea: RwLock<HashMap<(String, String), Value>>,
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn load(&self, user_id: &str, ea_id: &str) -> Result<Option<Value>> {
        Ok(self
            .by_ea
            .read()
            .await
            .get(&(user_id.to_string(), ea_id.to_string()))
            .cloned())
    }

    async fn save(&self, user_id: &str, ea_id: &str, settings: &Value) -> Result<()> {
        self.by_ea
            .write()
            .await
            .insert((user_id.to_string(), ea_id.to_string()), settings.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAudit {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAudit {
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}
