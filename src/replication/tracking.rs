//! Idempotency ledger for copied trades.
//!
//! Each (user, controller EA, controller ticket, prop EA) cell remembers
//! how the last copy attempt ended. Success is terminal; a failure leaves
//! the cell eligible for retry on the next scheduler pass.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub user_id: String,
    pub controller_ea_id: String,
    pub controller_ticket: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Pending,
    Success,
    Failed,
}

impl CopyStatus {
    /// Operator-facing rendering used in status output and the audit trail.
    pub fn display(self) -> &'static str {
        match self {
            CopyStatus::Success => "\u{2705} Success",
            CopyStatus::Failed => "\u{274C} Failed",
            CopyStatus::Pending => "\u{23F3} Pending",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRecord {
    pub status: CopyStatus,
    pub remote_ticket: Option<i64>,
    pub error: Option<String>,
    /// Every request id ever issued for this cell, newest last.
    pub request_ids: Vec<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct CopyTracker {
    // (controller cell, prop ea id) -> record
    cells: RwLock<HashMap<(TrackKey, String), CopyRecord>>,
}

impl CopyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a fresh attempt in flight and remember its request id.
    pub async fn record_attempt(&self, key: &TrackKey, prop_ea_id: &str, request_id: &str) {
        let mut cells = self.cells.write().await;
        let cell = cells
            .entry((key.clone(), prop_ea_id.to_string()))
            .or_insert_with(|| CopyRecord {
                status: CopyStatus::Pending,
                remote_ticket: None,
                error: None,
                request_ids: Vec::new(),
                attempts: 0,
                updated_at: Utc::now(),
            });
        cell.status = CopyStatus::Pending;
        cell.error = None;
        cell.attempts += 1;
        cell.request_ids.push(request_id.to_string());
        cell.updated_at = Utc::now();
    }

    pub async fn record_success(&self, key: &TrackKey, prop_ea_id: &str, remote_ticket: Option<i64>) {
        let mut cells = self.cells.write().await;
        if let Some(cell) = cells.get_mut(&(key.clone(), prop_ea_id.to_string())) {
            cell.status = CopyStatus::Success;
            cell.remote_ticket = remote_ticket;
            cell.error = None;
            cell.updated_at = Utc::now();
        }
    }

    pub async fn record_failure(&self, key: &TrackKey, prop_ea_id: &str, error: String) {
        let mut cells = self.cells.write().await;
        if let Some(cell) = cells.get_mut(&(key.clone(), prop_ea_id.to_string())) {
            cell.status = CopyStatus::Failed;
            cell.error = Some(error);
            cell.updated_at = Utc::now();
        }
    }

    pub async fn copy_record(&self, key: &TrackKey, prop_ea_id: &str) -> Option<CopyRecord> {
        self.cells
            .read()
            .await
            .get(&(key.clone(), prop_ea_id.to_string()))
            .cloned()
    }

    /// All cells for one user, for status rendering.
    pub async fn records_for_user(&self, user_id: &str) -> Vec<(TrackKey, String, CopyRecord)> {
        self.cells
            .read()
            .await
            .iter()
            .filter(|((k, _), _)| k.user_id == user_id)
            .map(|((k, prop), r)| (k.clone(), prop.clone(), r.clone()))
            .collect()
    }

    /// One-line progress rendering across a controller's cells.
    pub async fn aggregate_display(&self, user_id: &str, controller_ea_id: &str) -> Option<String> {
        let cells = self.cells.read().await;
        let mut total = 0usize;
        let mut succeeded = 0usize;
        let mut pending = 0usize;
        for ((k, _), record) in cells.iter() {
            if k.user_id != user_id || k.controller_ea_id != controller_ea_id {
                continue;
            }
            total += 1;
            match record.status {
                CopyStatus::Success => succeeded += 1,
                CopyStatus::Pending => pending += 1,
                CopyStatus::Failed => {}
            }
        }
        if total == 0 {
            return None;
        }
        Some(if succeeded == total {
            CopyStatus::Success.display().to_string()
        } else if pending > 0 {
            format!("\u{23F3} {succeeded}/{total} (Pending)")
        } else if succeeded == 0 {
            CopyStatus::Failed.display().to_string()
        } else {
            format!("\u{26A0}\u{FE0F} {succeeded}/{total}")
        })
    }

    /// Drop every cell belonging to a controller EA (clean removal).
    pub async fn purge_controller(&self, user_id: &str, controller_ea_id: &str) {
        let mut cells = self.cells.write().await;
        cells.retain(|(k, _), _| {
            !(k.user_id == user_id && k.controller_ea_id == controller_ea_id)
        });
    }
}
