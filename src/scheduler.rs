//! Fixed-cadence copy scheduler.
//!
//! Every pass walks all connected Controllers and replays their full live
//! snapshots through the copy engine. There is no diffing; the tracker
//! makes repeat passes cheap no-ops for already-copied cells.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::Broker;
use crate::replication::replicate_controller;

const HEARTBEAT_EVERY_CYCLES: u64 = 25;

/// One scheduler pass over every connected controller.
pub async fn run_once(broker: &Arc<Broker>) {
    let controllers = broker.registry.controller_snapshots(None).await;
    for controller in &controllers {
        replicate_controller(broker, controller).await;
    }
}

pub async fn run(broker: Arc<Broker>) {
    let mut interval = tokio::time::interval(Duration::from_millis(broker.config.copy_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;
    info!(interval_ms = broker.config.copy_interval_ms, "copy scheduler started");

    loop {
        interval.tick().await;
        if broker.is_shutting_down() {
            info!("copy scheduler stopped");
            return;
        }
        run_once(&broker).await;
        cycles += 1;
        if cycles % HEARTBEAT_EVERY_CYCLES == 0 {
            let sessions = broker.registry.session_count().await;
            let pending = broker.correlator.pending_count().await;
            debug!(cycles, sessions, pending, "scheduler heartbeat");
            for controller in broker.registry.controller_snapshots(None).await {
                if let Some(progress) = broker
                    .tracker
                    .aggregate_display(&controller.user_id, &controller.ea_id)
                    .await
                {
                    debug!(ea_id = %controller.ea_id, %progress, "copy progress");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_support::memory_broker;

    #[tokio::test]
    async fn run_once_with_no_controllers_is_a_no_op() {
        let broker = memory_broker(&["user-1"]).await;
        run_once(&broker).await;
        assert_eq!(broker.correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let broker = memory_broker(&["user-1"]).await;
        broker.shutdown();
        // Must return rather than loop forever.
        tokio::time::timeout(Duration::from_secs(1), run(Arc::clone(&broker)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_can_be_spawned_as_a_task() {
        let broker = memory_broker(&["user-1"]).await;
        broker.shutdown();
        let task = tokio::spawn(run(Arc::clone(&broker)));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
