//! Copy engine: turns a Controller's live snapshot into trade requests for
//! that user's Prop EAs.
//!
//! The engine is stateless between passes; idempotency lives entirely in
//! the tracker. A cell that succeeded is never re-sent, a cell with a
//! request still in flight is skipped, and a failed cell is retried on the
//! next pass.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::collaborators::AuditEntry;
use crate::correlator::{Completion, TradeOutcome};
use crate::protocol::{PendingOrder, Position, TradeRequest};
use crate::registry::SessionView;
use crate::replication::settings::ControllerSettings;
use crate::replication::tracking::{CopyStatus, TrackKey};

/// Replicate one connected Controller's snapshot to its Props.
pub async fn replicate_controller(broker: &Arc<Broker>, controller: &SessionView) {
    if !controller.enabled {
        return;
    }
    let Some(trades) = controller.trades_live.as_ref() else {
        return;
    };
    let props = broker.registry.prop_snapshots(&controller.user_id).await;
    if props.is_empty() {
        return;
    }
    let settings = ControllerSettings::from_blob(&controller.settings);

    for prop in &props {
        for position in &trades.positions {
            let key = track_key(controller, position.ticket);
            if !is_already_copied(broker, &key, &prop.ea_id).await {
                copy_position(broker, &key, prop, position, &settings).await;
            }
        }
        for order in &trades.orders {
            let key = track_key(controller, order.ticket);
            if !is_already_copied(broker, &key, &prop.ea_id).await {
                copy_order(broker, &key, prop, order, &settings).await;
            }
        }
    }
}

fn track_key(controller: &SessionView, ticket: i64) -> TrackKey {
    TrackKey {
        user_id: controller.user_id.clone(),
        controller_ea_id: controller.ea_id.clone(),
        controller_ticket: ticket,
    }
}

/// Success is terminal; pending only blocks while a request id is actually
/// live in the correlator, so a crash between attempt and dispatch cannot
/// wedge the cell.
pub async fn is_already_copied(broker: &Broker, key: &TrackKey, prop_ea_id: &str) -> bool {
    let Some(record) = broker.tracker.copy_record(key, prop_ea_id).await else {
        return false;
    };
    match record.status {
        CopyStatus::Success => true,
        CopyStatus::Pending => broker.correlator.has_any_pending(&record.request_ids).await,
        CopyStatus::Failed => false,
    }
}

async fn copy_position(
    broker: &Arc<Broker>,
    key: &TrackKey,
    prop: &SessionView,
    position: &Position,
    settings: &ControllerSettings,
) {
    let request = TradeRequest::open_position(position, settings.draw_jitter());
    dispatch_copy(broker, key, prop, request).await;
}

async fn copy_order(
    broker: &Arc<Broker>,
    key: &TrackKey,
    prop: &SessionView,
    order: &PendingOrder,
    settings: &ControllerSettings,
) {
    let price = settings.apply_order_offset(&order.kind, order.price_open);
    let request = TradeRequest::open_order(order, price, settings.draw_jitter());
    dispatch_copy(broker, key, prop, request).await;
}

async fn dispatch_copy(broker: &Arc<Broker>, key: &TrackKey, prop: &SessionView, request: TradeRequest) {
    let Some(handle) = prop.handle.as_ref() else {
        return;
    };
    debug!(
        user_id = %key.user_id,
        controller_ticket = key.controller_ticket,
        prop_ea_id = %prop.ea_id,
        request_id = %request.request_id,
        "copying trade"
    );
    broker
        .tracker
        .record_attempt(key, &prop.ea_id, &request.request_id)
        .await;

    // The tracker transition rides the correlator's completion hook, so the
    // cell is never observable as pending-with-no-live-request: the moment
    // the id leaves the pending table the record is already Success/Failed.
    let settle: Completion = {
        let broker = Arc::clone(broker);
        let key = key.clone();
        let prop_ea_id = prop.ea_id.clone();
        Box::new(move |outcome| Box::pin(settle_copy(broker, key, prop_ea_id, outcome)))
    };
    let _ = broker
        .correlator
        .send_with_completion(handle, &prop.ea_id, &request, Some(settle))
        .await;
}

async fn settle_copy(broker: Arc<Broker>, key: TrackKey, prop_ea_id: String, outcome: TradeOutcome) {
    match &outcome {
        TradeOutcome::Success { remote_ticket } => {
            broker
                .tracker
                .record_success(&key, &prop_ea_id, *remote_ticket)
                .await;
            info!(
                controller_ticket = key.controller_ticket,
                prop_ea_id = %prop_ea_id,
                remote_ticket = remote_ticket.unwrap_or(-1),
                "trade copied"
            );
            broker
                .record_audit(AuditEntry::trade_copied(
                    &key.user_id,
                    format!(
                        "{}: ticket {} -> {} on {}",
                        CopyStatus::Success.display(),
                        key.controller_ticket,
                        remote_ticket.map_or_else(|| "?".to_string(), |t| t.to_string()),
                        prop_ea_id
                    ),
                ))
                .await;
        }
        TradeOutcome::Failed { error } => {
            warn!(
                controller_ticket = key.controller_ticket,
                prop_ea_id = %prop_ea_id,
                error = %error,
                "copy failed"
            );
            broker
                .tracker
                .record_failure(&key, &prop_ea_id, error.clone())
                .await;
        }
        TradeOutcome::TimedOut => {
            broker
                .tracker
                .record_failure(&key, &prop_ea_id, "timeout".to_string())
                .await;
        }
        TradeOutcome::SendFailed => {
            broker
                .tracker
                .record_failure(&key, &prop_ea_id, "send failed".to_string())
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_support::memory_broker;
    use crate::protocol::TradeResponseMsg;
    use crate::registry::handle::test_support::{conn_pair, next_frame_json};
    use crate::registry::LiveTrades;
    use rust_decimal_macros::dec;

    fn position(ticket: i64) -> Position {
        Position {
            ticket,
            symbol: "EURUSD".into(),
            kind: "buy".into(),
            volume: dec!(0.10),
            stop_loss: None,
            take_profit: None,
        }
    }

    fn controller_view(broker_user: &str, trades: LiveTrades) -> SessionView {
        SessionView {
            user_id: broker_user.to_string(),
            role: crate::protocol::EaRole::Controller,
            ea_id: "EA-C".to_string(),
            state: crate::registry::SessionState::Online,
            connected: true,
            enabled: true,
            account_number: None,
            handle: None,
            trades_live: Some(trades),
            settings: serde_json::Value::Null,
        }
    }

    async fn connect_prop(broker: &Arc<Broker>, conn_id: u64, ea_id: &str) -> tokio::sync::mpsc::UnboundedReceiver<crate::registry::WriterCmd> {
        let (handle, rx) = conn_pair(conn_id);
        let key = crate::registry::SessionKey {
            user_id: "user-1".to_string(),
            role: crate::protocol::EaRole::Prop,
            ea_id: ea_id.to_string(),
        };
        broker.registry.reserve(&key, conn_id).await;
        broker.registry.commit(&key, conn_id, handle, None, None, None).await;
        rx
    }

    #[tokio::test]
    async fn copies_each_position_to_each_prop_once() {
        let broker = memory_broker(&["user-1"]).await;
        let mut rx = connect_prop(&broker, 1, "EA-P").await;

        let view = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![position(555)],
                orders: vec![],
            },
        );
        replicate_controller(&broker, &view).await;

        let frame = next_frame_json(&mut rx).unwrap();
        assert_eq!(frame["type"], "trade_request");
        assert_eq!(frame["subtype"], "Request_Open.Pos");
        assert_eq!(frame["controllerTicket"], 555);

        // Second pass while the request is pending: nothing new goes out.
        replicate_controller(&broker, &view).await;
        assert!(next_frame_json(&mut rx).is_none());
    }

    #[tokio::test]
    async fn success_is_never_resent_but_failure_is_retried() {
        let broker = memory_broker(&["user-1"]).await;
        let mut rx = connect_prop(&broker, 1, "EA-P").await;
        let view = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![position(555)],
                orders: vec![],
            },
        );

        replicate_controller(&broker, &view).await;
        let frame = next_frame_json(&mut rx).unwrap();
        let request_id = frame["requestId"].as_str().unwrap().to_string();

        // Prop answers success with its own ticket.
        broker
            .correlator
            .on_response(&TradeResponseMsg {
                request_id,
                status: "success".to_string(),
                ticket: Some(999),
                error: None,
            })
            .await;

        let key = TrackKey {
            user_id: "user-1".to_string(),
            controller_ea_id: "EA-C".to_string(),
            controller_ticket: 555,
        };
        let record = broker.tracker.copy_record(&key, "EA-P").await.unwrap();
        assert_eq!(record.status, CopyStatus::Success);
        assert_eq!(record.remote_ticket, Some(999));

        // Success is terminal: further passes send nothing.
        replicate_controller(&broker, &view).await;
        assert!(next_frame_json(&mut rx).is_none());

        // A different ticket that fails gets retried on the next pass.
        let view2 = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![position(556)],
                orders: vec![],
            },
        );
        replicate_controller(&broker, &view2).await;
        let frame = next_frame_json(&mut rx).unwrap();
        let request_id = frame["requestId"].as_str().unwrap().to_string();
        broker
            .correlator
            .on_response(&TradeResponseMsg {
                request_id,
                status: "failed".to_string(),
                ticket: None,
                error: Some("requote".to_string()),
            })
            .await;

        replicate_controller(&broker, &view2).await;
        let retry = next_frame_json(&mut rx).unwrap();
        assert_eq!(retry["controllerTicket"], 556);
    }

    #[tokio::test]
    async fn success_is_visible_to_the_pass_right_after_the_response() {
        let broker = memory_broker(&["user-1"]).await;
        let mut rx = connect_prop(&broker, 1, "EA-P").await;
        let view = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![position(555)],
                orders: vec![],
            },
        );

        replicate_controller(&broker, &view).await;
        let frame = next_frame_json(&mut rx).unwrap();
        let request_id = frame["requestId"].as_str().unwrap().to_string();
        broker
            .correlator
            .on_response(&TradeResponseMsg {
                request_id,
                status: "success".to_string(),
                ticket: Some(999),
                error: None,
            })
            .await;

        // No yield between response and pass: the tracker must already hold
        // the terminal state, otherwise the trade would be opened twice.
        replicate_controller(&broker, &view).await;
        assert!(next_frame_json(&mut rx).is_none());
    }

    #[tokio::test]
    async fn pending_orders_get_the_price_offset() {
        let broker = memory_broker(&["user-1"]).await;
        let mut rx = connect_prop(&broker, 1, "EA-P").await;

        let mut view = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![],
                orders: vec![PendingOrder {
                    ticket: 700,
                    symbol: "EURUSD".into(),
                    kind: "buy_stop".into(),
                    volume: dec!(0.20),
                    price_open: dec!(1.10000),
                    stop_loss: None,
                    take_profit: None,
                }],
            },
        );
        view.settings = serde_json::json!({"offset": 10});
        replicate_controller(&broker, &view).await;

        let frame = next_frame_json(&mut rx).unwrap();
        assert_eq!(frame["subtype"], "Request_Open.Ord");
        assert_eq!(frame["data"]["priceOpen"], serde_json::json!(1.1001));
    }

    #[tokio::test]
    async fn fans_out_to_every_prop() {
        let broker = memory_broker(&["user-1"]).await;
        let mut rx1 = connect_prop(&broker, 1, "EA-P1").await;
        let mut rx2 = connect_prop(&broker, 2, "EA-P2").await;

        let view = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![position(555)],
                orders: vec![],
            },
        );
        replicate_controller(&broker, &view).await;

        assert!(next_frame_json(&mut rx1).is_some());
        assert!(next_frame_json(&mut rx2).is_some());
    }

    #[tokio::test]
    async fn no_props_means_no_work() {
        let broker = memory_broker(&["user-1"]).await;
        let view = controller_view(
            "user-1",
            LiveTrades {
                positions: vec![position(555)],
                orders: vec![],
            },
        );
        replicate_controller(&broker, &view).await;
        assert_eq!(broker.correlator.pending_count().await, 0);
    }
}
