//! Inbound message dispatch.
//!
//! One entry point per connection reader loop: every parsed message lands
//! here and is routed to the registry, the correlator, or the trade-action
//! fan-out. Cache-updating messages are mirrored onto the observer broadcast
//! channel. Messages from a connection with no bound session (pre-hello)
//! only refresh liveness.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::collaborators::AuditEntry;
use crate::correlator::TradeOutcome;
use crate::protocol::{
    trade_action_ack, DeinitMsg, EaRole, Inbound, TradeActionKind, TradeActionMsg, TradeRequest,
};
use crate::registry::handshake::process_hello;
use crate::registry::{ConnHandle, LiveTrades, SessionState};

pub async fn dispatch(broker: &Arc<Broker>, conn: &ConnHandle, msg: Inbound) {
    // Any traffic proves the socket is alive.
    broker
        .registry
        .with_session_by_conn(conn.id, |s| s.last_seen = Instant::now())
        .await;

    match msg {
        Inbound::Hello(hello) => {
            process_hello(broker, conn, hello).await;
        }
        Inbound::Status(status) => {
            let key = broker
                .registry
                .with_session_by_conn(conn.id, |s| {
                    s.last_status = status.status.clone();
                    if status.balance.is_some() || status.equity.is_some() {
                        let info = s.account_info.get_or_insert_with(|| json!({}));
                        if let Some(balance) = status.balance {
                            info["balance"] = json!(balance);
                        }
                        if let Some(equity) = status.equity {
                            info["equity"] = json!(equity);
                        }
                    }
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                broker.broadcast(
                    "status",
                    json!({
                        "userId": key.user_id,
                        "eaId": key.ea_id,
                        "status": status.status,
                        "balance": status.balance,
                        "equity": status.equity,
                    }),
                );
            }
        }
        Inbound::Error(err) => {
            let entry = json!({
                "code": err.code,
                "message": err.message.clone(),
                "at": crate::protocol::now_ms(),
            });
            let key = broker
                .registry
                .with_session_by_conn(conn.id, |s| {
                    s.push_error(entry.clone());
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                warn!(ea_id = %key.ea_id, code = ?err.code, "ea reported error");
                broker
                    .record_audit(AuditEntry::warning(
                        &key.user_id,
                        format!("{} error: {}", key.ea_id, err.message.unwrap_or_default()),
                    ))
                    .await;
                broker.broadcast(
                    "error",
                    json!({"userId": key.user_id, "eaId": key.ea_id, "error": entry}),
                );
            }
        }
        Inbound::Deinit(deinit) => {
            handle_deinit(broker, conn, deinit).await;
        }
        Inbound::Tick(tick) => {
            let snapshot = json!({
                "symbol": tick.symbol,
                "bid": tick.bid,
                "ask": tick.ask,
            });
            let key = broker
                .registry
                .with_session_by_conn(conn.id, |s| {
                    s.last_tick = Some(snapshot.clone());
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                broker.broadcast(
                    "tick",
                    json!({"userId": key.user_id, "eaId": key.ea_id, "tick": snapshot}),
                );
            }
        }
        Inbound::BrokerTime(bt) => {
            let time = bt.time.clone();
            let key = broker
                .registry
                .with_session_by_conn(conn.id, |s| {
                    s.broker_time = bt.time.clone();
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                broker.broadcast(
                    "broker_time",
                    json!({"userId": key.user_id, "eaId": key.ea_id, "time": time}),
                );
            }
        }
        Inbound::AccountInfo(info) => {
            let snapshot = json!({
                "balance": info.balance,
                "equity": info.equity,
                "currency": info.currency,
                "extra": info.extra,
            });
            let key = broker
                .registry
                .with_session_by_conn(conn.id, |s| {
                    s.account_info = Some(snapshot.clone());
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                broker.broadcast(
                    "account_info",
                    json!({"userId": key.user_id, "eaId": key.ea_id, "account": snapshot}),
                );
            }
        }
        Inbound::TradesLive(trades) => {
            let payload = json!({"positions": &trades.positions, "orders": &trades.orders});
            let key = broker
                .registry
                .with_session_by_conn(conn.id, move |s| {
                    s.trades_live = Some(LiveTrades {
                        positions: trades.positions,
                        orders: trades.orders,
                    });
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                broker.broadcast(
                    "trades_live",
                    json!({"userId": key.user_id, "eaId": key.ea_id, "trades": payload}),
                );
            }
        }
        Inbound::TradesHistory(history) => {
            let payload = json!(&history.trades);
            let key = broker
                .registry
                .with_session_by_conn(conn.id, move |s| {
                    s.trades_history = Some(history.trades);
                    s.key.clone()
                })
                .await;
            if let Some(key) = key {
                broker.broadcast(
                    "trades_history",
                    json!({"userId": key.user_id, "eaId": key.ea_id, "trades": payload}),
                );
            }
        }
        Inbound::TradeResponse(resp) => {
            broker.correlator.on_response(&resp).await;
        }
        Inbound::TradeAction(action) => {
            handle_trade_action(broker, conn, &action).await;
        }
        Inbound::TradeActionsBulk(bulk) => {
            for action in &bulk.actions {
                handle_trade_action(broker, conn, action).await;
            }
        }
    }
}

/// Reason codes that mean the EA was deliberately removed rather than a
/// terminal/chart restart.
fn is_clean_removal(deinit: &DeinitMsg) -> bool {
    match deinit.reason {
        Some(1) | Some(3) | Some(5) => true,
        Some(0) => deinit.was_remove_command.unwrap_or(false),
        _ => false,
    }
}

async fn handle_deinit(broker: &Arc<Broker>, conn: &ConnHandle, deinit: DeinitMsg) {
    let Some(key) = broker.registry.key_for_conn(conn.id).await else {
        return;
    };
    broker.record_audit(AuditEntry::ea_disconnected(&key)).await;
    if is_clean_removal(&deinit) {
        info!(
            ea_id = %key.ea_id,
            reason = ?deinit.reason,
            "clean deinit, purging session"
        );
        if key.role == EaRole::Controller {
            broker
                .tracker
                .purge_controller(&key.user_id, &key.ea_id)
                .await;
        }
        broker.registry.purge(&key).await;
    } else {
        debug!(ea_id = %key.ea_id, reason = ?deinit.reason, "deinit, going offline");
        broker
            .registry
            .with_session_by_conn(conn.id, |s| {
                s.handle = None;
                s.state = SessionState::Offline;
            })
            .await;
    }
    broker.broadcast("deinit_confirmed", serde_json::to_value(&key).unwrap_or_default());
}

fn request_for_action(action: &TradeActionMsg) -> TradeRequest {
    match action.action {
        TradeActionKind::ClosePosition => TradeRequest::exit_position(action.controller_ticket),
        TradeActionKind::RemoveOrder => TradeRequest::exit_order(action.controller_ticket),
        TradeActionKind::ModifyPosition => {
            TradeRequest::modify_position(action.controller_ticket, action.stop_loss, action.take_profit)
        }
        TradeActionKind::ModifyOrder => TradeRequest::modify_order(
            action.controller_ticket,
            action.price_open,
            action.stop_loss,
            action.take_profit,
        ),
    }
}

/// Fan a controller-issued action out to every connected, enabled Prop of
/// the same user, then ack with the delivery count.
async fn handle_trade_action(broker: &Arc<Broker>, conn: &ConnHandle, action: &TradeActionMsg) {
    let key = broker.registry.key_for_conn(conn.id).await;
    let Some(key) = key else {
        warn!(conn_id = conn.id, "trade action from unbound connection");
        return;
    };
    if key.role != EaRole::Controller {
        warn!(ea_id = %key.ea_id, "trade action from non-controller, dropping");
        return;
    }

    let props = broker.registry.prop_snapshots(&key.user_id).await;
    let mut delivered = 0usize;
    for prop in &props {
        let Some(handle) = prop.handle.as_ref() else {
            continue;
        };
        let request = request_for_action(action);
        let request_id = request.request_id.clone();
        let rx = broker.correlator.send(handle, &prop.ea_id, &request).await;
        delivered += 1;

        let prop_ea_id = prop.ea_id.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(TradeOutcome::Success { .. }) => {}
                Ok(outcome) => {
                    warn!(request_id = %request_id, ea_id = %prop_ea_id, ?outcome, "trade action not applied");
                }
                Err(_) => {}
            }
        });
    }
    conn.send_json(&trade_action_ack(action.action, action.controller_ticket, delivered));
    broker
        .record_audit(AuditEntry::trade_action(
            &key.user_id,
            format!("{:?} ticket {} to {} props", action.action, action.controller_ticket, delivered),
        ))
        .await;
    info!(
        ea_id = %key.ea_id,
        action = ?action.action,
        controller_ticket = action.controller_ticket,
        delivered,
        "trade action fanned out"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_support::memory_broker;
    use crate::protocol::{parse_inbound, HelloMsg};
    use crate::registry::handle::test_support::{conn_pair, next_frame_json};
    use serde_json::json;

    async fn connect(
        broker: &Arc<Broker>,
        conn_id: u64,
        role: EaRole,
        ea_id: &str,
    ) -> (ConnHandle, tokio::sync::mpsc::UnboundedReceiver<crate::registry::WriterCmd>) {
        let (conn, rx) = conn_pair(conn_id);
        let hello = HelloMsg {
            user_id: "user-1".to_string(),
            role,
            ea_id: ea_id.to_string(),
            account_number: None,
            broker: None,
            symbol: None,
            settings: None,
        };
        dispatch(broker, &conn, Inbound::Hello(hello)).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn trades_live_snapshot_is_cached() {
        let broker = memory_broker(&["user-1"]).await;
        let (conn, _rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;

        let raw = json!({
            "type": "trades_live",
            "positions": [{"ticket": 1, "symbol": "EURUSD", "type": "buy", "volume": 0.1}],
            "orders": [],
        });
        dispatch(&broker, &conn, parse_inbound(&raw).unwrap()).await;

        let cached = broker
            .registry
            .with_session_by_conn(1, |s| s.trades_live.clone())
            .await
            .flatten()
            .unwrap();
        assert_eq!(cached.positions.len(), 1);
    }

    #[tokio::test]
    async fn cache_updates_are_mirrored_to_observers() {
        let broker = memory_broker(&["user-1"]).await;
        let mut events = broker.subscribe();
        let (conn, _rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;

        for raw in [
            json!({"type": "status", "status": "ok", "balance": 1000.0}),
            json!({"type": "tick", "symbol": "EURUSD", "bid": 1.1, "ask": 1.1001}),
            json!({"type": "account_info", "balance": 1000.0, "equity": 990.0, "currency": "USD"}),
            json!({"type": "trades_live", "positions": [], "orders": []}),
            json!({"type": "trades_history", "trades": []}),
            json!({"type": "broker_time", "time": "2026-08-31 12:00:00"}),
            json!({"type": "error", "code": 134, "message": "not enough money"}),
        ] {
            dispatch(&broker, &conn, parse_inbound(&raw).unwrap()).await;
        }

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.data["eaId"], "EA-C");
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                "hello",
                "status",
                "tick",
                "account_info",
                "trades_live",
                "trades_history",
                "broker_time",
                "error",
            ]
        );
    }

    #[tokio::test]
    async fn close_action_fans_out_and_acks() {
        let broker = memory_broker(&["user-1"]).await;
        let (ctrl, mut ctrl_rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;
        let (_prop, mut prop_rx) = connect(&broker, 2, EaRole::Prop, "EA-P").await;

        let raw = json!({"type": "trade_action", "action": "close_position", "controllerTicket": 555});
        dispatch(&broker, &ctrl, parse_inbound(&raw).unwrap()).await;

        let request = next_frame_json(&mut prop_rx).unwrap();
        assert_eq!(request["type"], "trade_request");
        assert_eq!(request["subtype"], "Request_Exit.Pos");
        assert_eq!(request["data"]["ticket"], 555);

        let ack = next_frame_json(&mut ctrl_rx).unwrap();
        assert_eq!(ack["type"], "trade_action_ack");
        assert_eq!(ack["controllerTicket"], 555);
        assert_eq!(ack["delivered"], 1);
    }

    #[tokio::test]
    async fn trade_action_accepts_the_short_ticket_field() {
        let broker = memory_broker(&["user-1"]).await;
        let (ctrl, mut ctrl_rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;
        let (_prop, mut prop_rx) = connect(&broker, 2, EaRole::Prop, "EA-P").await;

        let raw = json!({"type": "trade_action", "action": "close_position", "ticket": 42});
        dispatch(&broker, &ctrl, parse_inbound(&raw).unwrap()).await;

        assert!(next_frame_json(&mut prop_rx).is_some());
        let ack = next_frame_json(&mut ctrl_rx).unwrap();
        assert_eq!(ack["controllerTicket"], 42);
    }

    #[tokio::test]
    async fn trade_action_from_prop_is_dropped() {
        let broker = memory_broker(&["user-1"]).await;
        let (_ctrl, mut ctrl_rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;
        let (prop, mut prop_rx) = connect(&broker, 2, EaRole::Prop, "EA-P").await;

        let raw = json!({"type": "trade_action", "action": "close_position", "ticket": 555});
        dispatch(&broker, &prop, parse_inbound(&raw).unwrap()).await;

        assert!(next_frame_json(&mut ctrl_rx).is_none());
        assert!(next_frame_json(&mut prop_rx).is_none());
    }

    #[tokio::test]
    async fn bulk_actions_each_fan_out() {
        let broker = memory_broker(&["user-1"]).await;
        let (ctrl, _ctrl_rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;
        let (_prop, mut prop_rx) = connect(&broker, 2, EaRole::Prop, "EA-P").await;

        let raw = json!({
            "type": "trade_actions_bulk",
            "actions": [
                {"action": "close_position", "ticket": 1},
                {"action": "remove_order", "ticket": 2},
            ],
        });
        dispatch(&broker, &ctrl, parse_inbound(&raw).unwrap()).await;

        let first = next_frame_json(&mut prop_rx).unwrap();
        assert_eq!(first["subtype"], "Request_Exit.Pos");
        let second = next_frame_json(&mut prop_rx).unwrap();
        assert_eq!(second["subtype"], "Request_Exit.Ord");
    }

    #[tokio::test]
    async fn clean_deinit_purges_session_and_tracker() {
        let broker = memory_broker(&["user-1"]).await;
        let (ctrl, _rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;
        broker
            .tracker
            .record_attempt(
                &crate::replication::TrackKey {
                    user_id: "user-1".to_string(),
                    controller_ea_id: "EA-C".to_string(),
                    controller_ticket: 1,
                },
                "EA-P",
                "req-1",
            )
            .await;

        let raw = json!({"type": "deinit", "reason": 1});
        dispatch(&broker, &ctrl, parse_inbound(&raw).unwrap()).await;

        assert_eq!(broker.registry.session_count().await, 0);
        assert!(broker.tracker.records_for_user("user-1").await.is_empty());
    }

    #[tokio::test]
    async fn restart_deinit_keeps_session_offline() {
        let broker = memory_broker(&["user-1"]).await;
        let (ctrl, _rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;

        // reason 2 is a chart/terminal restart, not a removal
        let raw = json!({"type": "deinit", "reason": 2});
        dispatch(&broker, &ctrl, parse_inbound(&raw).unwrap()).await;

        assert_eq!(broker.registry.session_count().await, 1);
        assert!(broker.registry.controller_snapshots(Some("user-1")).await.is_empty());
    }

    #[tokio::test]
    async fn deinit_reason_zero_purges_only_with_remove_flag() {
        let broker = memory_broker(&["user-1"]).await;

        let (ctrl, _rx) = connect(&broker, 1, EaRole::Controller, "EA-C").await;
        let raw = json!({"type": "deinit", "reason": 0, "wasRemoveCommand": true});
        dispatch(&broker, &ctrl, parse_inbound(&raw).unwrap()).await;
        assert_eq!(broker.registry.session_count().await, 0);

        let (ctrl2, _rx2) = connect(&broker, 2, EaRole::Controller, "EA-C").await;
        let raw = json!({"type": "deinit", "reason": 0});
        dispatch(&broker, &ctrl2, parse_inbound(&raw).unwrap()).await;
        assert_eq!(broker.registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn error_messages_are_cached_and_audited() {
        let broker = memory_broker(&["user-1"]).await;
        let (conn, _rx) = connect(&broker, 1, EaRole::Prop, "EA-P").await;

        let raw = json!({"type": "error", "code": 134, "message": "not enough money"});
        dispatch(&broker, &conn, parse_inbound(&raw).unwrap()).await;

        let errors = broker
            .registry
            .with_session_by_conn(1, |s| s.errors.len())
            .await
            .unwrap();
        assert_eq!(errors, 1);
    }
}
