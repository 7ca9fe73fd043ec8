//! Wire message model shared by both EA roles.
//!
//! Payloads are JSON objects discriminated by a `type` field. Unknown types
//! are ignored; known types with malformed fields are logged and ignored so
//! one bad message never tears down an otherwise healthy session.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EaRole {
    Controller,
    Prop,
}

impl EaRole {
    pub fn opposite(self) -> Self {
        match self {
            EaRole::Controller => EaRole::Prop,
            EaRole::Prop => EaRole::Controller,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EaRole::Controller => "controller",
            EaRole::Prop => "prop",
        }
    }
}

/// An open position reported by a Controller in its live-trades snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub ticket: i64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub volume: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

/// A pending order; same shape as a position plus the entry price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub ticket: i64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub volume: Decimal,
    pub price_open: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloMsg {
    pub user_id: String,
    pub role: EaRole,
    pub ea_id: String,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMsg {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub equity: Option<Decimal>,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMsg {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeinitMsg {
    #[serde(default)]
    pub reason: Option<i64>,
    #[serde(default)]
    pub was_remove_command: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickMsg {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfoMsg {
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub equity: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradesLiveMsg {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub orders: Vec<PendingOrder>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradesHistoryMsg {
    #[serde(default)]
    pub trades: Vec<Value>,
}

/// A Prop EA's reply to a `trade_request`, keyed by `requestId`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponseMsg {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub ticket: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerTimeMsg {
    #[serde(default)]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeActionKind {
    ClosePosition,
    ModifyPosition,
    RemoveOrder,
    ModifyOrder,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeActionMsg {
    pub action: TradeActionKind,
    #[serde(alias = "ticket")]
    pub controller_ticket: i64,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub price_open: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeActionsBulkMsg {
    #[serde(default)]
    pub actions: Vec<TradeActionMsg>,
}

/// Every inbound message type the broker understands.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Hello(HelloMsg),
    Status(StatusMsg),
    Error(ErrorMsg),
    Deinit(DeinitMsg),
    Tick(TickMsg),
    AccountInfo(AccountInfoMsg),
    TradesLive(TradesLiveMsg),
    TradesHistory(TradesHistoryMsg),
    TradeResponse(TradeResponseMsg),
    BrokerTime(BrokerTimeMsg),
    TradeAction(TradeActionMsg),
    TradeActionsBulk(TradeActionsBulkMsg),
}

impl Inbound {
    pub fn type_name(&self) -> &'static str {
        match self {
            Inbound::Hello(_) => "hello",
            Inbound::Status(_) => "status",
            Inbound::Error(_) => "error",
            Inbound::Deinit(_) => "deinit",
            Inbound::Tick(_) => "tick",
            Inbound::AccountInfo(_) => "account_info",
            Inbound::TradesLive(_) => "trades_live",
            Inbound::TradesHistory(_) => "trades_history",
            Inbound::TradeResponse(_) => "trade_response",
            Inbound::BrokerTime(_) => "broker_time",
            Inbound::TradeAction(_) => "trade_action",
            Inbound::TradeActionsBulk(_) => "trade_actions_bulk",
        }
    }
}

const KNOWN_TYPES: &[&str] = &[
    "hello",
    "status",
    "error",
    "deinit",
    "tick",
    "account_info",
    "trades_live",
    "trades_history",
    "trade_response",
    "broker_time",
    "trade_action",
    "trade_actions_bulk",
];

/// Classify a raw message. Unknown `type` values are ignored without noise;
/// a known type that fails to deserialize is logged and dropped.
pub fn parse_inbound(raw: &Value) -> Option<Inbound> {
    let msg_type = raw.get("type").and_then(Value::as_str)?;
    if !KNOWN_TYPES.contains(&msg_type) {
        return None;
    }
    match Inbound::deserialize(raw) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(msg_type, error = %e, "dropping malformed message body");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestSubtype {
    #[serde(rename = "Request_Open.Pos")]
    OpenPosition,
    #[serde(rename = "Request_Open.Ord")]
    OpenOrder,
    #[serde(rename = "Request_Exit.Pos")]
    ExitPosition,
    #[serde(rename = "Request_Exit.Ord")]
    ExitOrder,
    #[serde(rename = "Request_Modify.Pos")]
    ModifyPosition,
    #[serde(rename = "Request_Modify.Ord")]
    ModifyOrder,
}

impl RequestSubtype {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestSubtype::OpenPosition => "Request_Open.Pos",
            RequestSubtype::OpenOrder => "Request_Open.Ord",
            RequestSubtype::ExitPosition => "Request_Exit.Pos",
            RequestSubtype::ExitOrder => "Request_Exit.Ord",
            RequestSubtype::ModifyPosition => "Request_Modify.Pos",
            RequestSubtype::ModifyOrder => "Request_Modify.Ord",
        }
    }
}

/// Outbound `trade_request` frame sent to a Prop EA.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub subtype: RequestSubtype,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller_ticket: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_seconds: Option<f64>,
    pub data: Value,
    pub timestamp: i64,
}

impl TradeRequest {
    fn new(subtype: RequestSubtype, data: Value) -> Self {
        Self {
            msg_type: "trade_request",
            subtype,
            request_id: Uuid::new_v4().simple().to_string(),
            controller_ticket: None,
            jitter_seconds: None,
            data,
            timestamp: now_ms(),
        }
    }

    pub fn open_position(pos: &Position, jitter_seconds: f64) -> Self {
        let mut req = Self::new(
            RequestSubtype::OpenPosition,
            json!({
                "symbol": pos.symbol,
                "type": pos.kind,
                "volume": pos.volume,
                "stopLoss": pos.stop_loss,
                "takeProfit": pos.take_profit,
                "comment": format!("Copy:{}", pos.ticket),
            }),
        );
        req.controller_ticket = Some(pos.ticket);
        req.jitter_seconds = Some(jitter_seconds);
        req
    }

    pub fn open_order(order: &PendingOrder, price_open: Decimal, jitter_seconds: f64) -> Self {
        let mut req = Self::new(
            RequestSubtype::OpenOrder,
            json!({
                "symbol": order.symbol,
                "type": order.kind,
                "volume": order.volume,
                "priceOpen": price_open,
                "stopLoss": order.stop_loss,
                "takeProfit": order.take_profit,
                "comment": format!("Copy:{}", order.ticket),
            }),
        );
        req.controller_ticket = Some(order.ticket);
        req.jitter_seconds = Some(jitter_seconds);
        req
    }

    pub fn exit_position(ticket: i64) -> Self {
        let mut req = Self::new(RequestSubtype::ExitPosition, json!({ "ticket": ticket }));
        req.controller_ticket = Some(ticket);
        req
    }

    pub fn exit_order(ticket: i64) -> Self {
        let mut req = Self::new(RequestSubtype::ExitOrder, json!({ "ticket": ticket }));
        req.controller_ticket = Some(ticket);
        req
    }

    pub fn modify_position(
        ticket: i64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        let mut req = Self::new(
            RequestSubtype::ModifyPosition,
            json!({
                "ticket": ticket,
                "stopLoss": stop_loss,
                "takeProfit": take_profit,
            }),
        );
        req.controller_ticket = Some(ticket);
        req
    }

    pub fn modify_order(
        ticket: i64,
        price_open: Option<Decimal>,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        let mut req = Self::new(
            RequestSubtype::ModifyOrder,
            json!({
                "ticket": ticket,
                "priceOpen": price_open,
                "stopLoss": stop_loss,
                "takeProfit": take_profit,
            }),
        );
        req.controller_ticket = Some(ticket);
        req
    }
}

/// Error frame sent before closing a rejected connection. EAs branch on
/// `reason`.
pub fn error_frame(reason: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "reason": reason,
        "message": message,
        "timestamp": now_ms(),
    })
}

/// Acknowledgement for a fanned-out trade action.
pub fn trade_action_ack(action: TradeActionKind, controller_ticket: i64, delivered: usize) -> Value {
    json!({
        "type": "trade_action_ack",
        "action": action,
        "controllerTicket": controller_ticket,
        "delivered": delivered,
        "timestamp": now_ms(),
    })
}
