//! Request/response correlation between outbound trade requests and the
//! Prop EA replies that answer them.
//!
//! Each send registers the request id, delivers the frame, and arms a
//! per-request timeout. Whichever of reply/timeout fires first completes
//! the entry; the loser finds the id gone and does nothing, so a request
//! resolves at most once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::protocol::{RequestSubtype, TradeRequest, TradeResponseMsg};
use crate::registry::ConnHandle;

/// Hook run when a request resolves, after the entry leaves the pending
/// table but before the waiter's oneshot fires. State transitions keyed to
/// the outcome are therefore visible the moment the id stops being pending.
pub type Completion =
    Box<dyn FnOnce(TradeOutcome) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeOutcome {
    Success { remote_ticket: Option<i64> },
    Failed { error: String },
    TimedOut,
    /// The frame never reached the Prop EA's socket.
    SendFailed,
}

impl TradeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TradeOutcome::Success { .. })
    }
}

struct PendingEntry {
    subtype: RequestSubtype,
    target_ea_id: String,
    issued_at: Instant,
    done: oneshot::Sender<TradeOutcome>,
    on_done: Option<Completion>,
}

struct Inner {
    pending: Mutex<HashMap<String, PendingEntry>>,
    default_timeout: Duration,
}

#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                default_timeout,
            }),
        }
    }

    /// Deliver a trade request to a Prop EA and return a receiver that
    /// resolves with the outcome. Timeout stretches with the request's
    /// jitter so a deliberately delayed fill is not misreported as dead.
    pub async fn send(
        &self,
        target: &ConnHandle,
        target_ea_id: &str,
        request: &TradeRequest,
    ) -> oneshot::Receiver<TradeOutcome> {
        self.send_with_completion(target, target_ea_id, request, None)
            .await
    }

    /// Like [`Correlator::send`], with a hook run synchronously when the
    /// request resolves.
    pub async fn send_with_completion(
        &self,
        target: &ConnHandle,
        target_ea_id: &str,
        request: &TradeRequest,
        on_done: Option<Completion>,
    ) -> oneshot::Receiver<TradeOutcome> {
        let (done, rx) = oneshot::channel();

        let timeout = match request.jitter_seconds {
            Some(j) if j > 0.0 => Duration::from_millis((j * 1000.0) as u64 + 5000),
            _ => self.inner.default_timeout,
        };

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(
                request.request_id.clone(),
                PendingEntry {
                    subtype: request.subtype,
                    target_ea_id: target_ea_id.to_string(),
                    issued_at: Instant::now(),
                    done,
                    on_done,
                },
            );
        }

        if !target.send_json(request) {
            self.complete(&request.request_id, TradeOutcome::SendFailed)
                .await;
            return rx;
        }
        debug!(
            request_id = %request.request_id,
            subtype = request.subtype.as_str(),
            ea_id = target_ea_id,
            timeout_ms = timeout.as_millis() as u64,
            "trade request dispatched"
        );

        let correlator = self.clone();
        let request_id = request.request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.complete(&request_id, TradeOutcome::TimedOut).await;
        });

        rx
    }

    /// Resolve a pending entry. A no-op when the id already resolved.
    async fn complete(&self, request_id: &str, outcome: TradeOutcome) {
        let entry = {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(request_id)
        };
        let Some(entry) = entry else { return };
        if matches!(outcome, TradeOutcome::TimedOut) {
            warn!(
                request_id,
                subtype = entry.subtype.as_str(),
                ea_id = %entry.target_ea_id,
                "trade request timed out"
            );
        }
        if let Some(hook) = entry.on_done {
            hook(outcome.clone()).await;
        }
        // Receiver may have been dropped; nothing to do then.
        let _ = entry.done.send(outcome);
    }

    /// Route an inbound `trade_response` to its waiter.
    pub async fn on_response(&self, resp: &TradeResponseMsg) {
        let entry = {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(&resp.request_id)
        };
        let Some(entry) = entry else {
            warn!(request_id = %resp.request_id, "response for unknown or expired request");
            return;
        };
        let latency_ms = entry.issued_at.elapsed().as_millis() as u64;
        info!(
            request_id = %resp.request_id,
            subtype = entry.subtype.as_str(),
            ea_id = %entry.target_ea_id,
            status = %resp.status,
            latency_ms,
            "trade response"
        );
        let outcome = if resp.status == "success" {
            TradeOutcome::Success {
                remote_ticket: resp.ticket,
            }
        } else {
            TradeOutcome::Failed {
                error: resp
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("status {}", resp.status)),
            }
        };
        if let Some(hook) = entry.on_done {
            hook(outcome.clone()).await;
        }
        let _ = entry.done.send(outcome);
    }

    /// Any request still in flight against `request_ids`?
    pub async fn has_any_pending(&self, request_ids: &[String]) -> bool {
        let pending = self.inner.pending.lock().await;
        request_ids.iter().any(|id| pending.contains_key(id))
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Backstop sweep for entries whose timeout task was lost (shutdown
    /// races). Entries older than twice the default timeout are expired.
    pub async fn sweep_stale(&self) {
        let cutoff = self.inner.default_timeout * 2;
        let stale: Vec<String> = {
            let pending = self.inner.pending.lock().await;
            pending
                .iter()
                .filter(|(_, e)| e.issued_at.elapsed() > cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            self.complete(&id, TradeOutcome::TimedOut).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Position, TradeRequest};
    use crate::registry::handle::test_support::{conn_pair, next_frame_json};
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position {
            ticket: 555,
            symbol: "EURUSD".into(),
            kind: "buy".into(),
            volume: dec!(0.10),
            stop_loss: None,
            take_profit: None,
        }
    }

    fn response(request_id: &str, status: &str, ticket: Option<i64>) -> TradeResponseMsg {
        TradeResponseMsg {
            request_id: request_id.to_string(),
            status: status.to_string(),
            ticket,
            error: None,
        }
    }

    #[tokio::test]
    async fn success_response_resolves_the_waiter() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (conn, mut rx_frames) = conn_pair(1);
        let req = TradeRequest::open_position(&position(), 0.0);
        let request_id = req.request_id.clone();

        let rx = correlator.send(&conn, "EA-P", &req).await;
        let frame = next_frame_json(&mut rx_frames).unwrap();
        assert_eq!(frame["requestId"], request_id.as_str());

        correlator.on_response(&response(&request_id, "success", Some(999))).await;
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, TradeOutcome::Success { remote_ticket: Some(999) });
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn failed_response_carries_the_error() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (conn, _rx_frames) = conn_pair(1);
        let req = TradeRequest::exit_position(42);
        let request_id = req.request_id.clone();

        let rx = correlator.send(&conn, "EA-P", &req).await;
        let mut resp = response(&request_id, "failed", None);
        resp.error = Some("market closed".to_string());
        correlator.on_response(&resp).await;

        assert_eq!(
            rx.await.unwrap(),
            TradeOutcome::Failed { error: "market closed".to_string() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_no_response_arrives() {
        let correlator = Correlator::new(Duration::from_millis(100));
        let (conn, _rx_frames) = conn_pair(1);
        let req = TradeRequest::exit_position(42);

        let rx = correlator.send(&conn, "EA-P", &req).await;
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(rx.await.unwrap(), TradeOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_ignored() {
        let correlator = Correlator::new(Duration::from_millis(100));
        let (conn, _rx_frames) = conn_pair(1);
        let req = TradeRequest::exit_position(42);
        let request_id = req.request_id.clone();

        let rx = correlator.send(&conn, "EA-P", &req).await;
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(rx.await.unwrap(), TradeOutcome::TimedOut);

        // Resolved once; the id is gone and the late reply is dropped.
        correlator.on_response(&response(&request_id, "success", Some(1))).await;
        assert_eq!(correlator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_extends_the_timeout() {
        let correlator = Correlator::new(Duration::from_millis(100));
        let (conn, _rx_frames) = conn_pair(1);
        let mut req = TradeRequest::exit_position(42);
        req.jitter_seconds = Some(2.0);
        let request_id = req.request_id.clone();

        let _rx = correlator.send(&conn, "EA-P", &req).await;
        // Past the default timeout but inside jitter*1000 + 5000.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(correlator.has_any_pending(&[request_id]).await);
    }

    #[tokio::test]
    async fn dead_connection_resolves_send_failed() {
        let correlator = Correlator::new(Duration::from_secs(5));
        let (conn, rx_frames) = conn_pair(1);
        drop(rx_frames);

        let req = TradeRequest::exit_position(42);
        let rx = correlator.send(&conn, "EA-P", &req).await;
        assert_eq!(rx.await.unwrap(), TradeOutcome::SendFailed);
    }

    #[tokio::test]
    async fn unknown_response_is_ignored() {
        let correlator = Correlator::new(Duration::from_secs(5));
        correlator.on_response(&response("nope", "success", None)).await;
        assert_eq!(correlator.pending_count().await, 0);
    }
}
