//! TCP accept loop and per-connection plumbing.
//!
//! Each accepted socket gets a writer task draining the handle's command
//! channel and a reader loop that frames, authenticates, rate-limits, and
//! dispatches messages. Protocol violations (oversized frame, malformed
//! JSON, bad signature) close the connection; rate-limit violations drop
//! the message and keep the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::collaborators::AuditEntry;
use crate::protocol::{now_ms, parse_inbound};
use crate::registry::{ConnHandle, WriterCmd};
use crate::router::dispatch;
use crate::wire::{is_exempt, read_frame, verify_message};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn run(broker: Arc<Broker>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", broker.config.tcp_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "broker listening");

    loop {
        if broker.is_shutting_down() {
            return Ok(());
        }
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id, %peer, "connection accepted");

        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            handle_connection(broker, stream, conn_id, peer.to_string()).await;
        });
    }
}

async fn writer_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriterCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            WriterCmd::Shutdown { flush_delay } => {
                // Drain anything already queued, give the peer time to read,
                // then close the write half.
                while let Ok(WriterCmd::Frame(bytes)) = rx.try_recv() {
                    if write_half.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(flush_delay).await;
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream, conn_id: u64, peer: String) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id, error = %e, "set_nodelay failed");
    }
    let (mut read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ConnHandle::new(conn_id, peer.clone(), tx);
    let writer = tokio::spawn(writer_loop(write_half, rx));

    // Pre-hello messages still need a session to land in.
    broker.registry.bind_unvalidated(conn_id, handle.clone()).await;

    // Rate buckets are keyed by the sender's claimed id, which need not
    // match the session's eaId; remember it so cleanup frees the right one.
    let mut limiter_key: Option<String> = None;

    loop {
        let payload = match read_frame(&mut read_half, broker.config.max_frame_bytes).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(conn_id, "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(conn_id, %peer, error = %e, "closing on framing error");
                break;
            }
        };

        let raw: Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn_id, %peer, error = %e, "closing on malformed json");
                break;
            }
        };

        if let Err(e) = verify_message(
            &raw,
            broker.config.shared_secret.as_deref(),
            broker.config.timestamp_window_ms,
            now_ms(),
        ) {
            warn!(conn_id, %peer, error = %e, "closing on auth failure");
            break;
        }

        let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
        if !is_exempt(msg_type) {
            let sender = raw
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("conn-{conn_id}"));
            let allowed = broker.limiter.check(&sender);
            if !allowed {
                // Dropped silently; the sender gets no feedback.
                debug!(conn_id, %sender, msg_type, "rate limit exceeded, dropping");
            }
            limiter_key = Some(sender);
            if !allowed {
                continue;
            }
        }

        let Some(msg) = parse_inbound(&raw) else {
            continue;
        };
        dispatch(&broker, &handle, msg).await;
        if !handle.is_alive() {
            // Handshake rejection queued a close; stop reading.
            break;
        }
    }

    handle.mark_dead();
    if let Some(sender) = limiter_key {
        broker.limiter.clear(&sender);
    }
    if let Some(key) = broker.registry.mark_conn_disconnected(conn_id).await {
        broker.record_audit(AuditEntry::ea_disconnected(&key)).await;
        broker.broadcast("ea_disconnected", serde_json::to_value(&key).unwrap_or_default());
    }
    drop(handle);
    let _ = writer.await;
    debug!(conn_id, %peer, "connection closed");
}
