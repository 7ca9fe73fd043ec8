//! Cheap clonable handle for writing to a live connection.
//!
//! Frames are pushed onto an unbounded channel drained by the connection's
//! writer task, so session code never blocks on a slow socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::encode_frame;

#[derive(Debug)]
pub enum WriterCmd {
    Frame(Vec<u8>),
    /// Flush for `flush_delay`, then shut down the write half.
    Shutdown { flush_delay: Duration },
}

#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: u64,
    pub peer: String,
    tx: mpsc::UnboundedSender<WriterCmd>,
    alive: Arc<AtomicBool>,
}

impl ConnHandle {
    pub fn new(id: u64, peer: String, tx: mpsc::UnboundedSender<WriterCmd>) -> Self {
        Self {
            id,
            peer,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A handle is alive until the socket closes or a shutdown is queued.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Serialize and queue one framed JSON message. Returns false when the
    /// connection is already gone.
    pub fn send_json<T: Serialize>(&self, msg: &T) -> bool {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                debug!(conn_id = self.id, error = %e, "failed to serialize outbound frame");
                return false;
            }
        };
        self.tx.send(WriterCmd::Frame(encode_frame(&payload))).is_ok()
    }

    /// Queue a graceful close. The handle reports dead immediately; the
    /// writer keeps draining for `flush_delay` so a final error frame can
    /// reach the peer.
    pub fn close_after(&self, flush_delay: Duration) {
        self.alive.store(false, Ordering::Release);
        let _ = self.tx.send(WriterCmd::Shutdown { flush_delay });
    }

    /// Mark the handle dead without queuing anything (reader saw EOF).
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}
