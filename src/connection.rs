//! # In-Process Connection Hub
//!
//! [`ConnectionHub`] is a [`Connection`] implementation that owns the two
//! tables every transport needs on the client side:
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | Handlers | `ControlKind` | Fan inbound control messages out to registered channels |
//! | Request handles | `RequestId` | Admit unicast traffic only for outstanding requests |
//!
//! A transport decodes frames into [`ControlMessage`]s and calls
//! [`ConnectionHub::dispatch`]; it drains outbound [`ControlRequest`]s from the
//! receiver returned by [`ConnectionHub::new`]. Tests drive the hub directly
//! in place of a transport.
//!
//! Many resend sub-streams share one hub concurrently, so handles are
//! added and removed independently per request id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::messages::{ControlKind, ControlMessage, ControlRequest, RequestId};
use crate::protocols::{Connection, HandlerId};

/// Capacity of the outbound request channel.
pub const OUTBOUND_CHANNEL_SIZE: usize = 1024;

/// Maximum outstanding request handles.
/// SECURITY: Bounds the handle table if callers leak requests.
pub const MAX_REQUEST_HANDLES: usize = 10_000;

type HandlerTable = HashMap<ControlKind, Vec<(HandlerId, mpsc::Sender<ControlMessage>)>>;

pub struct ConnectionHub {
    handlers: StdMutex<HandlerTable>,
    next_handler_id: AtomicU64,
    request_handles: StdMutex<HashSet<RequestId>>,
    outbound_tx: mpsc::Sender<ControlRequest>,
}

impl ConnectionHub {
    /// Create a hub and the receiver for the requests it sends.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ControlRequest>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let hub = Self {
            handlers: StdMutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            request_handles: StdMutex::new(HashSet::new()),
            outbound_tx,
        };
        (Arc::new(hub), outbound_rx)
    }

    /// Deliver an inbound message to every handler registered for its kind.
    ///
    /// Unicast messages are dropped unless their request handle is held.
    /// Handlers whose receiver is gone are pruned. Returns the number of
    /// handlers that accepted the message.
    pub async fn dispatch(&self, message: ControlMessage) -> usize {
        if let ControlMessage::UnicastMessage { request_id, .. } = &message
            && !self.has_request_handle(request_id)
        {
            trace!(request_id = %request_id, "dropping unicast message without request handle");
            return 0;
        }

        let kind = message.kind();
        let targets: Vec<(HandlerId, mpsc::Sender<ControlMessage>)> = match self.handlers.lock() {
            Ok(guard) => guard.get(&kind).cloned().unwrap_or_default(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, handler) in targets {
            if handler.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        for id in closed {
            debug!(kind = ?kind, handler = id, "pruning closed handler");
            self.off(kind, id);
        }

        delivered
    }

    pub fn handler_count(&self, kind: ControlKind) -> usize {
        self.handlers
            .lock()
            .map(|guard| guard.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub fn has_request_handle(&self, request_id: &str) -> bool {
        self.request_handles
            .lock()
            .map(|guard| guard.contains(request_id))
            .unwrap_or(false)
    }

    pub fn request_handle_count(&self) -> usize {
        self.request_handles.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Connection for ConnectionHub {
    fn on(&self, kind: ControlKind, handler: mpsc::Sender<ControlMessage>) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.handlers.lock() {
            guard.entry(kind).or_default().push((id, handler));
        }
        id
    }

    fn off(&self, kind: ControlKind, id: HandlerId) {
        if let Ok(mut guard) = self.handlers.lock()
            && let Some(list) = guard.get_mut(&kind)
        {
            list.retain(|(handler_id, _)| *handler_id != id);
            if list.is_empty() {
                guard.remove(&kind);
            }
        }
    }

    async fn add_request_handle(&self, request_id: &str) -> Result<()> {
        let mut guard = self
            .request_handles
            .lock()
            .map_err(|_| anyhow::anyhow!("request handle table poisoned"))?;
        if guard.len() >= MAX_REQUEST_HANDLES && !guard.contains(request_id) {
            anyhow::bail!("request handle table full ({} entries)", MAX_REQUEST_HANDLES);
        }
        guard.insert(request_id.to_string());
        Ok(())
    }

    async fn remove_request_handle(&self, request_id: &str) -> Result<()> {
        let mut guard = self
            .request_handles
            .lock()
            .map_err(|_| anyhow::anyhow!("request handle table poisoned"))?;
        guard.remove(request_id);
        Ok(())
    }

    async fn send(&self, request: ControlRequest) -> Result<()> {
        trace!(request_id = %request.request_id(), "sending control request");
        self.outbound_tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}
