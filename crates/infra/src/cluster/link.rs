//! Request/reply on top of the broadcast system bus.
//!
//! Replies are addressed to a per-request inbox. Whoever reads the bus
//! subscription hands inbox messages to [`ClusterLink::dispatch_reply`],
//! which forwards them to the waiting request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use keyward_core::{TrustError, TrustResult};
use keyward_events::{BusError, EventBus, Subscription, SystemMessage, subjects};

/// The shared system-account bus.
pub type SystemBus = Arc<dyn EventBus<SystemMessage, Error = BusError>>;

#[derive(Clone)]
pub struct ClusterLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    node: String,
    bus: SystemBus,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<SystemMessage>>>,
}

/// Unregisters an inbox when the request finishes or is cancelled.
struct PendingInbox<'a> {
    link: &'a ClusterLink,
    inbox: String,
    replies: mpsc::UnboundedReceiver<SystemMessage>,
}

impl Drop for PendingInbox<'_> {
    fn drop(&mut self) {
        self.link.inner.pending.lock().remove(&self.inbox);
    }
}

impl ClusterLink {
    pub fn new(node: impl Into<String>, bus: SystemBus) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                node: node.into(),
                bus,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Name of this node; the origin of everything it sends.
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    pub fn subscribe(&self) -> Subscription<SystemMessage> {
        self.inner.bus.subscribe()
    }

    fn send(&self, message: SystemMessage) -> TrustResult<()> {
        self.inner
            .bus
            .publish(message)
            .map(|_| ())
            .map_err(|e| TrustError::fetch_failed(format!("system bus: {e}")))
    }

    pub fn publish(&self, subject: &str, payload: impl Into<String>) -> TrustResult<()> {
        self.send(SystemMessage::new(subject, self.node(), payload))
    }

    fn open_inbox(&self) -> PendingInbox<'_> {
        let inbox = subjects::new_inbox(self.node());
        let (tx, replies) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(inbox.clone(), tx);
        PendingInbox {
            link: self,
            inbox,
            replies,
        }
    }

    /// Publish a request and wait for the first reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> TrustResult<SystemMessage> {
        let mut pending = self.open_inbox();
        self.send(SystemMessage::new(subject, self.node(), payload).with_reply(pending.inbox.clone()))?;
        match tokio::time::timeout(timeout, pending.replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TrustError::fetch_failed("system bus closed")),
            Err(_) => Err(TrustError::fetch_failed(format!("request {subject} timed out"))),
        }
    }

    /// Publish a request and collect every reply arriving within `window`.
    pub async fn request_many(
        &self,
        subject: &str,
        payload: impl Into<String>,
        window: Duration,
    ) -> TrustResult<Vec<SystemMessage>> {
        let mut pending = self.open_inbox();
        self.send(SystemMessage::new(subject, self.node(), payload).with_reply(pending.inbox.clone()))?;
        let deadline = tokio::time::Instant::now() + window;
        let mut replies = Vec::new();
        while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, pending.replies.recv()).await {
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Answer a request.
    pub fn reply(&self, inbox: &str, payload: impl Into<String>) -> TrustResult<()> {
        self.publish(inbox, payload)
    }

    /// Route an inbox message to its waiting request. Returns whether one was
    /// waiting.
    pub fn dispatch_reply(&self, message: SystemMessage) -> bool {
        let pending = self.inner.pending.lock();
        match pending.get(message.subject()) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl core::fmt::Debug for ClusterLink {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClusterLink")
            .field("node", &self.inner.node)
            .field("pending", &self.inner.pending.lock().len())
            .finish_non_exhaustive()
    }
}
