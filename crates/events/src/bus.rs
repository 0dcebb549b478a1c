//! Message publishing/subscription abstraction (mechanics only).
//!
//! ## Delivery
//!
//! - **Broadcast**: every live subscription receives every message.
//! - **At-least-once**: consumers must tolerate duplicates. Claim updates are
//!   naturally idempotent (older or equal versions are no-ops).
//! - **No persistence**: a node that is not subscribed misses messages; the
//!   periodic digest exchange repairs that.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("bus closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
}

/// A subscription to the bus.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

/// Transport-agnostic pub/sub.
///
/// `publish` never blocks; it returns how many subscribers were reached.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<usize, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
