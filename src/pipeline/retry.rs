//! Delayed Retry Scheduling
//!
//! Failed archival attempts are re-submitted through a [`RetryQueue`]. Any
//! at-least-once delayed queue can implement the trait; [`LocalRetryQueue`]
//! keeps messages in process with a `DelayQueue`.

use super::context::ArchiverContext;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

/// Message re-submitting a context after a delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMessage {
    pub context: ArchiverContext,
    /// Retries consumed including this one
    pub retry_count: u32,
    /// Delay before the message is delivered
    pub delay_millis: u64,
}

/// Delayed delivery of retry messages
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Deliver `message` after its delay
    async fn schedule(&self, message: RetryMessage) -> Result<()>;

    /// Stop accepting messages; already scheduled ones are still delivered
    async fn close(&self);
}

/// Consumer of delivered retry messages
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn handle(&self, message: RetryMessage);
}

// =============================================================================
// Local Retry Queue
// =============================================================================

/// In-process retry queue
pub struct LocalRetryQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<RetryMessage>>>,
}

impl LocalRetryQueue {
    /// Create the queue and the receiver to hand to [`LocalRetryQueue::spawn_worker`]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RetryMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Run the delivery loop on the current runtime
    ///
    /// The worker exits once the queue is closed and every message has been
    /// delivered and handled.
    pub fn spawn_worker(
        receiver: mpsc::UnboundedReceiver<RetryMessage>,
        handler: Arc<dyn RetryHandler>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_worker(receiver, handler))
    }
}

#[async_trait]
impl RetryQueue for LocalRetryQueue {
    async fn schedule(&self, message: RetryMessage) -> Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(tx) => tx.send(message).map_err(|_| Error::QueueClosed),
            None => Err(Error::QueueClosed),
        }
    }

    async fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!("Retry queue closed");
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<RetryMessage>,
    handler: Arc<dyn RetryHandler>,
) {
    let mut delayed: DelayQueue<RetryMessage> = DelayQueue::new();
    let mut in_flight = FuturesUnordered::new();
    let mut open = true;

    loop {
        tokio::select! {
            message = receiver.recv(), if open => match message {
                Some(message) => {
                    let delay = Duration::from_millis(message.delay_millis);
                    debug!(
                        container = %message.context.container,
                        retry_count = message.retry_count,
                        delay_ms = message.delay_millis,
                        "Queued archival attempt"
                    );
                    delayed.insert(message, delay);
                }
                None => open = false,
            },
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let handler = handler.clone();
                let message = expired.into_inner();
                in_flight.push(async move { handler.handle(message).await });
            }
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            else => break,
        }
    }
    debug!("Retry worker stopped");
}
