//! Ingress queue for off-chain messages awaiting the next unanimous round.
//!
//! The queue is owned by a single task and every operation arrives as a
//! typed command on one channel, so the owner observes a total order. The
//! command set is closed: there is no unhandled-request case.

use crate::types::OffchainMessage;
use tokio::sync::{mpsc, oneshot};

enum QueueCommand {
    Send(OffchainMessage),
    Return(Vec<OffchainMessage>),
    Fetch(oneshot::Sender<Vec<OffchainMessage>>),
    HasMessages(oneshot::Sender<bool>),
}

/// Cloneable access to the queue task.
#[derive(Clone)]
pub struct QueueHandle {
    commands: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    /// Append a message at the tail.
    pub async fn send(&self, message: OffchainMessage) {
        let _ = self.commands.send(QueueCommand::Send(message)).await;
    }

    /// Put a drained batch back at the head, preserving its internal order.
    /// A failed round must return its batch before the controller processes
    /// anything else, so returned messages precede later arrivals.
    pub async fn return_batch(&self, batch: Vec<OffchainMessage>) {
        let _ = self.commands.send(QueueCommand::Return(batch)).await;
    }

    /// Atomically drain the entire queue.
    pub async fn fetch(&self) -> Vec<OffchainMessage> {
        let (reply, receiver) = oneshot::channel();
        if self
            .commands
            .send(QueueCommand::Fetch(reply))
            .await
            .is_err()
        {
            return Vec::new();
        }
        receiver.await.unwrap_or_default()
    }

    /// Non-destructive emptiness check.
    pub async fn has_messages(&self) -> bool {
        let (reply, receiver) = oneshot::channel();
        if self
            .commands
            .send(QueueCommand::HasMessages(reply))
            .await
            .is_err()
        {
            return false;
        }
        receiver.await.unwrap_or(false)
    }
}

/// The queue task. Runs until every handle is dropped.
pub struct MessageQueue {
    commands: mpsc::Receiver<QueueCommand>,
    queued: Vec<OffchainMessage>,
}

impl MessageQueue {
    pub fn new() -> (QueueHandle, MessageQueue) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        (
            QueueHandle {
                commands: commands_tx,
            },
            MessageQueue {
                commands: commands_rx,
                queued: Vec::new(),
            },
        )
    }

    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                QueueCommand::Send(message) => self.queued.push(message),
                QueueCommand::Return(mut batch) => {
                    batch.append(&mut self.queued);
                    self.queued = batch;
                }
                QueueCommand::Fetch(reply) => {
                    let _ = reply.send(std::mem::take(&mut self.queued));
                }
                QueueCommand::HasMessages(reply) => {
                    let _ = reply.send(!self.queued.is_empty());
                }
            }
        }
    }
}
