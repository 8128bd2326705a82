//! Inter-Layer Message Queues
//!
//! Fire-and-forget message delivery between layer worker tasks. Senders are
//! usable from synchronous code; receivers are drained by async tasks.

use tokio::sync::mpsc;
use tracing::trace;

use crate::message_types::LayerMessage;
use crate::InterfaceError;

/// Create a named message queue
pub fn message_queue(name: &str) -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MessageSender {
            name: name.to_string(),
            tx,
        },
        MessageReceiver {
            name: name.to_string(),
            rx,
        },
    )
}

/// Sending half of a message queue
#[derive(Debug, Clone)]
pub struct MessageSender {
    name: String,
    tx: mpsc::UnboundedSender<LayerMessage>,
}

impl MessageSender {
    /// Post a message without waiting for the consumer
    pub fn send(&self, msg: LayerMessage) -> Result<(), InterfaceError> {
        trace!("{} <- {:?}", self.name, msg);
        self.tx
            .send(msg)
            .map_err(|_| InterfaceError::QueueClosed(self.name.clone()))
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Receiving half of a message queue
#[derive(Debug)]
pub struct MessageReceiver {
    name: String,
    rx: mpsc::UnboundedReceiver<LayerMessage>,
}

impl MessageReceiver {
    /// Wait for the next message, `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<LayerMessage> {
        self.rx.recv().await
    }

    /// Take the next message if one is pending
    pub fn try_recv(&mut self) -> Option<LayerMessage> {
        self.rx.try_recv().ok()
    }

    /// Take every pending message
    pub fn drain(&mut self) -> Vec<LayerMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }
}
