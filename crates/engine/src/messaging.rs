//! Named-channel message bus.
//!
//! The engine announces structural changes (field paths appearing or leaving,
//! configuration loads, operation lifecycle transitions) without knowing who
//! listens. Two delivery styles are offered:
//!
//! - synchronous handlers registered per [`MessageChannel`], invoked in
//!   registration order on the publishing task so that index maintenance
//!   finishes before the publishing call returns;
//! - a Tokio broadcast feed for async consumers such as front-ends.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use quoteflow_types::OperationStatus;
use tokio::sync::broadcast;
use tracing::trace;

use crate::reactive::lock_unpoisoned;

/// Default capacity of the async broadcast feed.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 256;

/// Channel names a message can be published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageChannel {
    FieldPathAdded,
    FieldPathRemoved,
    ConfigurationLoaded,
    ConfigurationUpdated,
    OperationLifecycle,
}

/// Payload carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    FieldPathAdded { path: String },
    FieldPathRemoved { path: String },
    ConfigurationLoaded { product: Option<String> },
    ConfigurationUpdated { product: Option<String> },
    OperationStatusChanged {
        operation_id: u64,
        name: String,
        status: OperationStatus,
        at: DateTime<Utc>,
    },
}

impl EngineMessage {
    /// The channel this message belongs to.
    pub fn channel(&self) -> MessageChannel {
        match self {
            Self::FieldPathAdded { .. } => MessageChannel::FieldPathAdded,
            Self::FieldPathRemoved { .. } => MessageChannel::FieldPathRemoved,
            Self::ConfigurationLoaded { .. } => MessageChannel::ConfigurationLoaded,
            Self::ConfigurationUpdated { .. } => MessageChannel::ConfigurationUpdated,
            Self::OperationStatusChanged { .. } => MessageChannel::OperationLifecycle,
        }
    }
}

type MessageHandler = Arc<dyn Fn(&EngineMessage) + Send + Sync>;

/// Identifies a registered handler so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerTable {
    next_id: u64,
    handlers: Vec<(HandlerId, MessageChannel, MessageHandler)>,
}

/// Process-wide message bus shared through the engine context.
#[derive(Clone)]
pub struct MessageBus {
    handlers: Arc<Mutex<HandlerTable>>,
    feed: broadcast::Sender<EngineMessage>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = lock_unpoisoned(&self.handlers);
        f.debug_struct("MessageBus")
            .field("handlers", &table.handlers.len())
            .field("listeners", &self.feed.receiver_count())
            .finish()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_CAPACITY)
    }
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (feed, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            handlers: Arc::new(Mutex::new(HandlerTable {
                next_id: 0,
                handlers: Vec::new(),
            })),
            feed,
        }
    }

    /// Registers a synchronous handler for one channel.
    pub fn subscribe<F>(&self, channel: MessageChannel, handler: F) -> HandlerId
    where
        F: Fn(&EngineMessage) + Send + Sync + 'static,
    {
        let mut table = lock_unpoisoned(&self.handlers);
        table.next_id += 1;
        let id = HandlerId(table.next_id);
        table.handlers.push((id, channel, Arc::new(handler)));
        id
    }

    /// Removes a handler; returns false when it was not registered.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut table = lock_unpoisoned(&self.handlers);
        let before = table.handlers.len();
        table.handlers.retain(|(handler_id, _, _)| *handler_id != id);
        table.handlers.len() != before
    }

    /// Opens an async feed of every message published from now on.
    pub fn listen(&self) -> broadcast::Receiver<EngineMessage> {
        self.feed.subscribe()
    }

    /// Delivers `message` to its channel's handlers, then to async listeners.
    pub fn publish(&self, message: EngineMessage) {
        let channel = message.channel();
        let handlers = {
            let table = lock_unpoisoned(&self.handlers);
            table
                .handlers
                .iter()
                .filter(|(_, handler_channel, _)| *handler_channel == channel)
                .map(|(_, _, handler)| Arc::clone(handler))
                .collect::<Vec<_>>()
        };
        trace!(?channel, handler_count = handlers.len(), "publishing engine message");
        for handler in handlers {
            handler(&message);
        }
        // No async listener is not an error.
        let _ = self.feed.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_only_receive_their_channel() {
        let bus = MessageBus::default();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bus.subscribe(MessageChannel::FieldPathAdded, move |message| {
            sink.lock().unwrap().push(message.clone());
        });

        bus.publish(EngineMessage::FieldPathRemoved { path: "a".into() });
        bus.publish(EngineMessage::FieldPathAdded { path: "b".into() });

        assert_eq!(*received.lock().unwrap(), vec![EngineMessage::FieldPathAdded { path: "b".into() }]);
    }

    #[test]
    fn unsubscribed_handlers_stop_receiving() {
        let bus = MessageBus::default();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let id = bus.subscribe(MessageChannel::ConfigurationUpdated, move |_| *counter.lock().unwrap() += 1);

        bus.publish(EngineMessage::ConfigurationUpdated { product: None });
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(EngineMessage::ConfigurationUpdated { product: None });

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn async_listeners_see_every_channel() {
        let bus = MessageBus::new(8);
        let mut feed = bus.listen();
        bus.publish(EngineMessage::ConfigurationLoaded {
            product: Some("home".into()),
        });
        let message = feed.recv().await.expect("message");
        assert_eq!(message.channel(), MessageChannel::ConfigurationLoaded);
    }
}
