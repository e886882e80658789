//! The per-node processing context and the dispatchers that run inside it.
//!
//! Every inbound message, whether it arrived on a unicast link, a broadcast
//! subscription, or was unicast to self, is funneled into one unbounded queue
//! drained by a single task. The installed [`Dispatch`] therefore never runs
//! concurrently with itself and needs no locking. Dispatchers must not block;
//! long work should be handed to another task.

use std::collections::HashMap;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    channel::{Channel, Messenger},
    message::{Message, NodeUid},
};

/// Receives every message delivered to a node.
pub trait Dispatch: Send + 'static {
    fn dispatch_message(&mut self, message: Message);
}

impl<F> Dispatch for F
where
    F: FnMut(Message) + Send + 'static,
{
    fn dispatch_message(&mut self, message: Message) {
        self(message)
    }
}

/// Default dispatcher installed on new nodes: drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Dispatch for Discard {
    fn dispatch_message(&mut self, message: Message) {
        trace!(from = %message.from, msg_type = %message.msg_type, "no dispatcher installed; message dropped");
    }
}

/// A handler registered on one channel of a [`HandlerRegistry`].
pub trait MessageHandler: Send + 'static {
    /// Returns `false` when this handler does not understand
    /// `message.msg_type`, letting the next handler on the channel try.
    fn receive(&mut self, message: &Message) -> bool;
}

impl<F> MessageHandler for F
where
    F: FnMut(&Message) -> bool + Send + 'static,
{
    fn receive(&mut self, message: &Message) -> bool {
        self(message)
    }
}

/// Dispatcher that routes messages to handlers by channel name.
///
/// Handlers on a channel are offered each message in registration order and
/// the first one that accepts it wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Box<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message_handler(
        &mut self,
        channel: impl Into<String>,
        handler: impl MessageHandler,
    ) -> &mut Self {
        self.handlers
            .entry(channel.into())
            .or_default()
            .push(Box::new(handler));
        self
    }

    pub fn with_handler(mut self, channel: impl Into<String>, handler: impl MessageHandler) -> Self {
        self.add_message_handler(channel, handler);
        self
    }

    /// Registers `handler` for whatever `channel` sends on.
    pub fn add_channel_handler<M: Messenger>(
        &mut self,
        channel: &Channel<M>,
        handler: impl MessageHandler,
    ) -> &mut Self {
        self.add_message_handler(channel.name(), handler)
    }

    pub fn with_channel_handler<M: Messenger>(
        mut self,
        channel: &Channel<M>,
        handler: impl MessageHandler,
    ) -> Self {
        self.add_channel_handler(channel, handler);
        self
    }
}

impl Dispatch for HandlerRegistry {
    fn dispatch_message(&mut self, message: Message) {
        let handled = self
            .handlers
            .get_mut(&message.channel)
            .is_some_and(|handlers| handlers.iter_mut().any(|handler| handler.receive(&message)));

        if !handled {
            debug!(
                from = %message.from,
                channel = %message.channel,
                msg_type = %message.msg_type,
                "no handler accepted message"
            );
        }
    }
}

pub(crate) enum Inbound {
    Deliver(Message),
    Replace(Box<dyn Dispatch>),
}

pub(crate) type Inbox = mpsc::UnboundedSender<Inbound>;

/// Handle on a running dispatch task. Dropping it aborts the task.
pub(crate) struct Dispatcher {
    inbox: Inbox,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn(uid: NodeUid, dispatcher: Box<dyn Dispatch>) -> Self {
        let (inbox, queue) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(uid, dispatcher, queue));
        Self { inbox, task }
    }

    pub(crate) fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub(crate) fn replace(&self, dispatcher: Box<dyn Dispatch>) {
        // Queued behind messages already received, so those still reach the old one.
        let _ = self.inbox.send(Inbound::Replace(dispatcher));
    }

    /// Abandons queued messages and waits for the task to stop.
    pub(crate) async fn stop(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(uid: NodeUid, mut dispatcher: Box<dyn Dispatch>, mut queue: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = queue.recv().await {
        match inbound {
            Inbound::Deliver(message) => {
                trace!(node = %uid, from = %message.from, msg_type = %message.msg_type, "dispatching");
                dispatcher.dispatch_message(message);
            }
            Inbound::Replace(next) => dispatcher = next,
        }
    }
    debug!(node = %uid, "dispatch queue closed");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio::time::timeout;

    use super::*;

    fn message(channel: &str, msg_type: &str) -> Message {
        Message {
            from: "A".into(),
            channel: channel.into(),
            msg_type: msg_type.into(),
            parts: vec![b"x".to_vec()],
        }
    }

    #[test]
    fn first_accepting_handler_wins() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        let log = Arc::clone(&seen);
        registry.add_message_handler("paxos", move |m: &Message| {
            if m.msg_type != "prepare" {
                return false;
            }
            log.lock().unwrap().push(format!("first:{}", m.msg_type));
            true
        });
        let log = Arc::clone(&seen);
        registry.add_message_handler("paxos", move |m: &Message| {
            log.lock().unwrap().push(format!("second:{}", m.msg_type));
            true
        });

        registry.dispatch_message(message("paxos", "prepare"));
        registry.dispatch_message(message("paxos", "accept"));
        registry.dispatch_message(message("other", "prepare"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:prepare".to_string(), "second:accept".to_string()]
        );
    }

    #[tokio::test]
    async fn replacement_applies_after_queued_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = tx.clone();
        let dispatcher = Dispatcher::spawn(
            "A".into(),
            Box::new(move |m: Message| {
                let _ = first.send(("first", m.msg_type));
            }),
        );

        let inbox = dispatcher.inbox();
        inbox.send(Inbound::Deliver(message("", "one"))).unwrap();
        dispatcher.replace(Box::new(move |m: Message| {
            let _ = tx.send(("second", m.msg_type));
        }));
        inbox.send(Inbound::Deliver(message("", "two"))).unwrap();

        let got = timeout(Duration::from_secs(1), async {
            vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
        })
        .await
        .expect("dispatch in time");
        assert_eq!(got, vec![("first", "one".to_string()), ("second", "two".to_string())]);
    }
}
