//! In-process network with the same delivery contract as [`NetworkNode`].
//!
//! Members exchange messages through a shared table of dispatch queues, so
//! there is no settling window: a member receives every message sent after
//! it joined. Consensus code written against [`Messenger`] can be exercised
//! deterministically on top of it.
//!
//! [`NetworkNode`]: crate::node::NetworkNode

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::trace;

use crate::{
    channel::{Destination, Messenger},
    dispatch::{Dispatch, Dispatcher, Inbound, Inbox},
    error::NetError,
    message::{Message, NodeUid},
};

#[derive(Clone, Default)]
pub struct LocalNetwork {
    members: Arc<Mutex<HashMap<NodeUid, Member>>>,
}

struct Member {
    inbox: Inbox,
    recv_self: bool,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member with its own dispatch task. Must be called from within
    /// a tokio runtime. Joining under a UID that is already present replaces
    /// the previous member.
    pub fn join(&self, uid: impl Into<NodeUid>, recv_self: bool, dispatcher: impl Dispatch) -> LocalNode {
        let uid = uid.into();
        let dispatcher = Dispatcher::spawn(uid.clone(), Box::new(dispatcher));
        self.lock().insert(
            uid.clone(),
            Member {
                inbox: dispatcher.inbox(),
                recv_self,
            },
        );
        LocalNode {
            uid,
            network: self.clone(),
            dispatcher,
        }
    }

    pub fn members(&self) -> Vec<NodeUid> {
        let mut members: Vec<_> = self.lock().keys().cloned().collect();
        members.sort();
        members
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeUid, Member>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, destination: Destination<'_>, message: Message) -> Result<(), NetError> {
        let members = self.lock();
        if !members.contains_key(&message.from) {
            return Err(NetError::Closed);
        }

        match destination {
            Destination::Node(dest) => match members.get(dest) {
                Some(member) => {
                    let _ = member.inbox.send(Inbound::Deliver(message));
                }
                None => trace!(from = %message.from, to = %dest, "destination not joined; message dropped"),
            },
            Destination::All => {
                for (uid, member) in members.iter() {
                    if *uid != message.from || member.recv_self {
                        let _ = member.inbox.send(Inbound::Deliver(message.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    fn remove(&self, uid: &NodeUid, inbox: &Inbox) {
        let mut members = self.lock();
        if members
            .get(uid)
            .is_some_and(|member| member.inbox.same_channel(inbox))
        {
            members.remove(uid);
        }
    }
}

/// A member of a [`LocalNetwork`]. Dropping it leaves the network.
pub struct LocalNode {
    uid: NodeUid,
    network: LocalNetwork,
    dispatcher: Dispatcher,
}

impl LocalNode {
    pub fn set_dispatcher(&self, dispatcher: impl Dispatch) {
        self.dispatcher.replace(Box::new(dispatcher));
    }

    /// Leaves the network and stops dispatching; queued messages are dropped.
    pub async fn leave(mut self) {
        self.network.remove(&self.uid, &self.dispatcher.inbox());
        self.dispatcher.stop().await;
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.network.remove(&self.uid, &self.dispatcher.inbox());
    }
}

impl Messenger for LocalNode {
    fn node_uid(&self) -> &NodeUid {
        &self.uid
    }

    fn send(
        &self,
        destination: Destination<'_>,
        channel: &str,
        msg_type: &str,
        parts: Vec<Vec<u8>>,
    ) -> Result<(), NetError> {
        let message = Message {
            from: self.uid.clone(),
            channel: channel.to_string(),
            msg_type: msg_type.to_string(),
            parts,
        };
        self.network.route(destination, message)
    }
}
