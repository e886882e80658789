//! Sending side shared by every node flavor, plus named channels on top of it.

use crate::{error::NetError, message::NodeUid};

/// Where a message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination<'a> {
    Node(&'a NodeUid),
    All,
}

/// Anything that can put a message on the wire for a given node.
///
/// Sends never block: they enqueue and return. An `Ok` means the message was
/// accepted locally, not that it was delivered.
pub trait Messenger {
    fn node_uid(&self) -> &NodeUid;

    fn send(
        &self,
        destination: Destination<'_>,
        channel: &str,
        msg_type: &str,
        parts: Vec<Vec<u8>>,
    ) -> Result<(), NetError>;

    /// Sends to exactly one member on the root channel.
    fn unicast_message<P>(&self, dest: &NodeUid, msg_type: &str, parts: P) -> Result<(), NetError>
    where
        P: IntoIterator,
        P::Item: Into<Vec<u8>>,
    {
        self.send(Destination::Node(dest), "", msg_type, collect_parts(parts))
    }

    /// Publishes to every subscribed member on the root channel.
    fn broadcast_message<P>(&self, msg_type: &str, parts: P) -> Result<(), NetError>
    where
        P: IntoIterator,
        P::Item: Into<Vec<u8>>,
    {
        self.send(Destination::All, "", msg_type, collect_parts(parts))
    }
}

impl<T: Messenger> Messenger for &T {
    fn node_uid(&self) -> &NodeUid {
        (**self).node_uid()
    }

    fn send(
        &self,
        destination: Destination<'_>,
        channel: &str,
        msg_type: &str,
        parts: Vec<Vec<u8>>,
    ) -> Result<(), NetError> {
        (**self).send(destination, channel, msg_type, parts)
    }
}

fn collect_parts<P>(parts: P) -> Vec<Vec<u8>>
where
    P: IntoIterator,
    P::Item: Into<Vec<u8>>,
{
    parts.into_iter().map(Into::into).collect()
}

/// A messenger bound to one channel name.
///
/// Subchannels are named `parent.child`, which lets a consensus instance keep
/// e.g. its proposer and acceptor traffic apart on the same node.
#[derive(Debug, Clone)]
pub struct Channel<M> {
    name: String,
    messenger: M,
}

impl<M: Messenger> Channel<M> {
    pub fn new(name: impl Into<String>, messenger: M) -> Self {
        Self {
            name: name.into(),
            messenger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_uid(&self) -> &NodeUid {
        self.messenger.node_uid()
    }

    pub fn create_subchannel(&self, sub_channel: &str) -> Channel<M>
    where
        M: Clone,
    {
        Channel::new(format!("{}.{}", self.name, sub_channel), self.messenger.clone())
    }

    pub fn unicast<P>(&self, to: &NodeUid, msg_type: &str, parts: P) -> Result<(), NetError>
    where
        P: IntoIterator,
        P::Item: Into<Vec<u8>>,
    {
        self.messenger
            .send(Destination::Node(to), &self.name, msg_type, collect_parts(parts))
    }

    pub fn broadcast<P>(&self, msg_type: &str, parts: P) -> Result<(), NetError>
    where
        P: IntoIterator,
        P::Item: Into<Vec<u8>>,
    {
        self.messenger
            .send(Destination::All, &self.name, msg_type, collect_parts(parts))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        uid: NodeUid,
        sent: Mutex<Vec<(Option<NodeUid>, String, String, Vec<Vec<u8>>)>>,
    }

    impl Messenger for Recorder {
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
            let to = match destination {
                Destination::Node(uid) => Some(uid.clone()),
                Destination::All => None,
            };
            self.sent
                .lock()
                .unwrap()
                .push((to, channel.to_string(), msg_type.to_string(), parts));
            Ok(())
        }
    }

    #[test]
    fn subchannels_prefix_the_parent_name() {
        let recorder = Recorder {
            uid: "A".into(),
            sent: Mutex::new(Vec::new()),
        };
        let paxos = Channel::new("paxos", &recorder);
        let accept = paxos.create_subchannel("accept");

        accept.unicast(&"B".into(), "accepted", ["1", "v"]).unwrap();
        paxos.broadcast("prepare", [b"\x00\x01".to_vec()]).unwrap();
        recorder.broadcast_message("root", Vec::<Vec<u8>>::new()).unwrap();

        assert_eq!(accept.name(), "paxos.accept");
        assert_eq!(accept.node_uid(), &NodeUid::new("A"));
        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec![
                (
                    Some("B".into()),
                    "paxos.accept".to_string(),
                    "accepted".to_string(),
                    vec![b"1".to_vec(), b"v".to_vec()]
                ),
                (None, "paxos".to_string(), "prepare".to_string(), vec![vec![0, 1]]),
                (None, String::new(), "root".to_string(), Vec::new()),
            ]
        );
    }
}
