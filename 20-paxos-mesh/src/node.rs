//! The network node: one member's view of the cluster.
//!
//! A node goes `Unconnected -> Connected -> Closed`. `connect` binds the
//! node's own unicast and broadcast endpoints, then spawns background tasks
//! that dial every other member's unicast endpoint and subscribe to every
//! other member's broadcast endpoint (and its own, if `recv_self`). Every
//! message received by any of those tasks is funneled into the node's
//! dispatch task.
//!
//! Unicasts to a peer whose link is down wait in a queue of
//! `link_capacity` messages; once it is full, further sends to that peer are
//! dropped.

use std::{
    collections::HashMap,
    io, mem,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, lookup_host},
    sync::{broadcast, mpsc, mpsc::error::TrySendError, watch},
    task::JoinSet,
    time::{sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{Destination, Messenger},
    config::NodeConfig,
    dispatch::{Discard, Dispatch, Dispatcher, Inbound, Inbox},
    error::NetError,
    link::{self, LinkTarget},
    message::{Message, NodeUid, PeerTable},
    publisher::Publisher,
};

pub struct NetworkNode {
    uid: NodeUid,
    config: NodeConfig,
    dispatch: DispatchSlot,
    state: NodeState,
}

enum DispatchSlot {
    /// Installed before the first `connect`; no task exists yet.
    Parked(Box<dyn Dispatch>),
    Running(Dispatcher),
}

enum NodeState {
    Unconnected,
    Connected(Session),
    Closed,
}

impl NetworkNode {
    pub fn new(uid: impl Into<NodeUid>) -> Self {
        Self::with_config(uid, NodeConfig::default())
    }

    pub fn with_config(uid: impl Into<NodeUid>, config: NodeConfig) -> Self {
        Self {
            uid: uid.into(),
            config,
            dispatch: DispatchSlot::Parked(Box::new(Discard)),
            state: NodeState::Unconnected,
        }
    }

    pub fn uid(&self) -> &NodeUid {
        &self.uid
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, NodeState::Connected(_))
    }

    /// The membership of the current session.
    pub fn peers(&self) -> Option<&PeerTable> {
        match &self.state {
            NodeState::Connected(session) => Some(&session.peers),
            _ => None,
        }
    }

    /// Replaces the message callback. Messages already queued for dispatch
    /// still go to the previous one.
    pub fn set_dispatcher(&mut self, dispatcher: impl Dispatch) {
        match &mut self.dispatch {
            DispatchSlot::Parked(parked) => *parked = Box::new(dispatcher),
            DispatchSlot::Running(running) => running.replace(Box::new(dispatcher)),
        }
    }

    /// Binds this node's endpoints and starts linking to every peer.
    ///
    /// Returns once both local endpoints are bound; links to peers settle in
    /// the background (see [`NetworkNode::wait_ready`]). Calling this on a
    /// connected node releases the current session first and waits
    /// `rebind_settle` before binding again.
    ///
    /// # Errors
    ///
    /// - [`NetError::MissingLocalEndpoints`] if `peers` has no entry for this node
    /// - [`NetError::TransportUnavailable`] if a peer address does not resolve
    ///   or either local endpoint cannot be bound; nothing stays bound
    /// - [`NetError::Closed`] after [`NetworkNode::shutdown`]
    pub async fn connect(&mut self, peers: PeerTable, recv_self: bool) -> Result<(), NetError> {
        if matches!(self.state, NodeState::Closed) {
            return Err(NetError::Closed);
        }
        if !peers.contains_key(&self.uid) {
            return Err(NetError::MissingLocalEndpoints(self.uid.clone()));
        }

        if let NodeState::Connected(session) = mem::replace(&mut self.state, NodeState::Unconnected) {
            info!(node = %self.uid, "releasing current session before reconnect");
            session.close().await;
            sleep(self.config.rebind_settle).await;
        }

        let inbox = self.start_dispatcher();
        let session = Session::open(&self.uid, &self.config, peers, recv_self, inbox).await?;
        self.state = NodeState::Connected(session);
        Ok(())
    }

    /// Waits until every link of the current session has completed its
    /// handshake. Messages sent after this returns cannot be lost to a peer
    /// that has not attached yet.
    pub async fn wait_ready(&self, within: Duration) -> Result<(), NetError> {
        let session = self.session()?;
        let expected = session.expected_links;
        let mut ready = session.ready.clone();

        let outcome = timeout(within, ready.wait_for(|linked| *linked >= expected))
            .await
            .map(|settled| settled.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => {
                let linked = *ready.borrow();
                Err(NetError::NotReady {
                    pending: expected.saturating_sub(linked),
                })
            }
        }
    }

    /// A cloneable sending handle for the current session, suitable for
    /// moving into dispatch callbacks.
    pub fn sender(&self) -> Result<NodeSender, NetError> {
        Ok(self.session()?.sender.clone())
    }

    /// Releases every channel. Pending sends are abandoned.
    ///
    /// Safe to call repeatedly and before `connect`; the node is closed
    /// afterwards either way. Returns once all sockets are released.
    pub async fn shutdown(&mut self) {
        match mem::replace(&mut self.state, NodeState::Closed) {
            NodeState::Connected(session) => {
                session.close().await;
                info!(node = %self.uid, "node shut down");
            }
            NodeState::Unconnected => debug!(node = %self.uid, "shut down before connect"),
            NodeState::Closed => return,
        }

        if let DispatchSlot::Running(running) = &mut self.dispatch {
            running.stop().await;
        }
    }

    fn session(&self) -> Result<&Session, NetError> {
        match &self.state {
            NodeState::Connected(session) => Ok(session),
            NodeState::Unconnected => Err(NetError::NotConnected),
            NodeState::Closed => Err(NetError::Closed),
        }
    }

    /// Spawns the dispatch task on first use; reconnects keep the running one.
    fn start_dispatcher(&mut self) -> Inbox {
        let running = match mem::replace(&mut self.dispatch, DispatchSlot::Parked(Box::new(Discard))) {
            DispatchSlot::Parked(parked) => Dispatcher::spawn(self.uid.clone(), parked),
            DispatchSlot::Running(running) => running,
        };
        let inbox = running.inbox();
        self.dispatch = DispatchSlot::Running(running);
        inbox
    }
}

impl Messenger for NetworkNode {
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
        self.session()?
            .sender
            .send(destination, channel, msg_type, parts)
    }
}

/// Sending side of one session.
///
/// Once the session it came from is closed (by shutdown or reconnect) every
/// send fails with [`NetError::Closed`].
#[derive(Clone)]
pub struct NodeSender {
    outbound: Arc<Outbound>,
}

struct Outbound {
    uid: NodeUid,
    links: HashMap<NodeUid, mpsc::Sender<Message>>,
    fanout: broadcast::Sender<Message>,
    inbox: Inbox,
    open: AtomicBool,
}

impl Messenger for NodeSender {
    fn node_uid(&self) -> &NodeUid {
        &self.outbound.uid
    }

    fn send(
        &self,
        destination: Destination<'_>,
        channel: &str,
        msg_type: &str,
        parts: Vec<Vec<u8>>,
    ) -> Result<(), NetError> {
        let out = &self.outbound;
        if !out.open.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }

        let message = Message {
            from: out.uid.clone(),
            channel: channel.to_string(),
            msg_type: msg_type.to_string(),
            parts,
        };

        match destination {
            Destination::Node(dest) if *dest == out.uid => out
                .inbox
                .send(Inbound::Deliver(message))
                .map_err(|_| NetError::Closed),
            Destination::Node(dest) => {
                let link = out
                    .links
                    .get(dest)
                    .ok_or_else(|| NetError::Connection(dest.clone()))?;
                match link.try_send(message) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => {
                        warn!(node = %out.uid, peer = %dest, "unicast queue full; message dropped");
                        Ok(())
                    }
                    Err(TrySendError::Closed(_)) => Err(NetError::Closed),
                }
            }
            Destination::All => {
                if out.fanout.send(message).is_err() {
                    trace!(node = %out.uid, "broadcast with no subscribers attached");
                }
                Ok(())
            }
        }
    }
}

struct Session {
    peers: PeerTable,
    sender: NodeSender,
    tasks: JoinSet<()>,
    ready: watch::Receiver<usize>,
    expected_links: usize,
}

impl Session {
    async fn open(
        uid: &NodeUid,
        config: &NodeConfig,
        peers: PeerTable,
        recv_self: bool,
        inbox: Inbox,
    ) -> Result<Self, NetError> {
        let own = peers
            .get(uid)
            .ok_or_else(|| NetError::MissingLocalEndpoints(uid.clone()))?;

        // Every remote address must resolve before anything is bound; only a
        // peer that is not listening yet is retried.
        let mut remotes = Vec::with_capacity(peers.len().saturating_sub(1));
        for (peer, endpoints) in peers.iter().filter(|(peer, _)| *peer != uid) {
            let unicast_addr = resolve(&endpoints.unicast).await?;
            let broadcast_addr = resolve(&endpoints.broadcast).await?;
            remotes.push((peer.clone(), unicast_addr, broadcast_addr));
        }

        let unicast_listener = bind(&own.unicast).await?;
        let publish_listener = bind(&own.broadcast).await?;
        let own_broadcast = publish_listener
            .local_addr()
            .map_err(|source| NetError::TransportUnavailable {
                addr: own.broadcast.clone(),
                source,
            })?;

        let (fanout, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (ready_tx, ready) = watch::channel(0);
        let readiness = Arc::new(ready_tx);
        let mut tasks = JoinSet::new();

        tasks.spawn(link::serve_unicast(uid.clone(), unicast_listener, inbox.clone()));
        tasks.spawn(Publisher::new(uid.clone(), publish_listener, fanout.clone()).run());

        let target = |peer: &NodeUid, addr: SocketAddr| LinkTarget {
            local: uid.clone(),
            peer: peer.clone(),
            addr,
            retry: config.connect_retry,
            readiness: Arc::clone(&readiness),
        };

        let mut links = HashMap::new();
        let mut expected_links = 0;
        for (peer, unicast_addr, broadcast_addr) in remotes {
            let (queue_tx, queue_rx) = mpsc::channel(config.link_capacity.max(1));
            tasks.spawn(link::run_outbound(target(&peer, unicast_addr), queue_rx));
            tasks.spawn(link::run_subscription(target(&peer, broadcast_addr), inbox.clone()));
            links.insert(peer, queue_tx);
            expected_links += 2;
        }
        if recv_self {
            tasks.spawn(link::run_subscription(target(uid, own_broadcast), inbox.clone()));
            expected_links += 1;
        }

        info!(node = %uid, members = peers.len(), recv_self, "session open");
        let outbound = Outbound {
            uid: uid.clone(),
            links,
            fanout,
            inbox,
            open: AtomicBool::new(true),
        };

        Ok(Self {
            peers,
            sender: NodeSender {
                outbound: Arc::new(outbound),
            },
            tasks,
            ready,
            expected_links,
        })
    }

    /// Aborts every task and waits for them, which drops their sockets.
    async fn close(mut self) {
        self.sender.outbound.open.store(false, Ordering::Release);
        self.tasks.shutdown().await;
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, NetError> {
    let unavailable = |source: io::Error| NetError::TransportUnavailable {
        addr: addr.to_string(),
        source,
    };
    lookup_host(addr)
        .await
        .map_err(unavailable)?
        .next()
        .ok_or_else(|| unavailable(io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")))
}

async fn bind(addr: &str) -> Result<TcpListener, NetError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| NetError::TransportUnavailable {
            addr: addr.to_string(),
            source,
        })
}
