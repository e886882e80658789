//! Messaging and durability substrate for a Paxos-style consensus engine.
//!
//! Every member of a fixed cluster runs a [`NetworkNode`]. Nodes exchange
//! typed messages point to point (unicast) and with the whole group
//! (broadcast) over TCP, using a peer table that every member knows up front.
//! Consensus state goes through a [`DurableStateStore`], whose writes resolve
//! a [`FlushSignal`] once they are durable.
//!
//! - [`message`] defines identities, peer tables, messages, and the
//!   newline-delimited JSON frame protocol.
//! - [`node`] binds a node's endpoints and manages its links and session.
//! - [`dispatch`] runs the single task that delivers received messages, plus
//!   the channel-routing [`HandlerRegistry`].
//! - [`channel`] holds the [`Messenger`] sending trait and named [`Channel`]s.
//! - [`local`] is an in-process network for deterministic tests.
//! - [`durable`] defines the store contract and the in-memory reference store.
//! - [`cli`] and [`console`] back the `paxos_mesh` demo binary.
//!
//! Delivery is best effort: nothing is acknowledged, and messages can be lost
//! while links are still settling. Use [`NetworkNode::wait_ready`] or a retry
//! layer above this one.

pub mod channel;
pub mod cli;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod durable;
pub mod error;
pub mod local;
pub mod message;
pub mod node;

mod link;
mod publisher;

pub use channel::{Channel, Destination, Messenger};
pub use config::NodeConfig;
pub use dispatch::{Discard, Dispatch, HandlerRegistry, MessageHandler};
pub use durable::{DataId, DurableStateStore, FlushSignal, MemoryOnlyStateStore};
pub use error::{NetError, StoreError};
pub use local::{LocalNetwork, LocalNode};
pub use message::{Endpoints, Message, NodeUid, PeerTable};
pub use node::{NetworkNode, NodeSender};
