use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{NodeConfig, parse_peer_spec},
    message::{Endpoints, NodeUid, PeerTable},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join a cluster, print received messages, and send stdin lines.
    Node(NodeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// UID of this node; must appear among the peers.
    #[arg(long)]
    pub uid: String,

    /// Cluster member as UID=UNICAST_ADDR,BROADCAST_ADDR. Repeat for every
    /// member, including this node.
    #[arg(long = "peer", value_parser = parse_peer_arg, required = true)]
    pub peers: Vec<PeerArg>,

    /// Do not deliver this node's own broadcasts back to it.
    #[arg(long)]
    pub no_recv_self: bool,

    /// Pause between closing old endpoints and binding new ones on reconnect.
    #[arg(long, default_value_t = 50)]
    pub settle_ms: u64,

    /// How long to wait for links to settle before reading stdin.
    #[arg(long, default_value_t = 5000)]
    pub ready_timeout_ms: u64,
}

impl NodeArgs {
    pub fn config(&self) -> NodeConfig {
        NodeConfig {
            rebind_settle: Duration::from_millis(self.settle_ms),
            ..NodeConfig::default()
        }
    }

    pub fn peer_table(&self) -> PeerTable {
        self.peers
            .iter()
            .map(|peer| (peer.uid.clone(), peer.endpoints.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PeerArg {
    pub uid: NodeUid,
    pub endpoints: Endpoints,
}

fn parse_peer_arg(spec: &str) -> anyhow::Result<PeerArg> {
    let (uid, endpoints) = parse_peer_spec(spec)?;
    Ok(PeerArg { uid, endpoints })
}
