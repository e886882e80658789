use std::net::SocketAddr;

use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    select,
    sync::broadcast,
    task::JoinSet,
};
use tracing::{debug, warn};

use crate::message::{Frame, Message, NodeUid, write_frame};

/// Serves this node's broadcast endpoint.
///
/// Every accepted connection is a subscriber. It is registered on the fan-out
/// channel before the `hello` frame goes out, so once a subscriber has read
/// `hello` it cannot miss a later broadcast (short of lagging past the
/// channel capacity).
pub(crate) struct Publisher {
    uid: NodeUid,
    listener: TcpListener,
    fanout: broadcast::Sender<Message>,
}

impl Publisher {
    pub(crate) fn new(uid: NodeUid, listener: TcpListener, fanout: broadcast::Sender<Message>) -> Self {
        Self {
            uid,
            listener,
            fanout,
        }
    }

    /// Runs until aborted. Subscriber tasks live in a local set so they are
    /// torn down together with the accept loop.
    pub(crate) async fn run(self) {
        let Publisher {
            uid,
            listener,
            fanout,
        } = self;
        let mut subscribers = JoinSet::new();

        loop {
            select! {
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        let feed = fanout.subscribe();
                        subscribers.spawn(serve_subscriber(uid.clone(), stream, peer, feed));
                    }
                    Err(err) => warn!(node = %uid, error = ?err, "failed to accept subscriber"),
                },
                Some(_) = subscribers.join_next() => {}
            }
        }
    }
}

async fn serve_subscriber(
    uid: NodeUid,
    stream: TcpStream,
    peer: SocketAddr,
    mut feed: broadcast::Receiver<Message>,
) {
    let _ = stream.set_nodelay(true);
    let (mut hangup, mut writer) = stream.into_split();

    if let Err(err) = write_frame(&mut writer, &Frame::Hello { from: uid.clone() }).await {
        debug!(node = %uid, %peer, error = ?err, "subscriber left before handshake");
        return;
    }
    debug!(node = %uid, %peer, "subscriber attached");

    let mut probe = [0u8; 1];
    loop {
        select! {
            biased;
            // Subscribers never write, so any read completing means this one left.
            _ = hangup.read(&mut probe) => {
                debug!(node = %uid, %peer, "subscriber hung up");
                break;
            }
            received = feed.recv() => match received {
                Ok(message) => {
                    if let Err(err) = write_frame(&mut writer, &Frame::Deliver { message }).await {
                        debug!(node = %uid, %peer, error = ?err, "subscriber detached");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(node = %uid, %peer, skipped, "subscriber lagging; broadcasts dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
