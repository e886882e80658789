//! Point-to-point links between members.
//!
//! Outbound unicast links and broadcast subscriptions are dialed from
//! background tasks that keep retrying until the peer is listening, so
//! `connect` never waits on other members. Both report to the session's
//! readiness counter once their handshake has completed the first time.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncReadExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, watch},
    task::JoinSet,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    dispatch::{Inbound, Inbox},
    message::{Frame, Message, NodeUid, read_frame, write_frame},
};

/// Counts links whose first handshake has completed.
pub(crate) type Readiness = Arc<watch::Sender<usize>>;

/// Everything a dialing task needs to know about its far end.
pub(crate) struct LinkTarget {
    pub(crate) local: NodeUid,
    pub(crate) peer: NodeUid,
    pub(crate) addr: SocketAddr,
    pub(crate) retry: Duration,
    pub(crate) readiness: Readiness,
}

impl LinkTarget {
    async fn dial(&self) -> TcpStream {
        loop {
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return stream;
                }
                Err(err) => {
                    debug!(node = %self.local, peer = %self.peer, addr = %self.addr, error = ?err, "peer not reachable yet");
                    sleep(self.retry).await;
                }
            }
        }
    }

    fn mark_ready(&self, announced: &mut bool) {
        if !*announced {
            *announced = true;
            self.readiness.send_modify(|ready| *ready += 1);
        }
    }
}

/// Drains the per-peer queue onto a unicast stream, redialing when it breaks.
///
/// The message being written when the stream fails is lost; anything still
/// queued goes out on the next stream. A hang-up noticed while idle triggers
/// the redial before anything else is written.
pub(crate) async fn run_outbound(target: LinkTarget, mut queue: mpsc::Receiver<Message>) {
    let mut announced = false;

    loop {
        let (mut hangup, mut writer) = target.dial().await.into_split();
        let hello = Frame::Hello {
            from: target.local.clone(),
        };
        if let Err(err) = write_frame(&mut writer, &hello).await {
            debug!(node = %target.local, peer = %target.peer, error = ?err, "unicast handshake failed");
            sleep(target.retry).await;
            continue;
        }
        target.mark_ready(&mut announced);
        debug!(node = %target.local, peer = %target.peer, "unicast link up");

        let mut probe = [0u8; 1];
        loop {
            select! {
                biased;
                // The far end never writes on a unicast link, so any read
                // completing means it hung up.
                _ = hangup.read(&mut probe) => {
                    debug!(node = %target.local, peer = %target.peer, "unicast peer hung up; redialing");
                    break;
                }
                queued = queue.recv() => {
                    let Some(message) = queued else {
                        return;
                    };
                    if let Err(err) = write_frame(&mut writer, &Frame::Deliver { message }).await {
                        warn!(node = %target.local, peer = %target.peer, error = ?err, "unicast link broken; message dropped");
                        break;
                    }
                }
            }
        }
    }
}

/// Follows one publisher's broadcast endpoint, re-subscribing if it goes away.
pub(crate) async fn run_subscription(target: LinkTarget, inbox: Inbox) {
    let mut announced = false;

    loop {
        let stream = target.dial().await;
        let (reader, _writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        match read_frame::<_, Frame>(&mut reader).await {
            Ok(Some(Frame::Hello { from })) => {
                debug!(node = %target.local, publisher = %from, "subscribed");
            }
            Ok(other) => {
                debug!(node = %target.local, peer = %target.peer, ?other, "publisher skipped handshake");
                sleep(target.retry).await;
                continue;
            }
            Err(err) => {
                debug!(node = %target.local, peer = %target.peer, error = ?err, "subscription handshake failed");
                sleep(target.retry).await;
                continue;
            }
        }
        target.mark_ready(&mut announced);

        if !forward_frames(&target.local, &mut reader, &inbox).await {
            return;
        }
        debug!(node = %target.local, peer = %target.peer, "publisher went away; resubscribing");
        sleep(target.retry).await;
    }
}

/// Accepts inbound unicast links on this node's own endpoint until aborted.
pub(crate) async fn serve_unicast(uid: NodeUid, listener: TcpListener, inbox: Inbox) {
    let mut readers = JoinSet::new();

    loop {
        select! {
            accept_result = listener.accept() => match accept_result {
                Ok((stream, peer)) => {
                    readers.spawn(read_unicast(uid.clone(), stream, peer, inbox.clone()));
                }
                Err(err) => warn!(node = %uid, error = ?err, "failed to accept unicast link"),
            },
            Some(_) = readers.join_next() => {}
        }
    }
}

async fn read_unicast(uid: NodeUid, stream: TcpStream, peer: SocketAddr, inbox: Inbox) {
    let mut reader = BufReader::new(stream);

    let from = match read_frame::<_, Frame>(&mut reader).await {
        Ok(Some(Frame::Hello { from })) => from,
        Ok(other) => {
            warn!(node = %uid, %peer, ?other, "expected hello on unicast link");
            return;
        }
        Err(err) => {
            debug!(node = %uid, %peer, error = ?err, "unicast handshake failed");
            return;
        }
    };
    info!(node = %uid, peer = %from, "inbound unicast link");

    forward_frames(&uid, &mut reader, &inbox).await;
    debug!(node = %uid, peer = %from, "inbound unicast link closed");
}

/// Pushes delivered messages into the dispatch queue.
///
/// Returns `false` once the dispatch queue is gone, `true` when the stream
/// ended or failed.
async fn forward_frames<R>(uid: &NodeUid, reader: &mut R, inbox: &Inbox) -> bool
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_frame::<_, Frame>(reader).await {
            Ok(Some(Frame::Deliver { message })) => {
                if inbox.send(Inbound::Deliver(message)).is_err() {
                    return false;
                }
            }
            Ok(Some(Frame::Hello { from })) => {
                debug!(node = %uid, peer = %from, "ignoring repeated hello");
            }
            Ok(None) => return true,
            Err(err) => {
                warn!(node = %uid, error = ?err, "dropping unreadable stream");
                return true;
            }
        }
    }
}
