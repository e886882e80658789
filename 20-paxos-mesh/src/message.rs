//! Cluster identities, peer tables, and the line-delimited frame protocol.

use std::{collections::BTreeMap, fmt, io};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Unique identifier of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeUid(String);

impl NodeUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<String> for NodeUid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

/// The pair of transport addresses a member binds (for itself) or dials
/// (for everyone else).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub unicast: String,
    pub broadcast: String,
}

impl Endpoints {
    pub fn new(unicast: impl Into<String>, broadcast: impl Into<String>) -> Self {
        Self {
            unicast: unicast.into(),
            broadcast: broadcast.into(),
        }
    }
}

/// Static membership handed to `connect`; fixed for the whole session.
pub type PeerTable = BTreeMap<NodeUid, Endpoints>;

/// A message as seen by the dispatcher.
///
/// `msg_type` and `parts` are never interpreted by this crate. `channel` is
/// empty for messages sent on the root channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeUid,
    #[serde(default)]
    pub channel: String,
    pub msg_type: String,
    pub parts: Vec<Vec<u8>>,
}

/// Frames exchanged on every stream. `Hello` always comes first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello { from: NodeUid },
    Deliver { message: Message },
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    // JSON escapes embedded newlines, so one frame is always one line.
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
