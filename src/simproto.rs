//! The inter-device simulation protocol ("simproto").
//!
//! Devices that are topologically linked exchange full state snapshots as
//! newline-delimited JSON messages over one TCP connection per neighbor pair.
//! Delivery is best-effort: every message carries the complete exported field
//! set, so a dropped message is superseded by the next tick's message and loss
//! only delays convergence, never corrupts it. Receivers gate on the sender's
//! monotonic sequence number, which makes peer state immune to duplicated or
//! reordered delivery.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::memory::Value;

/// Hard cap on one wire frame. Oversized frames are dropped before parsing.
pub const MAX_FRAME: usize = 8 * 1024;

/// Process-unique identifier for one simulated device, assigned at launch and
/// used for all topology addressing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Guid(pub u32);

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Guid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Guid)
    }
}

/// Exported field map: name -> typed value.
pub type FieldMap = BTreeMap<String, Value>;

/// One simproto message: a full snapshot of the sender's exported fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMessage {
    pub sender: Guid,
    pub sequence: u64,
    pub timestamp: u64,
    pub fields: FieldMap,
}

impl PeerMessage {
    pub fn new(sender: Guid, sequence: u64, fields: FieldMap) -> Self {
        Self {
            sender,
            sequence,
            timestamp: unix_millis(),
            fields,
        }
    }
}

/// Milliseconds since the Unix epoch, for message timestamps.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds {MAX_FRAME}")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a message as one newline-terminated JSON frame.
pub fn encode(msg: &PeerMessage) -> Result<String, WireError> {
    let mut line = serde_json::to_string(msg)?;
    if line.len() >= MAX_FRAME {
        return Err(WireError::FrameTooLarge(line.len()));
    }
    line.push('\n');
    Ok(line)
}

/// Parse one frame. Length and shape violations are reported so the receive
/// path can drop and log them; they are never fatal to the receiver.
pub fn decode(line: &str) -> Result<PeerMessage, WireError> {
    if line.len() > MAX_FRAME {
        return Err(WireError::FrameTooLarge(line.len()));
    }
    Ok(serde_json::from_str(line.trim())?)
}

/// Read one newline-terminated frame into `buf` without ever buffering more
/// than `max` bytes of it. The cap is enforced while the frame is still
/// arriving, so a sender streaming bytes with no newline cannot grow the
/// buffer without bound; an over-long frame is an I/O error and the caller
/// drops the connection. Clean EOF returns `Ok(None)`.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max: usize,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<usize>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    buf.clear();
    loop {
        let (complete, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                // EOF mid-frame: hand back the partial line; the decoder
                // rejects it if it is incomplete.
                return Ok(Some(buf.len()));
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        if buf.len() > max {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame exceeds the {} byte cap", max),
            ));
        }
        if complete {
            return Ok(Some(buf.len()));
        }
    }
}

/// Outcome of offering a received message to a peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Newer sequence; fields stored.
    Accepted,
    /// Duplicate or out-of-order sequence; discarded silently.
    Stale,
    /// Sender is not a configured neighbor for this table.
    UnknownSender,
}

#[derive(Debug)]
struct PeerState {
    last_seq: u64,
    fields: FieldMap,
    received_at: Option<Instant>,
}

/// Latest-known snapshot of one neighbor, as seen by the simulation loop.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub guid: Guid,
    pub sequence: u64,
    pub fields: FieldMap,
    /// No message within the freshness window; fields hold the last value.
    pub stale: bool,
    /// At least one message has ever been accepted from this neighbor.
    pub received: bool,
}

/// Point-in-time view over a whole peer table, handed to the step function.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSet {
    entries: Vec<PeerSnapshot>,
}

impl SnapshotSet {
    pub fn entries(&self) -> &[PeerSnapshot] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First peer that has reported the named field. Chain topologies have a
    /// single relevant neighbor per direction, so "first" is deterministic.
    pub fn field(&self, name: &str) -> Option<(Value, bool)> {
        self.entries
            .iter()
            .filter(|p| p.received)
            .find_map(|p| p.fields.get(name).map(|v| (*v, p.stale)))
    }

    /// True when any contributing peer is past its freshness window.
    pub fn any_stale(&self) -> bool {
        self.entries.iter().any(|p| p.received && p.stale)
    }
}

/// One entry per configured neighbor in a given direction. Entries are
/// created when the table is built and never deleted; receive paths update
/// them and the simulation loop snapshots them without ever blocking on the
/// network.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<Guid, Mutex<PeerState>>,
    freshness: Duration,
}

impl PeerTable {
    /// `freshness` is the wall-clock window (freshness_window ticks worth of
    /// time) after which a silent neighbor is flagged stale.
    pub fn new(neighbors: impl IntoIterator<Item = Guid>, freshness: Duration) -> Self {
        let peers = neighbors
            .into_iter()
            .map(|guid| {
                let state = PeerState {
                    last_seq: 0,
                    fields: FieldMap::new(),
                    received_at: None,
                };
                (guid, Mutex::new(state))
            })
            .collect();
        Self { peers, freshness }
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.peers.contains_key(&guid)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Offer a received message. Only a strictly greater sequence number
    /// updates the stored state; anything else is discarded.
    pub fn ingest(&self, msg: &PeerMessage) -> Ingest {
        let Some(state) = self.peers.get(&msg.sender) else {
            return Ingest::UnknownSender;
        };
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.received_at.is_some() && msg.sequence <= state.last_seq {
            return Ingest::Stale;
        }
        state.last_seq = msg.sequence;
        state.fields = msg.fields.clone();
        state.received_at = Some(Instant::now());
        Ingest::Accepted
    }

    /// Snapshot every neighbor's latest state, computing staleness against
    /// the freshness window. Never blocks on I/O.
    pub fn snapshot(&self) -> SnapshotSet {
        let mut entries: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|(guid, state)| {
                let state = state.lock().unwrap_or_else(|e| e.into_inner());
                let received = state.received_at.is_some();
                let stale = state
                    .received_at
                    .map(|at| at.elapsed() > self.freshness)
                    .unwrap_or(false);
                PeerSnapshot {
                    guid: *guid,
                    sequence: state.last_seq,
                    fields: state.fields.clone(),
                    stale,
                    received,
                }
            })
            .collect();
        entries.sort_by_key(|p| p.guid);
        SnapshotSet { entries }
    }
}
