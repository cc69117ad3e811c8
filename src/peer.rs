//! PeerLink transport for simproto.
//!
//! One TCP connection per neighbor pair carries snapshots in both directions.
//! The downstream device (the data consumer) dials its upstream neighbor and
//! keeps retrying with exponential backoff: an upstream that starts late must
//! never crash its dependents. Each established session splits into an
//! independent send path (pushes the latest exported snapshot whenever the
//! simulation loop publishes one) and receive path (ingests frames through
//! the sequence gate). A mid-session failure tears the session down and the
//! dialer re-establishes it; the simulation loop is never involved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::simproto::{self, Guid, Ingest, PeerMessage, PeerTable};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Static description of one dialed link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub local: Guid,
    pub peer: Guid,
    pub addr: SocketAddr,
    pub max_backoff: Duration,
}

/// Dial an upstream neighbor and keep the link alive until shutdown.
///
/// Received snapshots land in `table` (the upstream peer table); our own
/// upstream-direction exports are read from `outbound` and pushed to the
/// peer. Connection failures back off exponentially up to the configured cap
/// and reset on success.
pub async fn run_dialer(
    cfg: LinkConfig,
    table: Arc<PeerTable>,
    outbound: watch::Receiver<Option<PeerMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match TcpStream::connect(cfg.addr).await {
            Ok(stream) => {
                info!(local = %cfg.local, peer = %cfg.peer, addr = %cfg.addr, "peer link established");
                backoff = INITIAL_BACKOFF;
                run_session(stream, Arc::clone(&table), outbound.clone(), shutdown.clone()).await;
                if *shutdown.borrow() {
                    break;
                }
                warn!(local = %cfg.local, peer = %cfg.peer, "peer link lost, reconnecting");
            }
            Err(e) => {
                debug!(local = %cfg.local, peer = %cfg.peer, addr = %cfg.addr, error = %e, "peer unreachable, backing off");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        backoff = (backoff * 2).min(cfg.max_backoff);
    }
    debug!(local = %cfg.local, peer = %cfg.peer, "peer dialer stopped");
}

/// Accept connections from downstream neighbors on the device's simproto
/// listener. Each accepted session pushes our downstream-direction exports
/// and ingests the caller's feedback into `table` (the downstream peer
/// table). A fault in one session never affects the others.
pub async fn run_acceptor(
    local: Guid,
    listener: TcpListener,
    table: Arc<PeerTable>,
    outbound: watch::Receiver<Option<PeerMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(local = %local, %addr, "peer connection accepted");
                    let table = Arc::clone(&table);
                    let outbound = outbound.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        run_session(stream, table, outbound, shutdown).await;
                        debug!(local = %local, %addr, "peer connection closed");
                    });
                }
                Err(e) => {
                    warn!(local = %local, error = %e, "failed to accept peer connection");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(local = %local, "simproto acceptor stopped");
}

/// Drive one established connection: independent send and receive paths,
/// torn down together as soon as either fails. Both paths run inside this
/// task, so aborting the owning task (dialer or acceptor session) drops them
/// with it.
async fn run_session(
    stream: TcpStream,
    table: Arc<PeerTable>,
    outbound: watch::Receiver<Option<PeerMessage>>,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    tokio::select! {
        _ = send_path(writer, outbound, shutdown.clone()) => {}
        _ = recv_path(reader, table, shutdown) => {}
    }
}

/// Push the latest exported snapshot whenever the simulation loop publishes
/// one. The current snapshot is re-sent on session start so a reconnecting
/// peer converges without waiting for the next tick.
async fn send_path(
    mut writer: OwnedWriteHalf,
    mut outbound: watch::Receiver<Option<PeerMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let pending = outbound.borrow_and_update().clone();
    if let Some(msg) = pending {
        if write_frame(&mut writer, &msg, &mut shutdown).await.is_err() {
            return;
        }
    }
    loop {
        tokio::select! {
            changed = outbound.changed() => {
                if changed.is_err() {
                    break;
                }
                let msg = outbound.borrow_and_update().clone();
                if let Some(msg) = msg {
                    if write_frame(&mut writer, &msg, &mut shutdown).await.is_err() {
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Write one frame, racing the transport against the shutdown signal: a peer
/// that has stopped reading (and so filled its TCP receive window) must not
/// hold the session past the shutdown grace period.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    msg: &PeerMessage,
    shutdown: &mut watch::Receiver<bool>,
) -> std::io::Result<()> {
    let line = match simproto::encode(msg) {
        Ok(line) => line,
        Err(e) => {
            // An unencodable snapshot is a local bug; drop it rather than
            // killing the session.
            warn!(error = %e, "failed to encode peer snapshot, dropping");
            return Ok(());
        }
    };
    tokio::select! {
        result = writer.write_all(line.as_bytes()) => result,
        _ = stop_requested(shutdown) => Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "shutdown during peer write",
        )),
    }
}

/// Resolves when the shutdown flag is raised or its sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Read frames until EOF, error, or shutdown. Malformed frames and frames
/// from unconfigured senders are dropped and logged, never fatal; stale
/// sequence numbers are discarded silently. A frame that exceeds the size
/// cap before its newline arrives closes the session instead of growing the
/// read buffer.
async fn recv_path(
    reader: OwnedReadHalf,
    table: Arc<PeerTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            frame = simproto::read_frame(&mut reader, simproto::MAX_FRAME, &mut buf) => match frame {
                Ok(Some(_)) => {
                    let line = String::from_utf8_lossy(&buf);
                    match simproto::decode(&line) {
                        Ok(msg) => match table.ingest(&msg) {
                            Ingest::Accepted => {}
                            Ingest::Stale => {
                                debug!(sender = %msg.sender, sequence = msg.sequence, "discarded out-of-order peer snapshot");
                            }
                            Ingest::UnknownSender => {
                                warn!(sender = %msg.sender, "snapshot from unconfigured peer, closing session");
                                break;
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "malformed peer frame dropped");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "peer read failed, closing session");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
