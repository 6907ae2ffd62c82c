//! Per-connection replication session.
//!
//! A session multiplexes any number of logs over one swarm connection.
//! Frames are postcard-encoded with a big-endian `u32` length prefix:
//! a `Hello` handshake, then `Open` announcements and `Msg` payload
//! frames. Payloads are opaque here; each attached log speaks its own
//! sync protocol through its channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use wharf_log::{LogChannel, ReplicateOptions};
use wharf_primitives::DiscoveryKey;
use wharf_swarm::SwarmConnection;

use crate::handle::LogHandle;
use crate::replicator::Replicator;
use crate::{StoreError, StoreResult};

/// Bumped when the frame layout changes; peers must match exactly.
pub(crate) const PROTOCOL_VERSION: u8 = 1;

/// Upper bound for a single frame body.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Outbound frames queued between log channels and the write half.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    /// Handshake; first frame in both directions.
    Hello { version: u8 },
    /// The sender has attached this log and is ready to sync it.
    Open { discovery_key: DiscoveryKey },
    /// Sync payload for an attached log.
    Msg { discovery_key: DiscoveryKey, payload: Vec<u8> },
}

/// Drive one connection until its stream dies or the replicator shuts
/// it down, then run teardown exactly once.
pub(crate) async fn run_session(
    replicator: Arc<Replicator>,
    session_id: u64,
    connection: SwarmConnection,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let SwarmConnection { info, stream } = connection;
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let mut session = Session {
        replicator: Arc::clone(&replicator),
        session_id,
        out_tx,
        to_logs: HashMap::new(),
        attached: HashSet::new(),
        announced: HashSet::new(),
    };

    if let Err(err) = session.run(reader, info.topic, &mut shutdown_rx).await {
        let keys: Vec<String> = session.attached.iter().map(|key| key.to_string()).collect();
        warn!(session = session_id, error = %err, ?keys, "Session failed");
    }

    let attached: Vec<DiscoveryKey> = session.attached.iter().copied().collect();
    // Dropping the session drops its log senders; the log channels wind
    // down and the writer exits once the last queued frame is out.
    drop(session);
    let _ = writer_task.await;

    replicator.session_closed(session_id, &attached).await;
    debug!(session = session_id, "Session closed");
}

struct Session {
    replicator: Arc<Replicator>,
    session_id: u64,
    out_tx: mpsc::Sender<Frame>,
    /// Inbound payload routes, by discovery key.
    to_logs: HashMap<DiscoveryKey, mpsc::Sender<Vec<u8>>>,
    /// Keys this session is attached to in the replicating set.
    attached: HashSet<DiscoveryKey>,
    /// Keys we have sent `Open` for; keeps mutual announcement finite.
    announced: HashSet<DiscoveryKey>,
}

impl Session {
    async fn run<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
        topic_hint: Option<DiscoveryKey>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StoreResult<()> {
        self.send(Frame::Hello { version: PROTOCOL_VERSION }).await?;

        let hello = tokio::select! {
            frame = read_frame(&mut reader) => frame?,
            _ = shutdown.changed() => return Ok(()),
        };
        if !check_hello(hello)? {
            return Ok(());
        }

        // A transport that paired us on a topic told us what the remote
        // wants; treat it like an announcement from them.
        if let Some(topic) = topic_hint {
            self.handle_announcement(topic).await?;
        }

        loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame? {
                    Some(frame) => self.handle_frame(frame).await?,
                    None => return Ok(()),
                },
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> StoreResult<()> {
        match frame {
            Frame::Hello { .. } => {
                Err(StoreError::Protocol("unexpected repeated hello".to_string()))
            }
            Frame::Open { discovery_key } => self.handle_announcement(discovery_key).await,
            Frame::Msg { discovery_key, payload } => {
                match self.to_logs.get(&discovery_key) {
                    Some(to_log) => {
                        if to_log.send(payload).await.is_err() {
                            // The log hung up on its channel.
                            self.to_logs.remove(&discovery_key);
                        }
                    }
                    None => {
                        trace!(
                            session = self.session_id,
                            discovery_key = %discovery_key,
                            "Dropping payload for unattached log"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// The remote wants to sync this key. Resolution failures are
    /// session-fatal; a plain miss is not.
    async fn handle_announcement(&mut self, discovery_key: DiscoveryKey) -> StoreResult<()> {
        if self.attached.contains(&discovery_key) {
            return Ok(());
        }
        let Some(handle) = self.replicator.resolve(self.session_id, discovery_key).await? else {
            return Ok(());
        };

        match self.attach(discovery_key, &handle) {
            Ok(()) => {
                self.attached.insert(discovery_key);
                // Announce back so the remote attaches its side too.
                if self.announced.insert(discovery_key) {
                    self.send(Frame::Open { discovery_key }).await?;
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    session = self.session_id,
                    discovery_key = %discovery_key,
                    error = %err,
                    "Failed to attach log"
                );
                self.replicator.detach(self.session_id, discovery_key).await;
                Ok(())
            }
        }
    }

    /// Wire a log to this connection: one channel half to the log, a
    /// pump task forwarding the other half's output as `Msg` frames.
    fn attach(&mut self, discovery_key: DiscoveryKey, handle: &LogHandle) -> StoreResult<()> {
        let (log_end, session_end) = LogChannel::pair();
        handle.log().replicate(log_end, ReplicateOptions::default())?;

        let LogChannel { mut incoming, outgoing } = session_end;
        self.to_logs.insert(discovery_key, outgoing);

        let out_tx = self.out_tx.clone();
        tokio::spawn(async move {
            while let Some(payload) = incoming.recv().await {
                if out_tx.send(Frame::Msg { discovery_key, payload }).await.is_err() {
                    break;
                }
            }
        });
        debug!(
            session = self.session_id,
            discovery_key = %discovery_key,
            "Log attached"
        );
        Ok(())
    }

    async fn send(&self, frame: Frame) -> StoreResult<()> {
        self.out_tx.send(frame).await.map_err(|_| StoreError::Closed)
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            trace!(error = %err, "Write side closed");
            break;
        }
    }
}

/// Validate the remote's first frame. `Ok(false)` is a clean EOF before
/// any frame arrived; anything but a matching `Hello` is session-fatal.
fn check_hello(frame: Option<Frame>) -> StoreResult<bool> {
    match frame {
        Some(Frame::Hello { version }) if version == PROTOCOL_VERSION => Ok(true),
        Some(Frame::Hello { version }) => {
            Err(StoreError::Protocol(format!("unsupported protocol version {version}")))
        }
        Some(_) => Err(StoreError::Protocol("expected hello".to_string())),
        None => Ok(false),
    }
}

/// Read one length-prefixed frame. `Ok(None)` is a clean EOF, the
/// remote hung up between frames.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> StoreResult<Option<Frame>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(StoreError::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = postcard::from_bytes(&body)
        .map_err(|err| StoreError::Protocol(format!("undecodable frame: {err}")))?;
    Ok(Some(frame))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> StoreResult<()> {
    let body = postcard::to_allocvec(frame)
        .map_err(|err| StoreError::Protocol(format!("unencodable frame: {err}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| StoreError::Protocol("frame too large".to_string()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
