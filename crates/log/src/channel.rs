//! Per-log replication channel.

use tokio::sync::mpsc;

/// Payload buffer per channel direction.
const CHANNEL_CAPACITY: usize = 64;

/// One end of a bidirectional payload channel between a log and a
/// transport session.
///
/// Payloads are opaque to the transport; the log and its remote
/// counterpart speak their own sync protocol through them.
pub struct LogChannel {
    /// Payloads arriving from the remote log.
    pub incoming: mpsc::Receiver<Vec<u8>>,
    /// Payloads to deliver to the remote log.
    pub outgoing: mpsc::Sender<Vec<u8>>,
}

impl LogChannel {
    /// Create a connected pair of channel ends.
    ///
    /// Whatever one end sends on `outgoing` arrives on the other end's
    /// `incoming`. One end goes to the log, the other stays with the
    /// transport session (or, in tests, a second log).
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (right_tx, left_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self { incoming: left_rx, outgoing: left_tx },
            Self { incoming: right_rx, outgoing: right_tx },
        )
    }
}
