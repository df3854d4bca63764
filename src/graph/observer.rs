//! Output observation: push-style callbacks and blocking pollers.

use crate::error::Result;
use crate::framework::packet::Packet;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked for every packet on an observed stream.
pub type PacketCallback = Arc<dyn Fn(&Packet) -> Result<()> + Send + Sync>;

/// A callback attached to one stream.
///
/// With `observe_bounds`, bound advances that carry no packet are reported
/// as empty packets stamped with the newly settled timestamp.
#[derive(Clone)]
pub(crate) struct StreamObserver {
    pub callback: PacketCallback,
    pub observe_bounds: bool,
}

impl std::fmt::Debug for StreamObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamObserver")
            .field("observe_bounds", &self.observe_bounds)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum PollerMessage {
    Packet(Packet),
    /// The run ended
    Done,
}

/// Blocking reader of one output stream.
///
/// A poller outlives runs: each run delivers its packets followed by one end
/// marker, so `next` returns `None` once per finished run.
#[derive(Debug)]
pub struct OutputStreamPoller {
    stream: String,
    receiver: Receiver<PollerMessage>,
}

impl OutputStreamPoller {
    pub(crate) fn new(stream: impl Into<String>) -> (Self, Sender<PollerMessage>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (
            Self {
                stream: stream.into(),
                receiver,
            },
            sender,
        )
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Wait for the next packet; `None` when the run ends.
    pub fn next(&self) -> Option<Packet> {
        match self.receiver.recv() {
            Ok(PollerMessage::Packet(packet)) => Some(packet),
            Ok(PollerMessage::Done) | Err(_) => None,
        }
    }

    /// Like `next`, giving up after `timeout`.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Packet> {
        match self.receiver.recv_timeout(timeout) {
            Ok(PollerMessage::Packet(packet)) => Some(packet),
            _ => None,
        }
    }

    /// Packets already delivered, without blocking.
    pub fn queue_size(&self) -> usize {
        self.receiver.len()
    }
}

/// Observer that forwards packets to a poller channel.
pub(crate) fn poller_observer(sender: Sender<PollerMessage>) -> StreamObserver {
    StreamObserver {
        callback: Arc::new(move |packet: &Packet| {
            // A dropped poller just stops listening.
            let _ = sender.send(PollerMessage::Packet(packet.clone()));
            Ok(())
        }),
        observe_bounds: false,
    }
}
