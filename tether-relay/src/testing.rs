use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tether_proto::{decode, Message};

use crate::peer::{Peer, PeerId, PeerSink};

/// A sink that keeps everything sent to it.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn peer() -> (Peer, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (Peer::new(PeerId::next_stream(), sink.clone()), sink)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drain and decode everything sent so far.
    pub fn take(&self) -> Vec<Message> {
        let frames = std::mem::take(&mut *self.frames.lock().unwrap());
        frames
            .iter()
            .map(|f| decode(f).unwrap().unwrap())
            .collect()
    }
}

impl PeerSink for RecordingSink {
    fn send(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
