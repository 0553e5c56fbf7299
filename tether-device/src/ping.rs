use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// How long a ping may go unanswered before it is failed.
pub const MAX_PING_WAIT: Duration = Duration::from_secs(60);

/// Receives the round-trip time, or `None` when the ping timed out or the
/// session closed first.
pub type PingCallback = Box<dyn FnOnce(Option<Duration>) + Send>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PingError {
    #[error("ping seq={0} is already pending")]
    AlreadyPending(u64),
    #[error("no pending ping with seq={0}")]
    Unknown(u64),
}

struct Pending {
    sent_at: Instant,
    deadline: Instant,
    callback: PingCallback,
}

/// Matches ping replies to their callbacks. Every callback is invoked
/// exactly once: on reply, on expiry, or on [`PingTracker::close_all`].
///
/// Deadlines are not armed here; the owner sweeps them with
/// [`PingTracker::expire`] at [`PingTracker::next_deadline`].
pub struct PingTracker {
    timeout: Duration,
    pending: HashMap<u64, Pending>,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new(MAX_PING_WAIT)
    }
}

impl PingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: HashMap::new(),
        }
    }

    pub fn add(&mut self, seq: u64, now: Instant, callback: PingCallback) -> Result<(), PingError> {
        if self.pending.contains_key(&seq) {
            return Err(PingError::AlreadyPending(seq));
        }
        self.pending.insert(
            seq,
            Pending {
                sent_at: now,
                deadline: now + self.timeout,
                callback,
            },
        );
        Ok(())
    }

    /// Invoke and drop the callback for `seq`.
    pub fn resolve(&mut self, seq: u64, elapsed: Option<Duration>) -> Result<(), PingError> {
        let pending = self.pending.remove(&seq).ok_or(PingError::Unknown(seq))?;
        (pending.callback)(elapsed);
        Ok(())
    }

    /// Resolve `seq` with the time since it was sent.
    pub fn complete(&mut self, seq: u64, now: Instant) -> Result<Duration, PingError> {
        let sent_at = self
            .pending
            .get(&seq)
            .map(|p| p.sent_at)
            .ok_or(PingError::Unknown(seq))?;
        let elapsed = now.saturating_duration_since(sent_at);
        self.resolve(seq, Some(elapsed))?;
        Ok(elapsed)
    }

    /// Fail every outstanding ping. Returns how many there were.
    pub fn close_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            (pending.callback)(None);
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Fail every ping whose deadline has passed and return their seqs.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let mut expired: Vec<u64> = self
            .pending
            .iter()
            .filter_map(|(seq, p)| (now >= p.deadline).then_some(*seq))
            .collect();
        expired.sort_unstable();
        for seq in &expired {
            let _ = self.resolve(*seq, None);
        }
        expired
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
