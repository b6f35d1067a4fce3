//! Zero-length writes that push a pending server handshake forward.
//!
//! A server cannot tell when the client's next handshake flight arrives, so
//! every pending connection is poked on a timer. Early retries are fast to
//! keep handshake latency low, later ones back off so a stalled client costs
//! little CPU.

use super::{connection::ConnectionId, transport::Transport};
use crate::metrics::NUDGE_ATTEMPTS;
use std::{io, time::Duration};
use tokio::sync::mpsc;

/// Delay before nudge number `attempt`.
///
/// | attempt | delay  |
/// |---------|--------|
/// | 0       | 0 ms   |
/// | 1-7     | 6 ms   |
/// | 8-33    | 17 ms  |
/// | 34+     | 51 ms  |
#[must_use]
pub const fn backoff_delay(attempt: u32) -> Duration {
    let millis = match attempt {
        0 => 0,
        1..=7 => 6,
        8..=33 => 17,
        _ => 51,
    };
    Duration::from_millis(millis)
}

/// Result of one nudge.
#[derive(Debug)]
pub enum NudgeOutcome {
    /// Still blocked, nudge again after the delay
    Retry(Duration),
    /// The write went through; the handshake is no longer stalled
    Progressed,
    /// The connection is unusable
    Failed(io::Error),
}

/// Attempt counter of one pending connection.
#[derive(Debug, Default)]
pub struct HandshakeNudger {
    attempts: u32,
}

impl HandshakeNudger {
    #[must_use]
    pub const fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Delay of the first nudge.
    pub const fn start(&mut self) -> Duration {
        self.attempts = 1;
        backoff_delay(0)
    }

    /// Attempt a zero-length write on `transport`.
    pub fn nudge(&mut self, transport: &dyn Transport) -> NudgeOutcome {
        NUDGE_ATTEMPTS.inc();

        match transport.try_write(&[]) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let delay = backoff_delay(self.attempts);
                self.attempts = self.attempts.saturating_add(1);
                NudgeOutcome::Retry(delay)
            }
            Ok(_) => {
                self.attempts = 0;
                NudgeOutcome::Progressed
            }
            Err(e) => {
                self.attempts = 0;
                NudgeOutcome::Failed(e)
            }
        }
    }

    /// Nudges issued since the last start or reset
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// One-shot timer that reports back which connection is due.
pub trait NudgeScheduler: Send {
    fn schedule(&self, id: ConnectionId, delay: Duration);
}

/// Sleeps on the tokio timer, then posts the id to the socket loop.
///
/// Only the id travels through the channel; a fire for a connection that has
/// meanwhile been closed finds nothing in the table and is dropped.
#[derive(Debug, Clone)]
pub struct TokioNudgeScheduler {
    tx: mpsc::UnboundedSender<ConnectionId>,
}

impl TokioNudgeScheduler {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<ConnectionId>) -> Self {
        Self { tx }
    }
}

impl NudgeScheduler for TokioNudgeScheduler {
    fn schedule(&self, id: ConnectionId, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // receiver gone means the socket stopped listening
            let _ = tx.send(id);
        });
    }
}
