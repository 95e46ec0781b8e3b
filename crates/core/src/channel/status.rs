//! Observable channel status with enforced transitions.
//!
//! `idle -> connecting -> connected -> idle`, or
//! `connecting | connected -> error -> idle`. Nothing reaches `connected`
//! without passing through `connecting`, and a reset always lands on `idle`.

use super::{ChannelKind, ChannelStatus};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct StatusCell {
    kind: ChannelKind,
    tx: watch::Sender<ChannelStatus>,
}

impl StatusCell {
    pub fn new(kind: ChannelKind) -> Self {
        let (tx, _) = watch::channel(ChannelStatus::Idle);
        Self { kind, tx }
    }

    pub fn get(&self) -> ChannelStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.tx.subscribe()
    }

    /// Moves to `connecting`. Returns `false` if a connection is already
    /// underway or established. A channel in `error` passes through `idle`.
    pub fn begin_connect(&self) -> bool {
        if self.get() == ChannelStatus::Error {
            self.transition(ChannelStatus::Idle);
        }
        self.transition(ChannelStatus::Connecting)
    }

    pub fn connected(&self) -> bool {
        self.transition(ChannelStatus::Connected)
    }

    pub fn fail(&self) -> bool {
        self.transition(ChannelStatus::Error)
    }

    /// A clean close of an established connection.
    pub fn closed(&self) -> bool {
        self.transition(ChannelStatus::Idle)
    }

    /// Explicit disconnect: any state goes to `idle`.
    pub fn reset(&self) {
        let kind = self.kind;
        self.tx.send_if_modified(|current| {
            if *current == ChannelStatus::Idle {
                return false;
            }
            debug!(channel = %kind, from = %current, "Channel status reset");
            *current = ChannelStatus::Idle;
            true
        });
    }

    fn transition(&self, to: ChannelStatus) -> bool {
        let kind = self.kind;
        self.tx.send_if_modified(|current| {
            if !allowed(*current, to) {
                debug!(channel = %kind, from = %current, to = %to, "Ignoring status transition");
                return false;
            }
            info!(channel = %kind, from = %current, to = %to, "Channel status changed");
            *current = to;
            true
        })
    }
}

fn allowed(from: ChannelStatus, to: ChannelStatus) -> bool {
    use ChannelStatus::*;
    matches!(
        (from, to),
        (Idle, Connecting)
            | (Connecting, Connected)
            | (Connecting, Error)
            | (Connected, Error)
            | (Connected, Idle)
            | (Error, Idle)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = StatusCell::new(ChannelKind::StreamingText);
        assert_eq!(cell.get(), ChannelStatus::Idle);
        assert!(cell.begin_connect());
        assert!(cell.connected());
        assert!(cell.closed());
        assert_eq!(cell.get(), ChannelStatus::Idle);
    }

    #[test]
    fn test_cannot_skip_connecting() {
        let cell = StatusCell::new(ChannelKind::StreamingText);
        assert!(!cell.connected());
        assert!(!cell.fail());
        assert_eq!(cell.get(), ChannelStatus::Idle);
    }

    #[test]
    fn test_begin_connect_is_rejected_while_busy() {
        let cell = StatusCell::new(ChannelKind::PeerMedia);
        assert!(cell.begin_connect());
        assert!(!cell.begin_connect());
        cell.connected();
        assert!(!cell.begin_connect());
        assert_eq!(cell.get(), ChannelStatus::Connected);
    }

    #[test]
    fn test_error_then_retry_goes_through_idle() {
        let cell = StatusCell::new(ChannelKind::StreamingSpeech);
        let mut rx = cell.subscribe();
        cell.begin_connect();
        assert!(cell.fail());
        assert_eq!(cell.get(), ChannelStatus::Error);
        rx.mark_unchanged();

        assert!(cell.begin_connect());
        assert_eq!(cell.get(), ChannelStatus::Connecting);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_reset_always_lands_on_idle() {
        for setup in [0, 1, 2, 3] {
            let cell = StatusCell::new(ChannelKind::StreamingSpeech);
            if setup >= 1 {
                cell.begin_connect();
            }
            if setup >= 2 {
                cell.connected();
            }
            if setup >= 3 {
                cell.fail();
            }
            cell.reset();
            assert_eq!(cell.get(), ChannelStatus::Idle);
        }
    }
}
