use crate::time::{Duration, Instant};

pub(super) mod tahoe;

pub(super) mod westwood;

/// What the socket should do after a duplicate acknowledgement.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(super) enum DupAckAction {
    /// Keep going.
    None,
    /// Rewind to the highest acknowledged byte and resend from there.
    GoBackN,
    /// The window was inflated; try sending more.
    Transmit,
}

#[allow(unused_variables)]
pub(super) trait Controller {
    /// Congestion window in bytes.
    fn window(&self) -> usize;

    /// Slow start threshold in bytes.
    fn ssthresh(&self) -> usize;

    /// `acked` bytes were newly acknowledged. `rtt` is the round-trip sample
    /// the acknowledgement produced, if any.
    fn on_new_ack(&mut self, now: Instant, acked: usize, rtt: Option<Duration>) {}

    /// The `count`-th consecutive duplicate acknowledgement arrived while
    /// `window` bytes could be in flight.
    fn on_duplicate_ack(&mut self, now: Instant, count: u32, window: usize) -> DupAckAction {
        DupAckAction::None
    }

    /// The retransmission timer fired while `window` bytes could be in flight.
    fn on_retransmit_timeout(&mut self, now: Instant, window: usize) {}
}

/// Window after one new acknowledgement: a full segment per ack in slow start,
/// `mss * mss / cwnd` (at least one byte) in congestion avoidance.
fn grow(cwnd: usize, ssthresh: usize, mss: usize) -> usize {
    if cwnd < ssthresh {
        cwnd + mss
    } else {
        cwnd + (mss * mss / cwnd.max(1)).max(1)
    }
}

/// Congestion control algorithm of a socket.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum CongestionControl {
    /// Slow start, congestion avoidance and fast retransmit.
    #[default]
    Tahoe,
    /// Tahoe with the threshold taken from a bandwidth estimate.
    Westwood,
}

#[derive(Debug, Clone)]
pub(super) enum AnyController {
    Tahoe(tahoe::Tahoe),
    Westwood(westwood::Westwood),
}

impl AnyController {
    /// Create a controller of the given kind.
    pub fn new(kind: CongestionControl, mss: usize, initial_cwnd: usize, ssthresh: usize) -> Self {
        match kind {
            CongestionControl::Tahoe => {
                AnyController::Tahoe(tahoe::Tahoe::new(mss, initial_cwnd, ssthresh))
            }
            CongestionControl::Westwood => {
                AnyController::Westwood(westwood::Westwood::new(mss, initial_cwnd, ssthresh))
            }
        }
    }

    pub fn kind(&self) -> CongestionControl {
        match self {
            AnyController::Tahoe(_) => CongestionControl::Tahoe,
            AnyController::Westwood(_) => CongestionControl::Westwood,
        }
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut dyn Controller {
        match self {
            AnyController::Tahoe(c) => c,
            AnyController::Westwood(c) => c,
        }
    }

    #[inline]
    pub fn inner(&self) -> &dyn Controller {
        match self {
            AnyController::Tahoe(c) => c,
            AnyController::Westwood(c) => c,
        }
    }
}
