use crate::time::{Duration, Instant};

use super::{grow, Controller, DupAckAction};

#[derive(Debug, Clone)]
pub struct Tahoe {
    mss: usize,
    cwnd: usize,
    ssthresh: usize,
    // Bytes added to `cwnd` by duplicate acks since the last new ack.
    inflation: usize,
}

impl Tahoe {
    pub fn new(mss: usize, initial_cwnd: usize, ssthresh: usize) -> Tahoe {
        Tahoe {
            mss,
            cwnd: mss * initial_cwnd.max(1),
            ssthresh,
            inflation: 0,
        }
    }

    fn collapse(&mut self, window: usize) {
        self.ssthresh = (window / 2).max(2 * self.mss);
        self.cwnd = self.mss;
        self.inflation = 0;
    }
}

impl Controller for Tahoe {
    fn window(&self) -> usize {
        self.cwnd
    }

    fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    fn on_new_ack(&mut self, _now: Instant, _acked: usize, _rtt: Option<Duration>) {
        self.cwnd -= self.inflation;
        self.inflation = 0;
        self.cwnd = grow(self.cwnd, self.ssthresh, self.mss);
        net_trace!("tahoe: cwnd={} ssthresh={}", self.cwnd, self.ssthresh);
    }

    fn on_duplicate_ack(&mut self, _now: Instant, count: u32, window: usize) -> DupAckAction {
        match count {
            3 => {
                self.collapse(window);
                net_trace!(
                    "tahoe: fast retransmit, cwnd={} ssthresh={}",
                    self.cwnd,
                    self.ssthresh
                );
                DupAckAction::GoBackN
            }
            c if c > 3 => {
                self.cwnd += self.mss;
                self.inflation += self.mss;
                DupAckAction::Transmit
            }
            _ => DupAckAction::None,
        }
    }

    fn on_retransmit_timeout(&mut self, _now: Instant, window: usize) {
        self.collapse(window);
        net_trace!(
            "tahoe: timeout, cwnd={} ssthresh={}",
            self.cwnd,
            self.ssthresh
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MSS: usize = 100;

    #[test]
    fn test_slow_start() {
        let mut tahoe = Tahoe::new(MSS, 1, 64 * MSS);
        for i in 1..10 {
            assert_eq!(tahoe.window(), i * MSS);
            tahoe.on_new_ack(Instant::ZERO, MSS, None);
        }
    }

    #[test]
    fn test_congestion_avoidance() {
        let mut tahoe = Tahoe::new(MSS, 4, 4 * MSS);
        tahoe.on_new_ack(Instant::ZERO, MSS, None);
        // 400 + 100 * 100 / 400
        assert_eq!(tahoe.window(), 425);
        tahoe.on_new_ack(Instant::ZERO, MSS, None);
        // 425 + 10000 / 425
        assert_eq!(tahoe.window(), 448);
    }

    #[test]
    fn test_avoidance_adds_at_least_one_byte() {
        let mut tahoe = Tahoe::new(1, 1000, 1);
        tahoe.on_new_ack(Instant::ZERO, 1, None);
        assert_eq!(tahoe.window(), 1001);
    }

    #[test]
    fn test_fast_retransmit() {
        let mut tahoe = Tahoe::new(MSS, 10, 64 * MSS);
        assert_eq!(tahoe.on_duplicate_ack(Instant::ZERO, 1, 1000), DupAckAction::None);
        assert_eq!(tahoe.on_duplicate_ack(Instant::ZERO, 2, 1000), DupAckAction::None);
        assert_eq!(tahoe.on_duplicate_ack(Instant::ZERO, 3, 1000), DupAckAction::GoBackN);
        assert_eq!(tahoe.ssthresh(), 500);
        assert_eq!(tahoe.window(), MSS);
    }

    #[test]
    fn test_ssthresh_floor() {
        let mut tahoe = Tahoe::new(MSS, 1, 64 * MSS);
        tahoe.on_retransmit_timeout(Instant::ZERO, MSS);
        assert_eq!(tahoe.ssthresh(), 2 * MSS);
        assert_eq!(tahoe.window(), MSS);
    }

    #[test]
    fn test_inflation_removed_on_new_ack() {
        let mut tahoe = Tahoe::new(MSS, 10, 64 * MSS);
        tahoe.on_duplicate_ack(Instant::ZERO, 3, 1000);
        assert_eq!(tahoe.on_duplicate_ack(Instant::ZERO, 4, 1000), DupAckAction::Transmit);
        tahoe.on_duplicate_ack(Instant::ZERO, 5, 1000);
        assert_eq!(tahoe.window(), 3 * MSS);
        tahoe.on_new_ack(Instant::ZERO, MSS, None);
        assert_eq!(tahoe.window(), 2 * MSS);
    }
}
