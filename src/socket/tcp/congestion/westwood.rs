use crate::time::{Duration, Instant};

use super::{grow, Controller, DupAckAction};

// Gain of the low-pass filter applied to bandwidth samples.
const FILTER_GAIN: f64 = 0.9;

/// Tahoe with a bandwidth-aware threshold.
///
/// Every new acknowledgement yields a bandwidth sample (bytes acknowledged over
/// the time since the previous acknowledgement), smoothed with a discrete
/// Tustin filter. On loss the slow start threshold is set to the estimated
/// bandwidth-delay product `bwe * min_rtt` rather than half the window.
#[derive(Debug, Clone)]
pub struct Westwood {
    mss: usize,
    cwnd: usize,
    ssthresh: usize,
    inflation: usize,
    // Smoothed bandwidth estimate and the last raw sample, in bytes per second.
    bwe: f64,
    last_sample: f64,
    last_ack: Option<Instant>,
    min_rtt: Option<Duration>,
}

impl Westwood {
    pub fn new(mss: usize, initial_cwnd: usize, ssthresh: usize) -> Westwood {
        Westwood {
            mss,
            cwnd: mss * initial_cwnd.max(1),
            ssthresh,
            inflation: 0,
            bwe: 0.0,
            last_sample: 0.0,
            last_ack: None,
            min_rtt: None,
        }
    }

    /// Smoothed bandwidth estimate in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        self.bwe
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    fn sample_bandwidth(&mut self, now: Instant, acked: usize) {
        if let Some(last) = self.last_ack {
            let elapsed = (now - last).as_secs_f64();
            if elapsed > 0.0 {
                let sample = acked as f64 / elapsed;
                self.bwe = FILTER_GAIN * self.bwe
                    + (1.0 - FILTER_GAIN) * (sample + self.last_sample) / 2.0;
                self.last_sample = sample;
            }
        }
        self.last_ack = Some(now);
    }

    fn estimated_threshold(&self) -> usize {
        let bdp = match self.min_rtt {
            Some(rtt) => (self.bwe * rtt.as_secs_f64()) as usize,
            None => 0,
        };
        bdp.max(2 * self.mss)
    }
}

impl Controller for Westwood {
    fn window(&self) -> usize {
        self.cwnd
    }

    fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    fn on_new_ack(&mut self, now: Instant, acked: usize, rtt: Option<Duration>) {
        if let Some(rtt) = rtt {
            self.min_rtt = Some(self.min_rtt.map_or(rtt, |min| min.min(rtt)));
        }
        self.sample_bandwidth(now, acked);

        self.cwnd -= self.inflation;
        self.inflation = 0;
        self.cwnd = grow(self.cwnd, self.ssthresh, self.mss);
        net_trace!(
            "westwood: cwnd={} ssthresh={} bwe={:.0}B/s",
            self.cwnd,
            self.ssthresh,
            self.bwe
        );
    }

    fn on_duplicate_ack(&mut self, _now: Instant, count: u32, _window: usize) -> DupAckAction {
        match count {
            3 => {
                self.ssthresh = self.estimated_threshold();
                self.cwnd = self.mss;
                self.inflation = 0;
                net_trace!(
                    "westwood: fast retransmit, cwnd={} ssthresh={}",
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

    fn on_retransmit_timeout(&mut self, _now: Instant, _window: usize) {
        self.ssthresh = self.estimated_threshold();
        self.cwnd = self.mss;
        self.inflation = 0;
    }
}
