//! Round-trip time estimation and retransmission timeout computation.

use alloc::collections::VecDeque;

use crate::time::{Duration, Instant};
use crate::wire::TcpSeqNumber;

/// How the smoothed estimate is turned into a retransmission timeout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RtoRule {
    /// `max(srtt + 4 * rttvar, min_rto) * multiplier`.
    #[default]
    MeanDeviation,
    /// `2 * srtt * multiplier` while the variation is small compared to the
    /// estimate, `(srtt + 4 * rttvar) * multiplier` otherwise; never below `min_rto`.
    FloorDoubling,
}

/// Parameters of the RTT estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct Config {
    /// Gain applied to the estimate error.
    pub alpha: f64,
    /// Gain applied to the variation error.
    pub beta: f64,
    /// Estimate used before the first sample.
    pub initial_estimate: Duration,
    pub min_rto: Duration,
    pub max_multiplier: u16,
    pub rule: RtoRule,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            alpha: 0.125,
            beta: 0.25,
            initial_estimate: Duration::from_secs(1),
            min_rto: Duration::from_millis(200),
            max_multiplier: 64,
            rule: RtoRule::MeanDeviation,
        }
    }
}

/// An update rule for the smoothed round-trip time.
#[allow(unused_variables)]
pub(crate) trait Estimator {
    /// Fold one round-trip sample into the estimate.
    fn measurement(&mut self, sample: Duration);

    /// Timeout for the given backoff multiplier and floor.
    fn retransmit_timeout(&self, multiplier: u16, min_rto: Duration) -> Duration;

    fn estimate(&self) -> Duration;

    fn variation(&self) -> Duration;

    fn reset(&mut self, initial_estimate: Duration) {}
}

/// Jacobson/Karels smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MeanDeviation {
    alpha: f64,
    beta: f64,
    estimate: Duration,
    variation: Duration,
    samples: u32,
}

impl MeanDeviation {
    pub fn new(alpha: f64, beta: f64, initial_estimate: Duration) -> MeanDeviation {
        MeanDeviation {
            alpha,
            beta,
            estimate: initial_estimate,
            variation: Duration::ZERO,
            samples: 0,
        }
    }
}

impl Estimator for MeanDeviation {
    fn measurement(&mut self, sample: Duration) {
        if self.samples == 0 {
            self.estimate = sample;
            self.variation = sample / 2;
        } else {
            let estimate = self.estimate.total_micros() as f64;
            let variation = self.variation.total_micros() as f64;
            let err = sample.total_micros() as f64 - estimate;
            self.estimate = Duration::from_micros_f64(estimate + self.alpha * err);
            self.variation =
                Duration::from_micros_f64(variation + self.beta * (err.abs() - variation));
        }
        self.samples += 1;
    }

    fn retransmit_timeout(&self, multiplier: u16, min_rto: Duration) -> Duration {
        (self.estimate + self.variation * 4).max(min_rto) * multiplier as u32
    }

    fn estimate(&self) -> Duration {
        self.estimate
    }

    fn variation(&self) -> Duration {
        self.variation
    }

    fn reset(&mut self, initial_estimate: Duration) {
        self.estimate = initial_estimate;
        self.variation = Duration::ZERO;
        self.samples = 0;
    }
}

/// Jacobson/Karels smoothing with a doubled-estimate floor on the timeout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FloorDoubling {
    inner: MeanDeviation,
}

impl FloorDoubling {
    pub fn new(alpha: f64, beta: f64, initial_estimate: Duration) -> FloorDoubling {
        FloorDoubling {
            inner: MeanDeviation::new(alpha, beta, initial_estimate),
        }
    }
}

impl Estimator for FloorDoubling {
    fn measurement(&mut self, sample: Duration) {
        self.inner.measurement(sample)
    }

    fn retransmit_timeout(&self, multiplier: u16, min_rto: Duration) -> Duration {
        let estimate = self.inner.estimate;
        let variation = self.inner.variation;
        let timeout = if variation < estimate / 4 {
            estimate * 2 * multiplier as u32
        } else {
            (estimate + variation * 4) * multiplier as u32
        };
        timeout.max(min_rto)
    }

    fn estimate(&self) -> Duration {
        self.inner.estimate
    }

    fn variation(&self) -> Duration {
        self.inner.variation
    }

    fn reset(&mut self, initial_estimate: Duration) {
        self.inner.reset(initial_estimate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum AnyEstimator {
    MeanDeviation(MeanDeviation),
    FloorDoubling(FloorDoubling),
}

impl AnyEstimator {
    pub fn new(config: &Config) -> AnyEstimator {
        match config.rule {
            RtoRule::MeanDeviation => AnyEstimator::MeanDeviation(MeanDeviation::new(
                config.alpha,
                config.beta,
                config.initial_estimate,
            )),
            RtoRule::FloorDoubling => AnyEstimator::FloorDoubling(FloorDoubling::new(
                config.alpha,
                config.beta,
                config.initial_estimate,
            )),
        }
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut dyn Estimator {
        match self {
            AnyEstimator::MeanDeviation(e) => e,
            AnyEstimator::FloorDoubling(e) => e,
        }
    }

    #[inline]
    pub fn inner(&self) -> &dyn Estimator {
        match self {
            AnyEstimator::MeanDeviation(e) => e,
            AnyEstimator::FloorDoubling(e) => e,
        }
    }
}

/// One transmission the estimator is waiting to see acknowledged.
#[derive(Debug, Clone, Copy, PartialEq)]
struct History {
    seq: TcpSeqNumber,
    count: usize,
    time: Instant,
    retx: bool,
}

impl History {
    fn end(&self) -> TcpSeqNumber {
        self.seq + self.count
    }
}

/// Tracks outstanding segments, samples round-trip times from their
/// acknowledgements and derives the retransmission timeout.
///
/// Samples are only ever taken from the oldest outstanding segment, and never
/// from one that was retransmitted.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    config: Config,
    estimator: AnyEstimator,
    history: VecDeque<History>,
    next: TcpSeqNumber,
    multiplier: u16,
    samples: u32,
}

impl RttEstimator {
    pub fn new(config: Config) -> RttEstimator {
        RttEstimator {
            estimator: AnyEstimator::new(&config),
            config,
            history: VecDeque::new(),
            next: TcpSeqNumber(1),
            multiplier: 1,
            samples: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Smoothed round-trip time.
    pub fn estimate(&self) -> Duration {
        self.estimator.inner().estimate()
    }

    /// Smoothed mean deviation of the round-trip time.
    pub fn variation(&self) -> Duration {
        self.estimator.inner().variation()
    }

    /// Number of samples taken since the last reset.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Current backoff multiplier.
    pub fn multiplier(&self) -> u16 {
        self.multiplier
    }

    /// Fold a sample into the estimate.
    pub fn measurement(&mut self, sample: Duration) {
        self.estimator.inner_mut().measurement(sample);
        self.samples += 1;
        tcp_trace!(
            "rtte: sample={} srtt={} rttvar={} rto={}",
            sample,
            self.estimate(),
            self.variation(),
            self.retransmit_timeout()
        );
    }

    pub fn retransmit_timeout(&self) -> Duration {
        self.estimator
            .inner()
            .retransmit_timeout(self.multiplier, self.config.min_rto)
    }

    /// Double the backoff multiplier, up to the configured maximum.
    pub fn increase_multiplier(&mut self) {
        self.multiplier = self
            .multiplier
            .saturating_mul(2)
            .min(self.config.max_multiplier);
        tcp_trace!("rtte: backoff multiplier {}", self.multiplier);
    }

    pub fn reset_multiplier(&mut self) {
        self.multiplier = 1;
    }

    /// Record that `count` bytes starting at `seq` were put on the wire at `now`.
    pub fn sent_seq(&mut self, now: Instant, seq: TcpSeqNumber, count: usize) {
        if seq == self.next {
            self.history.push_back(History {
                seq,
                count,
                time: now,
                retx: false,
            });
            self.next = seq + count;
            return;
        }

        for entry in self.history.iter_mut() {
            if seq >= entry.seq && seq < entry.end() {
                entry.retx = true;
                let end = seq + count;
                if end > entry.end() {
                    entry.count = (end - entry.seq) as usize;
                }
                if end > self.next {
                    self.next = end;
                }
                tcp_trace!("rtte: seq={} marked as retransmitted", entry.seq);
                break;
            }
        }
    }

    /// Account for an acknowledgement of everything below `ack`, returning the
    /// round-trip sample it produced, if any.
    pub fn ack_seq(&mut self, now: Instant, ack: TcpSeqNumber) -> Option<Duration> {
        let mut sample = None;
        if let Some(front) = self.history.front() {
            if !front.retx && ack >= front.end() {
                let rtt = now - front.time;
                self.measurement(rtt);
                self.reset_multiplier();
                sample = Some(rtt);
            }
        }

        while let Some(front) = self.history.front() {
            if front.end() > ack {
                break;
            }
            self.history.pop_front();
        }
        sample
    }

    /// Forget every outstanding transmission.
    pub fn clear_sent(&mut self) {
        self.history.clear();
        self.next = TcpSeqNumber(1);
    }

    /// Return to the configured initial state.
    pub fn reset(&mut self) {
        self.estimator.inner_mut().reset(self.config.initial_estimate);
        self.clear_sent();
        self.multiplier = 1;
        self.samples = 0;
    }

    /// A fresh estimator with the same configuration and current estimate,
    /// but no outstanding history.
    pub(crate) fn fork(&self) -> RttEstimator {
        RttEstimator {
            config: self.config,
            estimator: self.estimator,
            history: VecDeque::new(),
            next: self.next,
            multiplier: self.multiplier,
            samples: self.samples,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn estimator(alpha: f64, beta: f64) -> RttEstimator {
        RttEstimator::new(Config {
            alpha,
            beta,
            ..Config::default()
        })
    }

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_initial_timeout() {
        let rtte = RttEstimator::new(Config::default());
        assert_eq!(rtte.retransmit_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_recurrence() {
        let mut rtte = estimator(0.125, 0.25);

        rtte.measurement(millis(1000));
        assert_eq!(rtte.estimate(), millis(1000));
        assert_eq!(rtte.variation(), millis(500));

        rtte.measurement(millis(1200));
        assert_eq!(rtte.estimate(), Duration::from_micros(1_025_000));
        assert_eq!(rtte.variation(), Duration::from_micros(425_000));

        rtte.measurement(millis(900));
        assert_eq!(rtte.estimate(), Duration::from_micros(1_009_375));
        assert_eq!(rtte.variation(), Duration::from_micros(350_000));
        assert_eq!(rtte.samples(), 3);
    }

    #[test]
    fn test_zero_gain_freezes_estimate() {
        let mut rtte = estimator(0.0, 0.0);
        rtte.measurement(millis(1000));
        rtte.measurement(millis(3000));
        rtte.measurement(millis(10));
        assert_eq!(rtte.estimate(), millis(1000));
        assert_eq!(rtte.variation(), millis(500));
    }

    #[test]
    fn test_unit_gain_follows_sample() {
        let mut rtte = estimator(1.0, 1.0);
        rtte.measurement(millis(1000));
        rtte.measurement(millis(1300));
        assert_eq!(rtte.estimate(), millis(1300));
        assert_eq!(rtte.variation(), millis(300));
        rtte.measurement(millis(700));
        assert_eq!(rtte.estimate(), millis(700));
        assert_eq!(rtte.variation(), millis(600));
    }

    #[test]
    fn test_timeout_and_backoff() {
        let mut rtte = estimator(0.125, 0.25);
        rtte.measurement(millis(100));
        // 100 + 4 * 50
        assert_eq!(rtte.retransmit_timeout(), millis(300));

        rtte.increase_multiplier();
        assert_eq!(rtte.retransmit_timeout(), millis(600));
        for _ in 0..10 {
            rtte.increase_multiplier();
        }
        assert_eq!(rtte.multiplier(), 64);
        assert_eq!(rtte.retransmit_timeout(), millis(300 * 64));

        rtte.reset_multiplier();
        assert_eq!(rtte.retransmit_timeout(), millis(300));
    }

    #[test]
    fn test_min_rto_floor() {
        let mut rtte = estimator(0.125, 0.25);
        rtte.measurement(millis(10));
        assert_eq!(rtte.retransmit_timeout(), millis(200));
    }

    #[test]
    fn test_floor_doubling_rule() {
        let mut rtte = RttEstimator::new(Config {
            rule: RtoRule::FloorDoubling,
            ..Config::default()
        });
        rtte.measurement(millis(1000));
        // variation (500) >= estimate / 4 (250)
        assert_eq!(rtte.retransmit_timeout(), millis(3000));

        for _ in 0..20 {
            rtte.measurement(millis(1000));
        }
        // variation has decayed below estimate / 4
        assert!(rtte.variation() < millis(250));
        assert_eq!(rtte.retransmit_timeout(), millis(2000));
    }

    #[test]
    fn test_ack_seq_samples_front() {
        let mut rtte = RttEstimator::new(Config::default());
        rtte.sent_seq(Instant::from_millis(0), TcpSeqNumber(1), 100);
        rtte.sent_seq(Instant::from_millis(10), TcpSeqNumber(101), 100);

        assert_eq!(rtte.ack_seq(Instant::from_millis(50), TcpSeqNumber(50)), None);
        assert_eq!(
            rtte.ack_seq(Instant::from_millis(80), TcpSeqNumber(101)),
            Some(millis(80))
        );
        assert_eq!(
            rtte.ack_seq(Instant::from_millis(100), TcpSeqNumber(201)),
            Some(millis(90))
        );
        assert_eq!(rtte.ack_seq(Instant::from_millis(120), TcpSeqNumber(201)), None);
    }

    #[test]
    fn test_karn_rule() {
        let mut rtte = RttEstimator::new(Config::default());
        rtte.sent_seq(Instant::from_millis(0), TcpSeqNumber(1), 100);
        rtte.increase_multiplier();
        rtte.sent_seq(Instant::from_millis(1000), TcpSeqNumber(1), 100);

        assert_eq!(rtte.ack_seq(Instant::from_millis(1010), TcpSeqNumber(101)), None);
        assert_eq!(rtte.samples(), 0);
        assert_eq!(rtte.multiplier(), 2);
    }

    #[test]
    fn test_retransmission_extends_entry() {
        let mut rtte = RttEstimator::new(Config::default());
        rtte.sent_seq(Instant::from_millis(0), TcpSeqNumber(1), 100);
        rtte.sent_seq(Instant::from_millis(500), TcpSeqNumber(51), 100);

        // The extended entry now ends at 151 and is marked retransmitted.
        assert_eq!(rtte.ack_seq(Instant::from_millis(600), TcpSeqNumber(101)), None);
        assert_eq!(rtte.ack_seq(Instant::from_millis(600), TcpSeqNumber(151)), None);
        rtte.sent_seq(Instant::from_millis(700), TcpSeqNumber(151), 10);
        assert_eq!(
            rtte.ack_seq(Instant::from_millis(710), TcpSeqNumber(161)),
            Some(millis(10))
        );
    }

    #[test]
    fn test_retransmission_extends_earlier_entry() {
        let mut rtte = RttEstimator::new(Config::default());
        rtte.sent_seq(Instant::from_millis(0), TcpSeqNumber(1), 100);
        rtte.sent_seq(Instant::from_millis(10), TcpSeqNumber(101), 10);
        rtte.sent_seq(Instant::from_millis(500), TcpSeqNumber(51), 100);

        assert_eq!(rtte.history.len(), 2);
        assert_eq!(rtte.history[0].end(), TcpSeqNumber(151));
        assert!(rtte.history[0].retx);

        // Everything up to 141 is acknowledged, but the first entry reaches 151.
        assert_eq!(rtte.ack_seq(Instant::from_millis(600), TcpSeqNumber(141)), None);
        assert_eq!(rtte.history.front().map(History::end), Some(TcpSeqNumber(151)));

        assert_eq!(rtte.ack_seq(Instant::from_millis(610), TcpSeqNumber(151)), None);
        assert!(rtte.history.is_empty());
        rtte.sent_seq(Instant::from_millis(700), TcpSeqNumber(151), 10);
        assert_eq!(
            rtte.ack_seq(Instant::from_millis(720), TcpSeqNumber(161)),
            Some(millis(20))
        );
    }
}
