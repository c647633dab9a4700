//! Shared per-peer state: smoothed RTT and path MTU.
//!
//! A `Peer` is shared between every call to the same remote endpoint and
//! between the receive and transmit engines, so the RTT estimator sits
//! behind a mutex and the values hot paths read (`srtt`, `rtt_count`) are
//! published through atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ── RTT estimator constants ────────────────────────────────────────────────
const RTO_MIN_MS: u64 = 50;
const RTO_MAX_MS: u64 = 1000;
const SRTT_ALPHA: f64 = 0.125;
const RTTVAR_BETA: f64 = 0.25;

/// RTT estimator (TCP-style SRTT/RTTVAR).
#[derive(Debug)]
struct RttEstimator {
    srtt: f64,
    rttvar: f64,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
        }
    }

    fn update(&mut self, first_sample: bool, rtt_ms: f64) {
        if first_sample {
            self.srtt = rtt_ms;
            self.rttvar = rtt_ms / 2.0;
        } else {
            self.rttvar =
                (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (self.srtt - rtt_ms).abs();
            self.srtt = (1.0 - SRTT_ALPHA) * self.srtt + SRTT_ALPHA * rtt_ms;
        }
    }

    /// Retransmission timeout in milliseconds.
    fn rto_ms(&self) -> u64 {
        let rto = (self.srtt + 4.0 * self.rttvar) as u64;
        rto.clamp(RTO_MIN_MS, RTO_MAX_MS)
    }
}

struct MtuState {
    /// Largest data payload the path is believed to carry.
    maxdata: u32,
    /// `maxdata` plus the transport header overhead.
    mtu: u32,
}

/// Shared state for one remote endpoint.
pub struct Peer {
    estimator: Mutex<RttEstimator>,
    /// Smoothed RTT in microseconds; 0 until the first sample lands.
    srtt_us: AtomicU64,
    /// Number of RTT samples taken.
    rtt_count: AtomicU32,
    mtu_state: Mutex<MtuState>,
    hdrsize: u32,
}

impl Peer {
    pub fn new(hdrsize: u32, maxdata: u32) -> Self {
        Self {
            estimator: Mutex::new(RttEstimator::new()),
            srtt_us: AtomicU64::new(0),
            rtt_count: AtomicU32::new(0),
            mtu_state: Mutex::new(MtuState {
                maxdata,
                mtu: maxdata + hdrsize,
            }),
            hdrsize,
        }
    }

    /// Feed one measured round-trip sample into the estimator.
    pub fn add_rtt(&self, sample: Duration) {
        let rtt_ms = sample.as_secs_f64() * 1000.0;
        let mut est = self.estimator.lock().unwrap();
        let first = self.rtt_count.load(Ordering::Relaxed) == 0;
        est.update(first, rtt_ms);
        self.srtt_us
            .store((est.srtt * 1000.0) as u64, Ordering::Release);
        self.rtt_count.fetch_add(1, Ordering::Release);
        log::trace!(
            "peer rtt sample {:.1}ms srtt={:.1}ms rttvar={:.1}ms",
            rtt_ms,
            est.srtt,
            est.rttvar
        );
    }

    /// The current smoothed RTT. Zero until a sample has been taken.
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us.load(Ordering::Acquire))
    }

    pub fn rtt_count(&self) -> u32 {
        self.rtt_count.load(Ordering::Acquire)
    }

    /// Retransmission timeout derived from the estimator, for the
    /// external resend timer.
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.estimator.lock().unwrap().rto_ms())
    }

    pub fn maxdata(&self) -> u32 {
        self.mtu_state.lock().unwrap().maxdata
    }

    pub fn mtu(&self) -> u32 {
        self.mtu_state.lock().unwrap().mtu
    }

    pub fn hdrsize(&self) -> u32 {
        self.hdrsize
    }

    /// Lower the path MTU from an ackinfo trailer. Only ever shrinks.
    pub(crate) fn update_mtu(&self, maxdata: u32) {
        let mut state = self.mtu_state.lock().unwrap();
        if maxdata < state.maxdata {
            state.maxdata = maxdata;
            state.mtu = maxdata + self.hdrsize;
            log::debug!("peer mtu {} (maxdata {})", state.mtu, state.maxdata);
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("srtt_us", &self.srtt_us.load(Ordering::Relaxed))
            .field("rtt_count", &self.rtt_count.load(Ordering::Relaxed))
            .field("hdrsize", &self.hdrsize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_srtt() {
        let peer = Peer::new(28, 1444);
        peer.add_rtt(Duration::from_millis(100));
        assert_eq!(peer.rtt_count(), 1);
        assert_eq!(peer.srtt(), Duration::from_millis(100));
    }

    #[test]
    fn srtt_smooths_toward_new_samples() {
        let peer = Peer::new(28, 1444);
        peer.add_rtt(Duration::from_millis(100));
        peer.add_rtt(Duration::from_millis(200));
        // srtt = 7/8 * 100 + 1/8 * 200 = 112.5ms
        assert_eq!(peer.srtt(), Duration::from_micros(112_500));
        assert_eq!(peer.rtt_count(), 2);
    }

    #[test]
    fn rto_is_clamped() {
        let peer = Peer::new(28, 1444);
        peer.add_rtt(Duration::from_millis(1));
        assert_eq!(peer.rto(), Duration::from_millis(RTO_MIN_MS));
        for _ in 0..16 {
            peer.add_rtt(Duration::from_secs(5));
        }
        assert_eq!(peer.rto(), Duration::from_millis(RTO_MAX_MS));
    }

    #[test]
    fn mtu_only_shrinks() {
        let peer = Peer::new(28, 1444);
        peer.update_mtu(1200);
        assert_eq!(peer.maxdata(), 1200);
        assert_eq!(peer.mtu(), 1228);
        peer.update_mtu(1400);
        assert_eq!(peer.maxdata(), 1200);
    }
}
