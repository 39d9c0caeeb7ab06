//! Outgoing bandwidth estimation and allocation input.
//!
//! Consumers echo REMB and transport-wide-CC feedback from their endpoints;
//! the transport aggregates both into one smoothed available-bitrate figure
//! that drives the per-consumer allocator. The estimator is intentionally
//! conservative: REMB is authoritative when present, TCC degrades the
//! current estimate by the observed delivery ratio.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rtcp::transport_feedbacks::transport_layer_cc::{SymbolTypeTcc, TransportLayerCc};

/// Relative change below which a new estimate is not propagated.
const MIN_RELATIVE_CHANGE: f64 = 0.05;

#[derive(Debug, Default)]
struct EstimatorState {
    smoothed: f64,
    last_sample_at: Option<Instant>,
}

#[derive(Debug)]
pub struct TransportBwe {
    /// EWMA alpha: weight of the previous estimate.
    alpha: f64,
    state: Mutex<EstimatorState>,
    available: AtomicU32,
}

impl TransportBwe {
    pub fn new(alpha: f64) -> TransportBwe {
        TransportBwe {
            alpha,
            state: Mutex::new(EstimatorState::default()),
            available: AtomicU32::new(0),
        }
    }

    /// Smoothed available outgoing bitrate in bps. 0 until feedback arrives.
    pub fn available_bitrate(&self) -> u32 {
        self.available.load(Ordering::Relaxed)
    }

    /// Feed a REMB value. Returns the new available bitrate when it moved
    /// enough to re-run allocation.
    pub fn on_remb(&self, bitrate: f32, now: Instant) -> Option<u32> {
        if bitrate <= 0.0 {
            return None;
        }
        self.push_sample(f64::from(bitrate), now)
    }

    /// Feed a transport-wide-CC feedback packet: the delivery ratio of the
    /// acknowledged window scales the current send rate estimate.
    pub fn on_transport_feedback(
        &self,
        feedback: &TransportLayerCc,
        send_bitrate: u32,
        now: Instant,
    ) -> Option<u32> {
        let total = u32::from(feedback.packet_status_count);
        if total == 0 || send_bitrate == 0 {
            return None;
        }

        let mut received = 0u32;
        for chunk in &feedback.packet_chunks {
            received += chunk_received_count(chunk);
        }
        let ratio = (f64::from(received.min(total)) / f64::from(total)).clamp(0.0, 1.0);

        // Full delivery probes slightly above the current rate.
        let sample = f64::from(send_bitrate) * if ratio >= 1.0 { 1.08 } else { ratio };
        self.push_sample(sample, now)
    }

    fn push_sample(&self, sample: f64, now: Instant) -> Option<u32> {
        let mut state = self.state.lock().unwrap();
        state.smoothed = if state.last_sample_at.is_none() {
            sample
        } else {
            self.alpha * state.smoothed + (1.0 - self.alpha) * sample
        };
        state.last_sample_at = Some(now);

        let previous = self.available.load(Ordering::Relaxed);
        let new = state.smoothed as u32;
        let moved = if previous == 0 {
            new != 0
        } else {
            let delta = (f64::from(new) - f64::from(previous)).abs();
            delta / f64::from(previous) >= MIN_RELATIVE_CHANGE
        };

        if moved {
            self.available.store(new, Ordering::Relaxed);
            Some(new)
        } else {
            None
        }
    }
}

fn chunk_received_count(chunk: &rtcp::transport_feedbacks::transport_layer_cc::PacketStatusChunk) -> u32 {
    use rtcp::transport_feedbacks::transport_layer_cc::PacketStatusChunk;
    match chunk {
        PacketStatusChunk::RunLengthChunk(c) => {
            if c.packet_status_symbol != SymbolTypeTcc::PacketNotReceived {
                u32::from(c.run_length)
            } else {
                0
            }
        }
        PacketStatusChunk::StatusVectorChunk(c) => c
            .symbol_list
            .iter()
            .filter(|s| **s != SymbolTypeTcc::PacketNotReceived)
            .count() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_remb_sets_estimate() {
        let bwe = TransportBwe::new(0.85);
        let now = Instant::now();
        assert_eq!(bwe.on_remb(1_000_000.0, now), Some(1_000_000));
        assert_eq!(bwe.available_bitrate(), 1_000_000);
    }

    #[test]
    fn small_moves_are_absorbed() {
        let bwe = TransportBwe::new(0.85);
        let now = Instant::now();
        bwe.on_remb(1_000_000.0, now);
        // A 1% sample change moves the EWMA far less than the 5% threshold.
        assert_eq!(bwe.on_remb(1_010_000.0, now), None);
    }

    #[test]
    fn sustained_drop_propagates() {
        let bwe = TransportBwe::new(0.5);
        let now = Instant::now();
        bwe.on_remb(1_000_000.0, now);
        let updated = bwe.on_remb(200_000.0, now);
        assert!(updated.is_some());
        assert!(bwe.available_bitrate() < 1_000_000);
    }
}
