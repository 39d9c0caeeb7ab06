pub mod recv;
pub mod send;

#[cfg(test)]
mod recv_test;

use std::time::{Duration, Instant};

/// Static description of one RTP stream inside a producer or consumer.
#[derive(Debug, Clone, Default)]
pub struct RtpStreamParams {
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: String,
    pub clock_rate: u32,
    pub rid: Option<String>,
    pub cname: Option<String>,
    pub rtx_ssrc: Option<u32>,
    pub rtx_payload_type: Option<u8>,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
    pub spatial_layers: u8,
    pub temporal_layers: u8,
}

/// Sliding-window byte rate, 1 s window in 100 ms buckets.
#[derive(Debug)]
pub struct RateCalculator {
    buckets: [u64; Self::BUCKETS],
    newest_index: usize,
    newest_time: Option<Instant>,
}

impl RateCalculator {
    const BUCKETS: usize = 10;
    const BUCKET_MS: u64 = 100;

    pub fn new() -> RateCalculator {
        RateCalculator {
            buckets: [0; Self::BUCKETS],
            newest_index: 0,
            newest_time: None,
        }
    }

    pub fn update(&mut self, size: usize, now: Instant) {
        self.advance(now);
        self.buckets[self.newest_index] += size as u64;
    }

    /// Bits per second over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> u32 {
        self.advance(now);
        let bytes: u64 = self.buckets.iter().sum();
        (bytes * 8 * 1000 / (Self::BUCKETS as u64 * Self::BUCKET_MS)) as u32
    }

    fn advance(&mut self, now: Instant) {
        let Some(newest_time) = self.newest_time else {
            self.newest_time = Some(now);
            return;
        };

        let elapsed = now.saturating_duration_since(newest_time);
        let steps = (elapsed.as_millis() as u64 / Self::BUCKET_MS) as usize;
        if steps == 0 {
            return;
        }

        for _ in 0..steps.min(Self::BUCKETS) {
            self.newest_index = (self.newest_index + 1) % Self::BUCKETS;
            self.buckets[self.newest_index] = 0;
        }
        self.newest_time = Some(newest_time + Duration::from_millis(steps as u64 * Self::BUCKET_MS));
    }
}

impl Default for RateCalculator {
    fn default() -> Self {
        RateCalculator::new()
    }
}

/// RFC 3550 sequence number tracking shared by both stream directions.
#[derive(Debug, Default)]
pub struct RtpStream {
    pub params: RtpStreamParams,
    started: bool,
    pub(crate) max_seq: u16,
    pub(crate) cycles: u32,
    base_seq: u32,
    bad_seq: Option<u32>,
    pub(crate) max_packet_ts: u32,
    pub packets_count: u64,
    pub bytes_count: u64,
    score: u8,
}

const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;

impl RtpStream {
    pub fn new(params: RtpStreamParams) -> RtpStream {
        RtpStream {
            params,
            ..Default::default()
        }
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub(crate) fn set_score(&mut self, score: u8) {
        self.score = score.min(10);
    }

    /// Extended highest sequence number received.
    pub fn extended_highest_seq(&self) -> u32 {
        (self.cycles << 16) | u32::from(self.max_seq)
    }

    pub(crate) fn expected_packets(&self) -> u32 {
        self.extended_highest_seq().wrapping_sub(self.base_seq).wrapping_add(1)
    }

    /// RFC 3550 A.1 update_seq. Returns false when the packet is outside
    /// the valid sequence window and must be dropped.
    pub(crate) fn update_seq(&mut self, seq: u16) -> bool {
        if !self.started {
            self.started = true;
            self.base_seq = u32::from(seq);
            self.max_seq = seq;
            return true;
        }

        let udelta = seq.wrapping_sub(self.max_seq);

        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(1);
            }
            self.max_seq = seq;
            true
        } else if udelta <= u16::MAX - MAX_MISORDER {
            // A very large jump.
            if Some(u32::from(seq)) == self.bad_seq {
                // Two sequential packets: assume the other side restarted.
                self.started = false;
                self.bad_seq = None;
                self.update_seq(seq)
            } else {
                self.bad_seq = Some(u32::from(seq.wrapping_add(1)));
                false
            }
        } else {
            // Duplicate or reordered packet within the misorder window.
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_calculator_measures_bitrate() {
        let mut rate = RateCalculator::new();
        let start = Instant::now();

        // 125 bytes every 100 ms over one second = 1000 bits per 100 ms.
        for i in 0..10u64 {
            rate.update(125, start + Duration::from_millis(i * 100));
        }

        let bps = rate.rate(start + Duration::from_millis(950));
        assert_eq!(bps, 10_000);
    }

    #[test]
    fn rate_decays_to_zero() {
        let mut rate = RateCalculator::new();
        let start = Instant::now();
        rate.update(10_000, start);
        assert_eq!(rate.rate(start + Duration::from_secs(5)), 0);
    }

    #[test]
    fn update_seq_tracks_cycles() {
        let mut stream = RtpStream::new(RtpStreamParams::default());
        assert!(stream.update_seq(65534));
        assert!(stream.update_seq(65535));
        assert!(stream.update_seq(0));
        assert_eq!(stream.cycles, 1);
        assert_eq!(stream.extended_highest_seq(), 0x10000);
    }

    #[test]
    fn update_seq_rejects_wild_jump_once() {
        let mut stream = RtpStream::new(RtpStreamParams::default());
        assert!(stream.update_seq(10));
        assert!(!stream.update_seq(40000));
        // The jump repeats sequentially: treated as a restart.
        assert!(stream.update_seq(40001));
        assert_eq!(stream.max_seq, 40001);
    }
}
