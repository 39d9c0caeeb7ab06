//! Receive side of an RTP stream: one per producer encoding.

use std::time::Instant;

use rtp::packet::Packet;

use super::{RateCalculator, RtpStream, RtpStreamParams};

/// Ticks between score updates are driven by the owning producer.
pub const SCORE_TICK_INTERVAL_MS: u64 = 2500;

/// A stream is considered healthy at or above this score.
pub const HEALTHY_SCORE: u8 = 7;

#[derive(Debug)]
pub struct RtpStreamRecv {
    pub stream: RtpStream,
    rate: RateCalculator,
    /// RFC 3550 A.8 interarrival jitter state.
    jitter: f64,
    last_transit: Option<i64>,
    /// Counters at the previous score tick.
    expected_prior: u32,
    received_prior: u64,
    /// Last sender report info, for RR generation.
    last_sr_ntp: Option<(u32, Instant)>,
    /// A PLI/FIR towards the remote producer is in flight for this stream.
    pub key_frame_request_pending: bool,
    last_packet_at: Option<Instant>,
    first_packet_at: Option<Instant>,
    rtx_packets: u64,
}

impl RtpStreamRecv {
    pub fn new(params: RtpStreamParams) -> RtpStreamRecv {
        // Optimistic until the first stats tick proves otherwise.
        let mut stream = RtpStream::new(params);
        stream.set_score(10);

        RtpStreamRecv {
            stream,
            rate: RateCalculator::new(),
            jitter: 0.0,
            last_transit: None,
            expected_prior: 0,
            received_prior: 0,
            last_sr_ntp: None,
            key_frame_request_pending: false,
            last_packet_at: None,
            first_packet_at: None,
            rtx_packets: 0,
        }
    }

    /// Feed one media packet. Returns false for packets outside the valid
    /// sequence window (dropped upstream).
    pub fn receive_packet(&mut self, packet: &Packet, wire_len: usize, now: Instant) -> bool {
        if !self.stream.update_seq(packet.header.sequence_number) {
            return false;
        }

        self.stream.packets_count += 1;
        self.stream.bytes_count += wire_len as u64;
        self.rate.update(wire_len, now);
        self.first_packet_at.get_or_insert(now);
        self.last_packet_at = Some(now);

        if packet.header.timestamp >= self.stream.max_packet_ts
            || self.stream.packets_count == 1
        {
            self.stream.max_packet_ts = packet.header.timestamp;
        }

        self.update_jitter(packet.header.timestamp, now);
        true
    }

    /// Feed one retransmitted packet already restored to its media form.
    pub fn receive_rtx_packet(&mut self, packet: &Packet, wire_len: usize, now: Instant) -> bool {
        self.rtx_packets += 1;
        self.receive_packet(packet, wire_len, now)
    }

    fn update_jitter(&mut self, rtp_ts: u32, now: Instant) {
        let clock_rate = self.stream.params.clock_rate;
        if clock_rate == 0 {
            return;
        }
        let Some(base) = self.first_packet_at else {
            return;
        };
        let elapsed = now.saturating_duration_since(base);
        let arrival_ts = (elapsed.as_secs_f64() * f64::from(clock_rate)) as i64;
        let transit = arrival_ts - i64::from(rtp_ts);
        if let Some(last_transit) = self.last_transit {
            let d = (transit - last_transit).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }

    /// Interarrival jitter in clock rate units, RFC 3550 A.8.
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.rate.rate(now)
    }

    pub fn record_sender_report(&mut self, ntp_middle: u32, now: Instant) {
        self.last_sr_ntp = Some((ntp_middle, now));
    }

    /// Fraction of packets lost since the previous tick, in 0..=255 units.
    pub fn fraction_lost(&mut self) -> u8 {
        let expected = self.stream.expected_packets();
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.stream.packets_count - self.received_prior;

        self.expected_prior = expected;
        self.received_prior = self.stream.packets_count;

        if expected_interval == 0 || u64::from(expected_interval) <= received_interval {
            return 0;
        }
        let lost = u64::from(expected_interval) - received_interval;
        ((lost << 8) / u64::from(expected_interval)).min(255) as u8
    }

    /// Recompute the stream score. Called on the producer's stats tick;
    /// returns the new score if it changed.
    pub fn update_score(&mut self, now: Instant) -> Option<u8> {
        let previous = self.stream.score();

        let active = self
            .last_packet_at
            .map(|at| now.saturating_duration_since(at).as_millis() < 2 * SCORE_TICK_INTERVAL_MS as u128)
            .unwrap_or(false);

        let new_score = if !active {
            0
        } else {
            let fraction_lost = self.fraction_lost();
            let delivered = 1.0 - f64::from(fraction_lost) / 256.0;
            // Losses degrade the score steeply: 10 only for clean delivery.
            let sample = (10.0 * delivered.powi(4)).round() as u8;
            ((u16::from(previous) * 2 + u16::from(sample) * 2 + 2) / 4).min(10) as u8
        };

        if new_score != previous {
            self.stream.set_score(new_score);
            Some(new_score)
        } else {
            None
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.stream.score() >= HEALTHY_SCORE
    }

    /// Whether the stream produced packets recently enough to be switched to.
    pub fn is_active(&self, now: Instant) -> bool {
        self.last_packet_at
            .map(|at| now.saturating_duration_since(at).as_millis() < 2000)
            .unwrap_or(false)
    }
}
