//! Send side of an RTP stream: one per consumer.

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use rtcp::reception_report::ReceptionReport;

use super::{RateCalculator, RtpStream, RtpStreamParams};

/// Retransmission buffer depth in packets.
const RETRANSMISSION_BUFFER_SIZE: usize = 512;

/// Do not resend the same packet more often than this.
const MIN_RESEND_INTERVAL_MS: u128 = 40;

#[derive(Debug)]
struct StoredPacket {
    raw: Bytes,
    stored_at: Instant,
    resent_at: Option<Instant>,
}

#[derive(Debug)]
pub struct RtpStreamSend {
    pub stream: RtpStream,
    rate: RateCalculator,
    /// Recently sent packets by rewritten sequence number, for NACK.
    buffer: BTreeMap<u16, StoredPacket>,
    /// Reported by the remote endpoint in receiver reports.
    pub fraction_lost: u8,
    pub packets_lost: u32,
    pub round_trip_time_ms: f64,
    packets_retransmitted: u64,
}

impl RtpStreamSend {
    pub fn new(params: RtpStreamParams) -> RtpStreamSend {
        RtpStreamSend {
            stream: RtpStream::new(params),
            rate: RateCalculator::new(),
            buffer: BTreeMap::new(),
            fraction_lost: 0,
            packets_lost: 0,
            round_trip_time_ms: 0.0,
            packets_retransmitted: 0,
        }
    }

    /// Account one outgoing packet and keep it for retransmission when the
    /// stream negotiated NACK.
    pub fn send_packet(&mut self, seq: u16, timestamp: u32, raw: Bytes, now: Instant) {
        self.stream.update_seq(seq);
        self.stream.packets_count += 1;
        self.stream.bytes_count += raw.len() as u64;
        if timestamp >= self.stream.max_packet_ts || self.stream.packets_count == 1 {
            self.stream.max_packet_ts = timestamp;
        }
        self.rate.update(raw.len(), now);

        if self.stream.params.use_nack {
            self.buffer.insert(
                seq,
                StoredPacket {
                    raw,
                    stored_at: now,
                    resent_at: None,
                },
            );
            while self.buffer.len() > RETRANSMISSION_BUFFER_SIZE {
                let oldest = *self.buffer.keys().next().unwrap_or(&0);
                self.buffer.remove(&oldest);
            }
        }
    }

    /// Collect the raw packets a NACK asks for, honoring the per-packet
    /// resend pacing.
    pub fn get_retransmissions(
        &mut self,
        lost_seqs: impl Iterator<Item = u16>,
        now: Instant,
    ) -> Vec<Bytes> {
        let mut out = Vec::new();
        for seq in lost_seqs {
            if let Some(stored) = self.buffer.get_mut(&seq) {
                let paced_out = stored
                    .resent_at
                    .map(|at| now.saturating_duration_since(at).as_millis() < MIN_RESEND_INTERVAL_MS)
                    .unwrap_or(false);
                if paced_out {
                    continue;
                }
                stored.resent_at = Some(now);
                out.push(stored.raw.clone());
                self.packets_retransmitted += 1;
            }
        }
        out
    }

    /// Apply a reception report from the remote endpoint. Returns the new
    /// score if it changed.
    pub fn receive_reception_report(&mut self, report: &ReceptionReport) -> Option<u8> {
        self.fraction_lost = report.fraction_lost;
        self.packets_lost = report.total_lost;

        let previous = self.stream.score();
        let delivered = 1.0 - f64::from(self.fraction_lost) / 256.0;
        let sample = (10.0 * delivered.powi(4)).round() as u8;
        let new_score = ((u16::from(previous) * 2 + u16::from(sample) * 2 + 2) / 4).min(10) as u8;

        if new_score != previous {
            self.stream.set_score(new_score);
            Some(new_score)
        } else {
            None
        }
    }

    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.rate.rate(now)
    }

    pub fn packets_retransmitted(&self) -> u64 {
        self.packets_retransmitted
    }
}
