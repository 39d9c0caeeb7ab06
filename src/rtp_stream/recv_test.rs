use std::time::{Duration, Instant};

use rtp::packet::Packet;

use super::recv::RtpStreamRecv;
use super::RtpStreamParams;

fn media_packet(seq: u16, timestamp: u32) -> Packet {
    let mut packet = Packet::default();
    packet.header.version = 2;
    packet.header.payload_type = 101;
    packet.header.sequence_number = seq;
    packet.header.timestamp = timestamp;
    packet.header.ssrc = 1111;
    packet
}

fn params() -> RtpStreamParams {
    RtpStreamParams {
        ssrc: 1111,
        payload_type: 101,
        mime_type: "video/VP8".into(),
        clock_rate: 90000,
        ..Default::default()
    }
}

#[test]
fn score_rises_on_clean_delivery() {
    let mut stream = RtpStreamRecv::new(params());
    let start = Instant::now();

    let mut now = start;
    for tick in 0..6u64 {
        for i in 0..50u16 {
            let seq = (tick * 50) as u16 + i;
            stream.receive_packet(&media_packet(seq, u32::from(seq) * 3000), 200, now);
            now += Duration::from_millis(20);
        }
        stream.update_score(now);
    }

    let score = stream.stream.score();
    assert!(score >= 7, "clean stream should be healthy, got {score}");
    assert!(stream.is_healthy());
}

#[test]
fn score_drops_to_zero_when_stream_dies() {
    let mut stream = RtpStreamRecv::new(params());
    let start = Instant::now();

    for i in 0..50u16 {
        stream.receive_packet(&media_packet(i, u32::from(i) * 3000), 200, start);
    }
    stream.update_score(start + Duration::from_millis(2500));

    // No packets for two ticks.
    let score = stream.update_score(start + Duration::from_secs(10));
    assert_eq!(score, Some(0));
}

#[test]
fn fraction_lost_counts_window_gaps() {
    let mut stream = RtpStreamRecv::new(params());
    let now = Instant::now();

    // Receive 0..=9, skip 10..=19, receive 20..=29: a third of the window lost.
    for i in 0..10u16 {
        stream.receive_packet(&media_packet(i, 0), 100, now);
    }
    for i in 20..30u16 {
        stream.receive_packet(&media_packet(i, 0), 100, now);
    }

    let fraction_lost = stream.fraction_lost();
    assert!(
        (80..=90).contains(&fraction_lost),
        "expected ~1/3 loss, got {fraction_lost}"
    );
}

#[test]
fn duplicate_and_reordered_packets_accepted() {
    let mut stream = RtpStreamRecv::new(params());
    let now = Instant::now();

    assert!(stream.receive_packet(&media_packet(100, 0), 100, now));
    assert!(stream.receive_packet(&media_packet(102, 0), 100, now));
    assert!(stream.receive_packet(&media_packet(101, 0), 100, now));
    assert_eq!(stream.stream.packets_count, 3);
}
