use crate::event::Event;
use crate::media::codec;
use crate::media::rtp::{build_packet, parse_packet, RtpHeader};
use crate::media::session::{RtpSession, PT_PCMA, PT_PCMU, SAMPLES_PER_PACKET};
use crate::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;

async fn recv_rtp(peer: &UdpSocket) -> (RtpHeader, Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
        .await
        .expect("timed out waiting for RTP")
        .expect("recv_from");
    let (header, payload) = parse_packet(&buf[..len]).expect("parse RTP");
    (header, payload.to_vec(), from)
}

#[tokio::test]
async fn muted_session_sends_silence_with_monotonic_seq_ts() -> Result<()> {
    let (events, _rx) = unbounded_channel();
    let session = RtpSession::bind(events).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    session.start(peer.local_addr()?, PT_PCMU);
    session.set_muted(true);

    let (first, payload, _) = recv_rtp(&peer).await;
    assert_eq!(payload.len(), SAMPLES_PER_PACKET);
    assert!(payload.iter().all(|&b| b == codec::MULAW_SILENCE));
    assert_eq!(first.payload_type, PT_PCMU);
    assert_eq!(first.ssrc, session.ssrc());
    assert!(!first.marker);

    let mut previous = first;
    for _ in 0..3 {
        let (header, payload, _) = recv_rtp(&peer).await;
        assert_eq!(header.sequence, previous.sequence.wrapping_add(1));
        assert_eq!(
            header.timestamp,
            previous.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32)
        );
        assert_eq!(header.ssrc, session.ssrc());
        assert!(payload.iter().all(|&b| b == codec::MULAW_SILENCE));
        previous = header;
    }

    session.close();
    Ok(())
}

#[tokio::test]
async fn pcma_silence_byte() -> Result<()> {
    let (events, _rx) = unbounded_channel();
    let session = RtpSession::bind(events).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    session.start(peer.local_addr()?, PT_PCMA);

    let (header, payload, _) = recv_rtp(&peer).await;
    assert_eq!(header.payload_type, PT_PCMA);
    assert!(payload.iter().all(|&b| b == codec::ALAW_SILENCE));

    session.close();
    Ok(())
}

#[tokio::test]
async fn mic_block_is_encoded_then_padding_resumes() -> Result<()> {
    let (events, _rx) = unbounded_channel();
    let session = RtpSession::bind(events).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;

    let pcm: Vec<u8> = std::iter::repeat([0xE8u8, 0x03]) // 1000 LE
        .take(SAMPLES_PER_PACKET)
        .flatten()
        .collect();
    let expected = codec::encode_mulaw(&pcm);

    session.start(peer.local_addr()?, PT_PCMU);
    session.feed_mic(&pcm);

    // the fed block comes out exactly once, silence before and after
    let mut saw_block = false;
    for _ in 0..6 {
        let (_, payload, _) = recv_rtp(&peer).await;
        if payload == expected {
            assert!(!saw_block, "block sent twice");
            saw_block = true;
        } else {
            assert!(payload.iter().all(|&b| b == codec::MULAW_SILENCE));
        }
    }
    assert!(saw_block, "fed block never sent");

    session.close();
    Ok(())
}

#[tokio::test]
async fn symmetric_rtp_learns_real_source() -> Result<()> {
    let (events, mut events_rx) = unbounded_channel();
    let session = RtpSession::bind(events).await?;

    // the SDP advertised one port, but media really comes from another
    let advertised = UdpSocket::bind("127.0.0.1:0").await?;
    let actual = UdpSocket::bind("127.0.0.1:0").await?;
    session.start(advertised.local_addr()?, PT_PCMU);

    let header = RtpHeader {
        payload_type: PT_PCMU,
        sequence: 900,
        timestamp: 16000,
        ssrc: 0x5151_5151,
        marker: false,
    };
    let packet = build_packet(&header, &[codec::MULAW_SILENCE; 160]);
    let session_addr: SocketAddr = format!("127.0.0.1:{}", session.local_port()).parse()?;
    actual.send_to(&packet, session_addr).await?;

    // outbound re-targets to the observed source
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "never re-targeted");
        let mut buf = vec![0u8; 2048];
        if let Ok(Ok(_)) =
            timeout(Duration::from_millis(100), actual.recv_from(&mut buf)).await
        {
            break;
        }
    }
    assert_eq!(session.remote(), Some(actual.local_addr()?));

    // the inbound payload was decoded and published
    let mut saw_audio = false;
    while let Ok(event) = events_rx.try_recv() {
        if let Event::RemoteAudio(pcm) = event {
            assert_eq!(pcm.len(), 320);
            assert!(pcm.iter().all(|&b| b == 0));
            saw_audio = true;
        }
    }
    assert!(saw_audio, "decoded audio never published");

    session.close();
    Ok(())
}

#[tokio::test]
async fn foreign_payload_types_are_dropped() -> Result<()> {
    let (events, mut events_rx) = unbounded_channel();
    let session = RtpSession::bind(events).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    session.start(peer.local_addr()?, PT_PCMU);

    let header = RtpHeader {
        payload_type: 96,
        sequence: 1,
        timestamp: 0,
        ssrc: 1,
        marker: false,
    };
    let session_addr: SocketAddr = format!("127.0.0.1:{}", session.local_port()).parse()?;
    peer.send_to(&build_packet(&header, &[0u8; 160]), session_addr)
        .await?;
    // runt datagram, dropped before parsing
    peer.send_to(&[0x80, 0x00, 0x01], session_addr).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events_rx.try_recv() {
        assert!(
            !matches!(event, Event::RemoteAudio(_)),
            "foreign payload type was decoded"
        );
    }

    session.close();
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_stops_emission() -> Result<()> {
    let (events, mut events_rx) = unbounded_channel();
    let session = RtpSession::bind(events).await?;
    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    session.start(peer.local_addr()?, PT_PCMU);

    let _ = recv_rtp(&peer).await;
    session.close();
    session.close();

    // drain anything in flight, then confirm the pacer is gone
    tokio::time::sleep(Duration::from_millis(60)).await;
    let mut buf = vec![0u8; 2048];
    while let Ok(Ok(_)) = timeout(Duration::from_millis(10), peer.recv_from(&mut buf)).await {}
    assert!(
        timeout(Duration::from_millis(100), peer.recv_from(&mut buf))
            .await
            .is_err(),
        "packets still flowing after close"
    );

    while events_rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events_rx.try_recv().is_err(), "events after close");
    Ok(())
}
