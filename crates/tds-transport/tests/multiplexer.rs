//! Multiplexer behaviour over an in-memory connection.
//!
//! Every test drives the server side with a scripted [`MockTdsPeer`], so the
//! exact packets on the wire can be asserted.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tds_protocol::{Done, PacketType, TdsVersion};
use tds_testing::{MockServerError, MockTdsPeer, fixtures};
use tds_transport::{Error, Multiplexer, MuxConfig, SpillBudget, SpillConfig};
use tokio::io::DuplexStream;

const VERSION: TdsVersion = TdsVersion::V7_1;

fn setup() -> (Multiplexer<DuplexStream>, MockTdsPeer<DuplexStream>) {
    setup_with(MuxConfig::new().tds_version(VERSION))
}

fn setup_with(config: MuxConfig) -> (Multiplexer<DuplexStream>, MockTdsPeer<DuplexStream>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (client, server) = tokio::io::duplex(256 * 1024);
    let budget = Arc::new(SpillBudget::new(&config.spill));
    let mux = Multiplexer::with_budget(client, config, budget).expect("valid config");
    (mux, MockTdsPeer::new(server))
}

// =============================================================================
// Request framing
// =============================================================================

#[tokio::test]
async fn test_large_request_is_split_into_packets() {
    let (mux, mut peer) = setup();
    let mut request = mux.request_stream().await.unwrap();

    request.write_bytes(&[0xAB; 10_000]).await.unwrap();
    request.flush().await.unwrap();

    let received = peer.read_request().await.unwrap();
    // ceil(10000 / (512 - 8))
    assert_eq!(received.packets.len(), 20);
    for (i, packet) in received.packets.iter().enumerate() {
        assert_eq!(packet.is_last(), i == 19, "packet {i}");
        assert_eq!(packet.header.packet_type, PacketType::Query);
        assert!(packet.header.tds7);
        assert!(packet.header.length as usize <= 512);
        assert_eq!(packet.header.length as usize, packet.payload.len() + 8);
    }
    assert_eq!(received.payload.len(), 10_000);
    assert!(received.payload.iter().all(|&b| b == 0xAB));
    assert_eq!(mux.response_owner(), Some(request.id()));
    assert_eq!(mux.stats().packets_sent, 20);
}

#[tokio::test]
async fn test_primitives_round_trip() {
    let (mux, mut peer) = setup();
    let mut request = mux.request_stream().await.unwrap();

    request.write_u8(0x7F).await.unwrap();
    request.write_i16(-2).await.unwrap();
    request.write_i32(0x0102_0304).await.unwrap();
    request.write_i64(-1).await.unwrap();
    request.write_f64(1.5).await.unwrap();
    request.write_str("hé").await.unwrap();
    request.flush().await.unwrap();

    // Echo the request back as the reply.
    let received = peer.read_request().await.unwrap();
    peer.send_reply(&received.payload).await.unwrap();

    let mut response = mux.response_stream(request.id()).unwrap();
    assert_eq!(response.peek().await.unwrap(), 0x7F);
    assert_eq!(response.read_u8().await.unwrap(), 0x7F);
    assert_eq!(response.read_i16().await.unwrap(), -2);
    assert_eq!(response.read_i32().await.unwrap(), 0x0102_0304);
    assert_eq!(response.read_i64().await.unwrap(), -1);
    assert_eq!(response.read_f64().await.unwrap(), 1.5);
    assert_eq!(response.read_string(2).await.unwrap(), "hé");
    assert_eq!(mux.response_owner(), None);
}

#[tokio::test]
async fn test_legacy_strings_use_codepage() {
    let (mux, mut peer) = setup_with(MuxConfig::new().tds_version(TdsVersion::V4_2));
    let mut request = mux.request_stream().await.unwrap();

    request.write_str("café").await.unwrap();
    request.flush().await.unwrap();

    let received = peer.read_request().await.unwrap();
    assert!(!received.packets[0].header.tds7);
    // windows-1252
    assert_eq!(&received.payload[..], &[b'c', b'a', b'f', 0xE9]);

    peer.send_reply(&received.payload).await.unwrap();
    let mut response = mux.response_stream(request.id()).unwrap();
    assert_eq!(response.read_string(4).await.unwrap(), "café");
}

#[tokio::test]
async fn test_reads_cross_packet_boundaries() {
    let (mux, mut peer) = setup();
    let mut request = mux.request_stream().await.unwrap();
    request.write_u8(1).await.unwrap();
    request.flush().await.unwrap();
    peer.read_request().await.unwrap();

    // An i32 split over two packets, then a string split mid-character.
    peer.send_packet(&[0x01, 0x02], false).await.unwrap();
    peer.send_packet(&[0x03, 0x04, b'a'], false).await.unwrap();
    peer.send_packet(&[0x00, b'b', 0x00], true).await.unwrap();

    let mut response = mux.response_stream(request.id()).unwrap();
    assert_eq!(response.read_i32().await.unwrap(), 0x0403_0201);
    assert_eq!(response.read_unicode_string(2).await.unwrap(), "ab");
}

#[tokio::test]
async fn test_buffer_size_changes() {
    let (mux, mut peer) = setup();
    let mut request = mux.request_stream().await.unwrap();

    assert!(matches!(request.set_buffer_size(100), Err(Error::Config(_))));
    request.set_buffer_size(4096).unwrap();
    assert_eq!(request.buffer_size(), 4096);

    request.write_bytes(&[1; 3000]).await.unwrap();
    // Smaller than the buffered data: ignored.
    request.set_buffer_size(1024).unwrap();
    assert_eq!(request.buffer_size(), 4096);
    request.flush().await.unwrap();

    let received = peer.read_request().await.unwrap();
    assert_eq!(received.packets.len(), 1);
    assert_eq!(received.payload.len(), 3000);
}

#[tokio::test]
async fn test_write_from_reader_checks_length() {
    let (mux, mut peer) = setup();
    let mut request = mux.request_stream().await.unwrap();

    let mut short: &[u8] = &[1, 2, 3];
    assert!(matches!(
        request.write_from_reader(&mut short, 4).await,
        Err(Error::Encoding(_))
    ));

    let mut long: &[u8] = &[1, 2, 3];
    assert!(matches!(
        request.write_from_reader(&mut long, 2).await,
        Err(Error::Encoding(_))
    ));

    let mut exact: &[u8] = &[9; 700];
    request.write_from_reader(&mut exact, 700).await.unwrap();
    request.flush().await.unwrap();

    let received = peer.read_request().await.unwrap();
    // 3 + 2 bytes from the failed copies, then the full 700.
    assert_eq!(received.payload.len(), 705);
    assert!(received.payload[5..].iter().all(|&b| b == 9));
}

#[tokio::test]
async fn test_closed_request_stream_rejects_writes() {
    let (mux, _peer) = setup();
    let mut request = mux.request_stream().await.unwrap();
    request.close();
    assert!(request.is_closed());
    assert!(matches!(
        request.flush().await,
        Err(Error::StreamClosed(id)) if id == request.id()
    ));
}

// =============================================================================
// Ownership and queueing
// =============================================================================

#[tokio::test]
async fn test_second_stream_waits_for_incomplete_request() {
    let (mux, mut peer) = setup();
    let mut a = mux.request_stream().await.unwrap();
    let mut b = mux.request_stream().await.unwrap();

    // A fills one packet and is now mid-request.
    a.write_bytes(&[0xAA; 600]).await.unwrap();
    // B's whole request must be held back.
    b.write_bytes(b"bbbb").await.unwrap();
    b.flush().await.unwrap();
    assert_eq!(mux.stats().packets_sent, 1);

    let first = peer.read_packet().await.unwrap();
    assert!(!first.is_last());
    assert_eq!(first.payload.len(), 504);

    a.flush().await.unwrap();
    let second = peer.read_packet().await.unwrap();
    assert!(second.is_last());
    assert_eq!(second.payload.len(), 96);
    assert!(second.payload.iter().all(|&b| b == 0xAA));
    assert_eq!(mux.response_owner(), Some(a.id()));

    peer.send_reply(&fixtures::reply_with_done(b"for-a", VERSION))
        .await
        .unwrap();

    // B reading caches A's reply, sends B's request and reads B's reply.
    let mut b_response = mux.response_stream(b.id()).unwrap();
    let (b_body, served) = tokio::join!(
        async {
            let mut buf = [0u8; 5];
            b_response.read_bytes(&mut buf).await.map(|()| buf)
        },
        async {
            let request = peer.read_request().await?;
            peer.send_reply(&fixtures::reply_with_done(b"for-b", VERSION))
                .await?;
            Ok::<_, MockServerError>(request)
        }
    );
    assert_eq!(&b_body.unwrap(), b"for-b");
    assert_eq!(&served.unwrap().payload[..], b"bbbb");

    let mut a_response = mux.response_stream(a.id()).unwrap();
    let mut body = [0u8; 5];
    a_response.read_bytes(&mut body).await.unwrap();
    assert_eq!(&body, b"for-a");
    let mut raw = [0u8; 9];
    a_response.read_bytes(&mut raw).await.unwrap();
    let done = Done::decode(&mut &raw[..], VERSION).unwrap();
    assert!(!done.is_cancel_ack());
    assert!(!done.has_more_results());
}

#[tokio::test]
async fn test_reader_waits_for_current_sender() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    let mut y = mux.request_stream().await.unwrap();

    x.write_bytes(&[0x11; 600]).await.unwrap();
    y.write_bytes(b"yy").await.unwrap();
    y.flush().await.unwrap();

    let mut y_response = mux.response_stream(y.id()).unwrap();
    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 3];
        y_response.read_bytes(&mut buf).await.map(|()| buf)
    });
    tokio::task::yield_now().await;

    x.flush().await.unwrap();
    let x_request = peer.read_request().await.unwrap();
    assert_eq!(x_request.payload.len(), 600);
    peer.send_reply(&fixtures::reply_with_done(b"xxx", VERSION))
        .await
        .unwrap();

    let y_request = peer.read_request().await.unwrap();
    assert_eq!(&y_request.payload[..], b"yy");
    peer.send_reply(&fixtures::reply_with_done(b"yyy", VERSION))
        .await
        .unwrap();

    assert_eq!(&reader.await.unwrap().unwrap(), b"yyy");

    let mut x_response = mux.response_stream(x.id()).unwrap();
    let mut buf = [0u8; 3];
    x_response.read_bytes(&mut buf).await.unwrap();
    assert_eq!(&buf, b"xxx");
}

#[tokio::test]
async fn test_dropping_current_sender_wakes_waiting_reader() {
    let (mux, mut peer) = setup();
    let mut a = mux.request_stream().await.unwrap();
    let mut b = mux.request_stream().await.unwrap();
    let a_id = a.id();

    a.write_bytes(&[0xAA; 600]).await.unwrap();
    b.write_bytes(b"bbbb").await.unwrap();
    b.flush().await.unwrap();

    let mut b_response = mux.response_stream(b.id()).unwrap();
    let reader = tokio::spawn(async move { b_response.read_u8().await });
    tokio::task::yield_now().await;

    // A goes away mid-request; B's reader must terminate A's request itself.
    drop(a);

    let a_request = peer.read_request().await.unwrap();
    assert_eq!(a_request.packets.len(), 2);
    assert_eq!(a_request.payload.len(), 504);
    assert!(a_request.packets[1].payload.is_empty());
    peer.send_reply(&fixtures::reply_with_done(b"lost", VERSION))
        .await
        .unwrap();

    let b_request = peer.read_request().await.unwrap();
    assert_eq!(&b_request.payload[..], b"bbbb");
    peer.send_reply(&[0x42]).await.unwrap();

    let byte = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("reader woke up")
        .unwrap()
        .unwrap();
    assert_eq!(byte, 0x42);
    assert!(mux.controller(a_id).is_none());
}

#[tokio::test]
async fn test_abandoned_reply_is_drained_before_next_request() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();

    x.write_str("first").await.unwrap();
    x.flush().await.unwrap();
    let first = peer.read_request().await.unwrap();
    assert_eq!(first.payload.len(), 10);

    peer.send_packet(&[1; 100], false).await.unwrap();
    peer.send_packet(&[2; 100], false).await.unwrap();
    peer.send_packet(&fixtures::done_final(VERSION), true)
        .await
        .unwrap();

    // New request without reading the old reply.
    x.write_str("second").await.unwrap();
    x.flush().await.unwrap();
    assert_eq!(mux.stats().packets_sent, 1);

    let mut response = mux.response_stream(x.id()).unwrap();
    let (body, served) = tokio::join!(
        async {
            let mut buf = [0u8; 4];
            response.read_bytes(&mut buf).await.map(|()| buf)
        },
        async {
            let request = peer.read_request().await?;
            peer.send_reply(&fixtures::reply_with_done(b"done", VERSION))
                .await?;
            Ok::<_, MockServerError>(request)
        }
    );
    assert_eq!(&body.unwrap(), b"done");
    assert_eq!(served.unwrap().payload.len(), 12);

    let stats = mux.stats();
    assert_eq!(stats.packets_sent, 2);
    assert_eq!(stats.packets_received, 4);
}

#[tokio::test]
async fn test_reply_spills_to_disk_while_another_stream_reads() {
    let dir = tempfile::tempdir().unwrap();
    let config = MuxConfig::new().tds_version(VERSION).spill(
        SpillConfig::new()
            .memory_budget(0)
            .min_memory_packets(1)
            .buffer_dir(dir.path()),
    );
    let (mux, mut peer) = setup_with(config);
    let mut a = mux.request_stream().await.unwrap();
    let mut b = mux.request_stream().await.unwrap();

    a.write_u8(b'a').await.unwrap();
    a.flush().await.unwrap();
    peer.read_request().await.unwrap();
    for seq in 0..4u8 {
        peer.send_packet(&[seq; 100], false).await.unwrap();
    }
    peer.send_packet(&fixtures::done_final(VERSION), true)
        .await
        .unwrap();

    b.write_u8(b'b').await.unwrap();
    b.flush().await.unwrap();

    let mut b_response = mux.response_stream(b.id()).unwrap();
    let (byte, served) = tokio::join!(b_response.read_u8(), async {
        let request = peer.read_request().await?;
        peer.send_reply(&fixtures::reply_with_done(b"B", VERSION))
            .await?;
        Ok::<_, MockServerError>(request)
    });
    assert_eq!(byte.unwrap(), b'B');
    assert_eq!(&served.unwrap().payload[..], b"b");

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(mux.stats().memory_usage, 0);

    let mut a_response = mux.response_stream(a.id()).unwrap();
    for seq in 0..4u8 {
        let mut chunk = [0u8; 100];
        a_response.read_bytes(&mut chunk).await.unwrap();
        assert!(chunk.iter().all(|&b| b == seq), "chunk {seq}");
    }
    let mut raw = [0u8; 9];
    a_response.read_bytes(&mut raw).await.unwrap();
    assert!(Done::decode(&mut &raw[..], VERSION).is_ok());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// =============================================================================
// Sequencing errors
// =============================================================================

#[tokio::test]
async fn test_read_without_request() {
    let (mux, _peer) = setup();
    let request = mux.request_stream().await.unwrap();
    let mut response = mux.response_stream(request.id()).unwrap();

    let err = response.read_u8().await.unwrap_err();
    assert!(matches!(err, Error::NoRequest { stream } if stream == request.id()));
    assert!(!err.is_fatal());
    assert!(mux.is_connected());
}

#[tokio::test]
async fn test_read_with_incomplete_request() {
    let (mux, _peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    let mut y = mux.request_stream().await.unwrap();

    x.write_bytes(&[0; 600]).await.unwrap();
    y.write_bytes(&[0; 600]).await.unwrap();

    let mut response = mux.response_stream(y.id()).unwrap();
    assert!(matches!(
        response.read_u8().await,
        Err(Error::RequestIncomplete(id)) if id == y.id()
    ));
}

// =============================================================================
// Stream release
// =============================================================================

#[tokio::test]
async fn test_dropped_stream_is_released() {
    let (mux, _peer) = setup();
    let x = mux.request_stream().await.unwrap();
    let id = x.id();
    assert_eq!(mux.stats().open_streams, 1);

    drop(x);
    let _y = mux.request_stream().await.unwrap();
    assert_eq!(mux.stats().open_streams, 1);
    assert!(mux.controller(id).is_none());
    assert!(matches!(
        mux.response_stream(id),
        Err(Error::UnknownStream(unknown)) if unknown == id
    ));
}

#[tokio::test]
async fn test_response_close_releases_stream() {
    let (mux, _peer) = setup();
    let request = mux.request_stream().await.unwrap();
    let mut response = mux.response_stream(request.id()).unwrap();

    response.close().await.unwrap();
    assert!(request.is_closed());
    assert_eq!(mux.stats().open_streams, 0);
    assert!(matches!(
        response.read_u8().await,
        Err(Error::StreamClosed(_))
    ));
}

#[tokio::test]
async fn test_closing_mid_request_terminates_it() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    let mut y = mux.request_stream().await.unwrap();

    x.write_bytes(&[0x11; 600]).await.unwrap();
    mux.close_stream(x.id()).await.unwrap();

    let first = peer.read_packet().await.unwrap();
    assert!(!first.is_last());
    let terminator = peer.read_packet().await.unwrap();
    assert!(terminator.is_last());
    assert!(terminator.payload.is_empty());
    assert_eq!(terminator.header.packet_type, PacketType::Query);
    assert!(matches!(x.flush().await, Err(Error::UnknownStream(_))));

    peer.send_reply(&fixtures::reply_with_done(b"orphan", VERSION))
        .await
        .unwrap();

    y.write_u8(7).await.unwrap();
    y.flush().await.unwrap();
    let mut response = mux.response_stream(y.id()).unwrap();
    let (byte, served) = tokio::join!(response.read_u8(), async {
        let request = peer.read_request().await?;
        peer.send_reply(&fixtures::reply_with_done(&[42], VERSION))
            .await?;
        Ok::<_, MockServerError>(request)
    });
    assert_eq!(byte.unwrap(), 42);
    assert_eq!(&served.unwrap().payload[..], &[7]);
    assert_eq!(mux.stats().open_streams, 1);
}

// =============================================================================
// Transport failures
// =============================================================================

#[tokio::test]
async fn test_force_close_fails_blocked_reader() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    x.write_u8(1).await.unwrap();
    x.flush().await.unwrap();
    peer.read_request().await.unwrap();

    let mut response = mux.response_stream(x.id()).unwrap();
    let reader = tokio::spawn(async move { response.read_u8().await });
    tokio::task::yield_now().await;

    mux.force_close();
    let err = reader.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert!(err.is_connection_lost());
    assert!(!mux.is_connected());
    assert!(matches!(
        mux.request_stream().await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_server_disconnect_is_fatal() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    x.write_u8(1).await.unwrap();
    x.flush().await.unwrap();
    peer.read_request().await.unwrap();
    peer.shutdown().await.unwrap();
    drop(peer);

    let mut response = mux.response_stream(x.id()).unwrap();
    let err = response.read_u8().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(!mux.is_connected());
}

#[tokio::test]
async fn test_invalid_packet_type_is_protocol_error() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    x.write_u8(1).await.unwrap();
    x.flush().await.unwrap();
    peer.read_request().await.unwrap();

    // RPC packets never come from a server.
    peer.send_raw(&[0x03, 0x01, 0x00, 0x09, 0, 0, 1, 0, 0xFD])
        .await
        .unwrap();

    let mut response = mux.response_stream(x.id()).unwrap();
    let err = response.read_u8().await.unwrap_err();
    assert!(err.is_protocol_error());
    assert!(!mux.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_socket_timeout_is_fatal() {
    let (mux, mut peer) = setup_with(
        MuxConfig::new()
            .tds_version(VERSION)
            .socket_timeout(Duration::from_secs(1)),
    );
    let mut x = mux.request_stream().await.unwrap();
    x.write_u8(1).await.unwrap();
    x.flush().await.unwrap();
    peer.read_request().await.unwrap();

    let mut response = mux.response_stream(x.id()).unwrap();
    let err = response.read_u8().await.unwrap_err();
    assert!(matches!(&err, Error::Io(_)));
    assert!(err.is_timeout());
    assert!(err.is_fatal());
    assert!(!mux.is_connected());
}

#[tokio::test]
async fn test_unterminated_ntlm_challenge_ends_reply() {
    let (mux, mut peer) = setup();
    let mut x = mux.request_stream().await.unwrap();
    x.write_u8(1).await.unwrap();
    x.flush().await.unwrap();
    peer.read_request().await.unwrap();

    // SSPI token header followed by the NTLM signature, last flag missing.
    let mut challenge = vec![0xED, 0x20, 0x00];
    challenge.extend_from_slice(b"NTLMSSP\0");
    peer.send_packet(&challenge, false).await.unwrap();

    let mut response = mux.response_stream(x.id()).unwrap();
    let mut raw = vec![0u8; challenge.len()];
    response.read_bytes(&mut raw).await.unwrap();
    assert_eq!(raw, challenge);
    assert_eq!(mux.response_owner(), None);
}

#[tokio::test]
async fn test_close_shuts_down_write_half() {
    let (mux, mut peer) = setup();
    let _x = mux.request_stream().await.unwrap();

    mux.close().await;
    assert!(!mux.is_connected());
    assert_eq!(mux.stats().open_streams, 0);
    assert!(peer.read_packet().await.is_err());
}
