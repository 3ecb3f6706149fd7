//! Record layer framing over an in-memory transport.

use bytes::Bytes;
use rstest::rstest;
use usocks::{
    ConnId, Control, Packet, PresharedKey, RecordConnection, RecordLayer,
    backend::BackendStream,
    nonblocking::Received,
    record::{MAX_RECORD_DATA, RecordError, RecordErrorKind, SALT_LEN},
};
use usocks_testing::{PipeEnd, PipeTap, pipe};

const LENGTH_LEN: usize = 2;

struct Link {
    client: RecordConnection,
    server: RecordConnection,
    /// Bytes in flight towards the server.
    to_server: PipeTap,
    /// Bytes in flight towards the client.
    to_client: PipeTap,
}

/// Connect two record layers and exchange salts.
fn link_with(client_key: &str, server_key: &str, limit: Option<usize>) -> Link {
    let (a, b) = pipe();
    let a: PipeEnd = match limit {
        Some(limit) => a.with_write_limit(limit),
        None => a,
    };
    let to_server = b.tap();
    let to_client = a.tap();
    let mut link = Link {
        client: RecordConnection::new(client_key.into(), Box::new(a)).expect("client record layer"),
        server: RecordConnection::new(PresharedKey::from(server_key), Box::new(b))
            .expect("server record layer"),
        to_server,
        to_client,
    };
    while !(link.client.is_established() && link.server.is_established()) {
        link.client.continue_sending().expect("flush client salt");
        assert!(receive_all(&mut link.server).is_empty());
        assert!(receive_all(&mut link.client).is_empty());
    }
    link
}

fn link() -> Link { link_with("correct horse", "correct horse", None) }

fn receive_all(layer: &mut RecordConnection) -> Vec<Vec<u8>> {
    layer
        .receive_packets()
        .expect("receive failed")
        .expect("unexpected end of stream")
        .into_iter()
        .map(|packet| packet.to_vec())
        .collect()
}

fn error_kind(result: Result<Option<Vec<bytes::Bytes>>, RecordError>) -> RecordErrorKind {
    match result {
        Err(err) => err.kind(),
        Ok(other) => panic!("expected an error, got {other:?}"),
    }
}

#[rstest]
fn packets_cross_in_both_directions() {
    let mut link = link();

    assert!(link.client.send_packet(b"hello").expect("send"));
    assert!(link.client.send_packet(b"").expect("send"));
    assert_eq!(receive_all(&mut link.server), vec![b"hello".to_vec(), Vec::new()]);

    assert!(link.server.send_packet(b"world").expect("send"));
    assert_eq!(receive_all(&mut link.client), vec![b"world".to_vec()]);
}

#[rstest]
fn nothing_pending_yields_an_empty_batch() {
    let mut link = link();
    assert!(receive_all(&mut link.server).is_empty());
}

#[rstest]
#[case::one_record(MAX_RECORD_DATA)]
#[case::two_records(MAX_RECORD_DATA + 1)]
#[case::several_records(3 * MAX_RECORD_DATA + 17)]
fn large_packets_are_reassembled(#[case] len: usize) {
    let mut link = link();
    let payload: Vec<u8> = (0..len)
        .map(|i| u8::try_from(i % 251).expect("fits in a byte"))
        .collect();

    assert!(link.client.send_packet(&payload).expect("send"));

    assert_eq!(receive_all(&mut link.server), vec![payload]);
}

#[rstest]
fn records_split_across_reads_are_reassembled() {
    let mut link = link_with("k", "k", Some(7));
    let mut done = link.client.send_packet(b"fragmented delivery").expect("send");
    let mut received = receive_all(&mut link.server);
    while !done {
        done = link.client.continue_sending().expect("continue");
        received.extend(receive_all(&mut link.server));
    }
    assert_eq!(received, vec![b"fragmented delivery".to_vec()]);
}

#[rstest]
fn tampered_record_fails_authentication_and_resets_peer() {
    let mut link = link();
    link.client.send_packet(b"secret").expect("send");
    assert!(link.to_server.flip(LENGTH_LEN + 1));

    assert_eq!(error_kind(link.server.receive_packets()), RecordErrorKind::HashFailure);
    assert_eq!(error_kind(link.client.receive_packets()), RecordErrorKind::RemoteReset);
}

#[rstest]
fn short_length_prefix_is_an_invalid_header() {
    let mut link = link();
    link.client.send_packet(b"secret").expect("send");
    assert!(link.to_server.set(0, 0));
    assert!(link.to_server.set(1, 1));

    assert_eq!(error_kind(link.server.receive_packets()), RecordErrorKind::InvalidHeader);
    assert_eq!(error_kind(link.client.receive_packets()), RecordErrorKind::RemoteReset);
}

#[rstest]
fn packets_sent_before_the_peer_salt_are_held() {
    let (a, b) = pipe();
    let to_server = b.tap();
    let mut client = RecordConnection::new("k".into(), Box::new(a)).expect("client record layer");
    let mut server = RecordConnection::new("k".into(), Box::new(b)).expect("server record layer");

    assert!(!client.send_packet(b"early").expect("send"));
    assert!(!client.continue_sending().expect("continue"));
    assert_eq!(to_server.len(), SALT_LEN);

    assert!(receive_all(&mut client).is_empty());
    assert!(client.is_established());
    assert!(client.continue_sending().expect("continue"));
    assert_eq!(receive_all(&mut server), vec![b"early".to_vec()]);
}

#[rstest]
fn reflected_salt_is_rejected() {
    let (mut far, near) = pipe();
    let mut server = RecordConnection::new("k".into(), Box::new(near)).expect("record layer");

    let Received::Data(salt) = far.recv().expect("read salt") else {
        panic!("salt was not sent");
    };
    assert_eq!(salt.len(), SALT_LEN);
    far.send(&salt, true).expect("reflect salt");

    assert_eq!(error_kind(server.receive_packets()), RecordErrorKind::HashFailure);
    assert!(!server.is_established());
}

#[rstest]
fn reflected_records_fail_authentication() {
    let mut link = link();
    let packet = Packet::new(
        Control::SYN | Control::DAT,
        ConnId::new(1),
        Bytes::from_static(b"server-bytes"),
    );
    assert!(link.server.send_packet(&packet.encode()).expect("send"));

    let reflected = link.to_client.take();
    assert!(!reflected.is_empty());
    link.to_server.inject(&reflected);

    assert_eq!(error_kind(link.server.receive_packets()), RecordErrorKind::HashFailure);
}

#[rstest]
fn mismatched_keys_fail_authentication() {
    let mut link = link_with("one key", "another key", None);
    link.client.send_packet(b"hello").expect("send");

    assert_eq!(error_kind(link.server.receive_packets()), RecordErrorKind::HashFailure);
}

#[rstest]
fn close_record_then_eof_is_a_clean_end() {
    let mut link = link();
    link.client.send_packet(b"last words").expect("send");
    link.client.close().expect("close");
    link.client.close_transport();
    assert!(link.to_server.writer_closed());

    assert_eq!(receive_all(&mut link.server), vec![b"last words".to_vec()]);
    assert!(link.server.receive_packets().expect("receive").is_none());
}

#[rstest]
fn eof_without_close_record_is_insecure() {
    let mut link = link();
    link.client.send_packet(b"cut short").expect("send");
    link.client.close_transport();

    assert_eq!(receive_all(&mut link.server), vec![b"cut short".to_vec()]);
    assert_eq!(error_kind(link.server.receive_packets()), RecordErrorKind::InsecureClosing);
}

#[rstest]
fn sending_on_a_closed_transport_fails() {
    let mut link = link();
    link.client.close_transport();

    assert_eq!(
        link.client.send_packet(b"too late").map_err(|err| err.kind()).err(),
        Some(RecordErrorKind::Transport)
    );
}
