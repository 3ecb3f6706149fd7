//! Client-side multiplexing: a session driven with scripted doubles, and a
//! real client tunnelling through a real server on loopback.

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use rstest::{fixture, rstest};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use usocks::{
    ConnId, Control, Packet, PresharedKey, TunnelClient, TunnelServer,
    backend::PlainTcpBackend,
    client::{ClientSession, Endpoint},
    config::{ClientConfig, PluginConfig},
    frontend,
    record::RecordErrorKind,
};
use usocks_testing::{EchoServer, FrontendProbe, MockFrontend, RecordProbe, mock_record_layer};

const KEY: &str = "client test key";
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    session: ClientSession,
    record: RecordProbe,
}

impl Harness {
    fn open(&mut self) -> (ConnId, FrontendProbe) {
        let (local, probe) = MockFrontend::new();
        let id = self.session.attach(Box::new(local)).expect("free id");
        (id, probe)
    }
}

#[fixture]
fn harness() -> Harness {
    let (layer, record) = mock_record_layer("server");
    Harness {
        session: ClientSession::new(Box::new(layer)),
        record,
    }
}

fn data(control: Control, id: ConnId, payload: &'static [u8]) -> Packet {
    Packet::new(control, id, Bytes::from_static(payload))
}

#[rstest]
fn first_data_opens_the_connection(mut harness: Harness) {
    let (id, local) = harness.open();
    local.push_data(b"hello");
    harness.session.on_local_readable(id);
    local.push_data(b"again");
    harness.session.on_local_readable(id);

    assert_eq!(
        harness.record.sent(),
        [
            data(Control::SYN | Control::DAT, id, b"hello"),
            data(Control::DAT, id, b"again"),
        ]
    );
}

#[rstest]
fn eof_sends_fin_and_frees_the_id(mut harness: Harness) {
    let (id, local) = harness.open();
    local.push_data(b"x");
    harness.session.on_local_readable(id);
    local.push_eof();
    harness.session.on_local_readable(id);

    assert_eq!(harness.record.sent().last(), Some(&Packet::control(Control::FIN, id)));
    assert!(local.is_closed());
    assert_eq!(harness.session.local_count(), 0);
    assert_eq!(harness.open().0, id);
}

#[rstest]
fn eof_before_any_data_sends_nothing(mut harness: Harness) {
    let (id, local) = harness.open();
    local.push_eof();
    harness.session.on_local_readable(id);

    assert!(harness.record.sent().is_empty());
    assert!(local.is_closed());
}

#[rstest]
fn server_data_and_fin_reach_the_local_connection(mut harness: Harness) {
    let (id, local) = harness.open();
    local.push_data(b"GET");
    harness.session.on_local_readable(id);

    harness.record.push_packets([data(Control::DAT, id, b"reply"), Packet::control(Control::FIN, id)]);
    harness.session.on_record_readable();

    assert_eq!(local.received(), b"reply");
    assert!(local.is_closed());
    assert!(!local.is_reset());
    assert_eq!(harness.session.local_count(), 0);
}

#[rstest]
fn server_reset_resets_the_local_connection(mut harness: Harness) {
    let (id, local) = harness.open();
    local.push_data(b"GET");
    harness.session.on_local_readable(id);

    harness.record.push_packets([Packet::control(Control::RST, id)]);
    harness.session.on_record_readable();

    assert!(local.is_reset());
    assert_eq!(harness.session.local_count(), 0);
}

#[rstest]
fn packets_for_unknown_ids_are_dropped(mut harness: Harness) {
    let (_, local) = harness.open();
    harness
        .record
        .push_packets([data(Control::DAT, ConnId::new(900), b"stray")]);
    harness.session.on_record_readable();

    assert!(local.received().is_empty());
    assert!(!harness.session.is_finished());
}

#[rstest]
fn local_failure_after_opening_sends_rst(mut harness: Harness) {
    let (id, local) = harness.open();
    local.push_data(b"x");
    harness.session.on_local_readable(id);
    local.push_error(std::io::ErrorKind::ConnectionReset);
    harness.session.on_local_readable(id);

    assert_eq!(harness.record.sent().last(), Some(&Packet::control(Control::RST, id)));
    assert!(local.is_reset());
}

#[rstest]
fn slow_local_connection_is_flushed_when_writable(mut harness: Harness) {
    let (id, local) = harness.open();
    local.set_partial(true);
    harness.record.push_packets([data(Control::DAT, id, b"bulk")]);
    harness.session.on_record_readable();
    assert!(harness.session.is_pending(Endpoint::Local(id)));

    local.set_partial(false);
    harness.session.on_writable(Endpoint::Local(id));
    assert!(!harness.session.is_pending(Endpoint::Local(id)));
    assert_eq!(local.flushes(), 1);
}

#[rstest]
fn server_close_finishes_the_session(mut harness: Harness) {
    let (_, first) = harness.open();
    let (_, second) = harness.open();
    harness.record.push_eof();
    harness.session.on_record_readable();

    assert!(harness.session.is_finished());
    assert!(first.is_closed() && second.is_closed());
    assert!(harness.record.transport_closed());
}

#[rstest]
fn record_failure_resets_every_local_connection(mut harness: Harness) {
    let (_, local) = harness.open();
    harness.record.push_error(RecordErrorKind::HashFailure);
    harness.session.on_record_readable();

    assert!(harness.session.is_finished());
    assert!(local.is_reset());
}

#[rstest]
fn shutdown_notifies_the_server(mut harness: Harness) {
    let (_, local) = harness.open();
    harness.session.shutdown();

    assert!(harness.record.close_notified());
    assert!(harness.record.transport_closed());
    assert!(local.is_closed());
}

async fn start_server(target: SocketAddr) -> (SocketAddr, tokio_util::sync::CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let mut options = toml::Table::new();
    options.insert("server".into(), target.ip().to_string().into());
    options.insert("port".into(), i64::from(target.port()).into());
    let server = TunnelServer::new(
        Box::new(PlainTcpBackend::from_listener(listener)),
        PresharedKey::from(KEY),
        frontend::build_factory("redirect", &options).expect("redirect factory"),
    );
    let addr = server.local_addr().expect("local address");
    let token = server.shutdown_token();
    tokio::spawn(server.run_with_shutdown(futures::future::pending()));
    (addr, token)
}

fn client_config(server: SocketAddr) -> ClientConfig {
    let mut options = toml::Table::new();
    options.insert("server".into(), server.ip().to_string().into());
    options.insert("port".into(), i64::from(server.port()).into());
    ClientConfig {
        key: KEY.into(),
        listen: "127.0.0.1:0".parse().expect("addr"),
        backend: PluginConfig {
            kind: "plain_tcp".into(),
            options,
        },
    }
}

#[rstest]
#[tokio::test]
async fn local_connections_are_tunnelled_to_the_target() {
    let echo = EchoServer::start().await.expect("echo server");
    let (server, server_token) = start_server(echo.addr()).await;
    let client = TunnelClient::connect(&client_config(server))
        .await
        .expect("client connect");
    let local = client.local_addr().expect("local address");
    let client_token = client.shutdown_token();
    let handle = tokio::spawn(client.run_with_shutdown(futures::future::pending()));

    for message in [&b"ping"[..], b"second connection"] {
        let mut stream = TcpStream::connect(local).await.expect("connect to client");
        stream.write_all(message).await.expect("write");
        let mut echoed = vec![0; message.len()];
        timeout(WAIT, stream.read_exact(&mut echoed))
            .await
            .expect("timed out waiting for the echo")
            .expect("read");
        assert_eq!(echoed, message);
    }

    client_token.cancel();
    timeout(WAIT, handle)
        .await
        .expect("client did not stop")
        .expect("client task panicked")
        .expect("client failed");
    server_token.cancel();
}

#[rstest]
#[tokio::test]
async fn client_stops_when_the_server_goes_away() {
    let echo = EchoServer::start().await.expect("echo server");
    let (server, server_token) = start_server(echo.addr()).await;
    let client = TunnelClient::connect(&client_config(server))
        .await
        .expect("client connect");
    let handle = tokio::spawn(client.run_with_shutdown(futures::future::pending()));

    server_token.cancel();

    timeout(WAIT, handle)
        .await
        .expect("client did not notice the server closing")
        .expect("client task panicked")
        .expect("client failed");
}

#[rstest]
#[tokio::test]
async fn unreachable_server_fails_setup() {
    let refused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local address")
    };
    let outcome = TunnelClient::connect(&client_config(refused)).await;
    assert!(matches!(outcome, Err(usocks::client::ClientError::Backend(_))));
}
