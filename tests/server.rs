//! End-to-end tests: a real server on loopback driven by a tunnel peer.

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use rstest::rstest;
use serial_test::serial;
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use usocks::{
    ConnId, Control, Packet, PresharedKey, TunnelServer,
    backend::PlainTcpBackend,
    frontend::{self, FrontendFactory},
    server::ServerError,
};
use usocks_testing::{EchoServer, LoggerHandle, MockFactory, TunnelPeer, logger};

const KEY: &str = "loopback test key";
const WAIT: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    async fn start(factory: FrontendFactory) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server = TunnelServer::new(
            Box::new(PlainTcpBackend::from_listener(listener)),
            PresharedKey::from(KEY),
            factory,
        );
        let addr = server.local_addr().expect("local address");
        let token = server.shutdown_token();
        let handle = tokio::spawn(server.run_with_shutdown(futures::future::pending()));
        Self { addr, token, handle }
    }

    async fn peer(&self) -> TunnelPeer {
        TunnelPeer::connect(self.addr, PresharedKey::from(KEY))
            .await
            .expect("peer connect")
    }

    async fn stop(self) {
        self.token.cancel();
        timeout(WAIT, self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed");
    }
}

fn redirect_to(addr: SocketAddr) -> FrontendFactory {
    let mut options = toml::Table::new();
    options.insert("server".into(), addr.ip().to_string().into());
    options.insert("port".into(), i64::from(addr.port()).into());
    frontend::build_factory("redirect", &options).expect("redirect factory")
}

async fn next(peer: &mut TunnelPeer) -> Packet {
    timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for a packet")
        .expect("record layer failed")
        .expect("server closed the record layer")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(WAIT, poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

async fn send(peer: &mut TunnelPeer, control: Control, conn: u16, payload: &'static [u8]) {
    peer.send(&Packet::new(control, ConnId::new(conn), Bytes::from_static(payload)))
        .await
        .expect("send packet");
}

#[rstest]
#[tokio::test]
async fn data_round_trips_through_redirect_frontend() {
    let echo = EchoServer::start().await.expect("echo server");
    let server = Running::start(redirect_to(echo.addr())).await;
    let mut peer = server.peer().await;

    send(&mut peer, Control::SYN | Control::DAT, 1, b"ping").await;

    let mut echoed = Vec::new();
    while echoed.len() < 4 {
        let packet = next(&mut peer).await;
        assert_eq!(packet.control, Control::DAT);
        assert_eq!(packet.conn_id, ConnId::new(1));
        echoed.extend_from_slice(&packet.payload);
    }
    assert_eq!(echoed, b"ping");

    send(&mut peer, Control::FIN, 1, b"").await;
    peer.close().await.expect("close");
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn unreachable_target_is_answered_with_rst() {
    let refused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local address")
    };
    let server = Running::start(redirect_to(refused)).await;
    let mut peer = server.peer().await;

    send(&mut peer, Control::SYN, 3, b"").await;

    assert_eq!(next(&mut peer).await, Packet::control(Control::RST, ConnId::new(3)));
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn frontend_output_and_eof_reach_the_peer() {
    let frontends = MockFactory::new();
    let server = Running::start(frontends.factory()).await;
    let mut peer = server.peer().await;

    send(&mut peer, Control::SYN | Control::DAT, 7, b"hello").await;
    eventually("the frontend is opened", || frontends.created() == 1).await;
    let frontend = frontends.last().expect("frontend");
    eventually("data is delivered", || frontend.received() == b"hello").await;

    frontend.push_data(b"pong");
    assert_eq!(
        next(&mut peer).await,
        Packet::new(Control::DAT, ConnId::new(7), Bytes::from_static(b"pong"))
    );

    frontend.push_eof();
    assert_eq!(next(&mut peer).await, Packet::control(Control::FIN, ConnId::new(7)));
    eventually("the frontend is closed", || frontend.is_closed()).await;
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn shutdown_closes_record_layers_cleanly() {
    let frontends = MockFactory::new();
    let server = Running::start(frontends.factory()).await;
    let mut peer = server.peer().await;

    send(&mut peer, Control::SYN, 1, b"").await;
    eventually("the frontend is opened", || frontends.created() == 1).await;

    server.stop().await;

    let end = timeout(WAIT, peer.recv()).await.expect("timed out");
    assert!(matches!(end, Ok(None)));
    let frontend = frontends.last().expect("frontend");
    assert!(frontend.is_closed());
    assert!(!frontend.is_reset());
}

#[rstest]
#[tokio::test]
async fn aborted_peer_is_torn_down() {
    let frontends = MockFactory::new();
    let server = Running::start(frontends.factory()).await;
    let mut peer = server.peer().await;

    send(&mut peer, Control::SYN, 1, b"").await;
    eventually("the frontend is opened", || frontends.created() == 1).await;
    peer.abort();

    let frontend = frontends.last().expect("frontend");
    eventually("the frontend is closed", || frontend.is_closed()).await;
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn wrong_key_is_rejected() {
    let frontends = MockFactory::new();
    let server = Running::start(frontends.factory()).await;
    let mut peer = TunnelPeer::connect(server.addr, PresharedKey::from("not the key"))
        .await
        .expect("peer connect");

    send(&mut peer, Control::SYN, 1, b"").await;

    let reply = timeout(WAIT, peer.recv()).await.expect("timed out");
    assert!(reply.is_err());
    assert_eq!(frontends.created(), 0);
    server.stop().await;
}

#[rstest]
#[serial]
#[tokio::test]
async fn panicking_frontend_is_logged_and_the_loop_keeps_serving(mut logger: LoggerHandle) {
    let frontends = MockFactory::new();
    let server = Running::start(frontends.factory()).await;
    let mut first = server.peer().await;

    send(&mut first, Control::SYN, 1, b"").await;
    eventually("the first frontend is opened", || frontends.created() == 1).await;
    let broken = frontends.last().expect("frontend");
    broken.push_panic("frontend exploded");

    let mut records = Vec::new();
    eventually("the panic is logged", || {
        records.extend(logger.drain());
        records.iter().any(|(level, msg)| {
            *level == log::Level::Error
                && msg.contains("event handler panicked")
                && msg.contains("frontend exploded")
        })
    })
    .await;

    let mut second = server.peer().await;
    send(&mut second, Control::SYN | Control::DAT, 2, b"still there?").await;
    eventually("the second frontend is opened", || frontends.created() == 2).await;
    let healthy = frontends.last().expect("frontend");
    eventually("data is delivered", || healthy.received() == b"still there?").await;

    healthy.push_data(b"yes");
    assert_eq!(
        next(&mut second).await,
        Packet::new(Control::DAT, ConnId::new(2), Bytes::from_static(b"yes"))
    );
    server.stop().await;
}
