//! A group of high-level tests for the startup exchange, routing, and
//! cancellation. The client side talks over an in-memory duplex stream; the
//! backend side is a scripted stub behind a real TCP listener so the DSN
//! dial path is exercised too.

use anyhow::ensure;
use bytes::BufMut;
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_postgres::NoTls;

use super::*;
use crate::oracle::{self, BackendStatus, StatusEvent};
use crate::pqproto::write_framed;
use crate::registry;

const SSL_REQUEST_PACKET: [u8; 8] = [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f];
const CANCEL_REQUEST_PACKET: [u8; 16] = [
    0, 0, 0, 0x10, 0x04, 0xd2, 0x16, 0x2e, 0, 0, 0x10, 0x92, 0x11, 0x22, 0x33, 0x44,
];

async fn read_startup_params(socket: &mut TcpStream) -> anyhow::Result<StartupParameters> {
    let len = socket.read_i32().await?;
    let mut body = vec![0u8; len as usize - 4];
    socket.read_exact(&mut body).await?;
    let version = u32::from_be_bytes(body[..4].try_into().unwrap());
    ensure!(version == 196608, "unexpected protocol version {version}");
    Ok(StartupParameters::parse(&body[4..])?)
}

/// Accept one session: check the replayed startup packet, authenticate
/// unconditionally, hand out the given cancellation key, then sit on the
/// connection until the proxy drops it.
async fn serve_stub_session(
    socket: &mut TcpStream,
    expected_database: &str,
    key: BackendKey,
) -> anyhow::Result<()> {
    let params = read_startup_params(socket).await?;
    ensure!(
        params.get("database") == Some(expected_database),
        "unexpected database {:?}",
        params.get("database"),
    );

    let mut reply = Vec::new();
    write_framed(&mut reply, b'R', |b| b.put_i32(0));
    write_framed(&mut reply, b'K', |b| {
        b.put_i32(key.process_id());
        b.put_i32(key.secret_key());
    });
    write_framed(&mut reply, b'Z', |b| b.put_u8(b'I'));
    socket.write_all(&reply).await?;

    let mut sink = [0u8; 512];
    loop {
        if socket.read(&mut sink).await? == 0 {
            return Ok(());
        }
    }
}

async fn stub_backend(
    listener: TcpListener,
    expected_database: String,
    key: BackendKey,
) -> anyhow::Result<()> {
    let (mut socket, _) = listener.accept().await?;
    serve_stub_session(&mut socket, &expected_database, key).await
}

fn spawn_proxy(
    oracle: &OracleHandle,
    registry: &RegistryHandle,
) -> (
    tokio::io::DuplexStream,
    tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    let (client_io, proxy_io) = tokio::io::duplex(4096);
    let (oracle, registry) = (oracle.clone(), registry.clone());
    let task = tokio::spawn(async move { handle_client(&oracle, &registry, proxy_io).await });
    (client_io, task)
}

fn assert_error_response(wire: &[u8], msg: &str) {
    assert_eq!(wire.first(), Some(&b'E'), "expected an ErrorResponse");
    let len = i32::from_be_bytes(wire[1..5].try_into().unwrap()) as usize;
    assert_eq!(len, wire.len() - 1);

    let body = &wire[5..];
    assert!(
        body.windows(7).any(|w| w == b"C08000\0"),
        "missing SQLSTATE 08000"
    );
    let needle = format!("M{msg}\0");
    assert!(
        body.windows(needle.len()).any(|w| w == needle.as_bytes()),
        "missing message {msg:?}"
    );
}

#[tokio::test]
async fn master_session_sniffs_backend_key() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend_dsn = format!("host=127.0.0.1 port={}", listener.local_addr()?.port());

    let oracle = oracle::spawn();
    let registry = registry::spawn();
    oracle
        .update(StatusEvent {
            backend: backend_dsn.clone(),
            status: BackendStatus::Master,
        })
        .await;

    let key = BackendKey::new(4242, 0x11223344);
    let stub = tokio::spawn(stub_backend(listener, "app".to_owned(), key));

    let (client_io, proxy) = spawn_proxy(&oracle, &registry);
    let (pg_client, connection) = tokio_postgres::Config::new()
        .user("alice")
        .dbname("app")
        .connect_raw(client_io, NoTls)
        .await?;
    let pg_conn = tokio::spawn(connection);

    // The session is up, so its cancellation key must resolve to the
    // backend that issued it.
    assert_eq!(
        registry.lookup(key).await.as_deref(),
        Some(backend_dsn.as_str())
    );

    drop(pg_client);
    let _ = pg_conn.await?;
    proxy.await??;
    stub.await??;

    // The registry entry dies with the session.
    assert_eq!(registry.lookup(key).await, None);
    Ok(())
}

#[tokio::test]
async fn cancel_request_replays_verbatim() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let backend_dsn = format!("host=127.0.0.1 port={}", listener.local_addr()?.port());

    let oracle = oracle::spawn();
    let registry = registry::spawn();
    let key = BackendKey::new(4242, 0x11223344);
    let _session = registry.register(key, backend_dsn);

    let stub = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        let mut packet = [0u8; 16];
        socket.read_exact(&mut packet).await?;
        anyhow::Ok(packet)
    });

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    client_io.write_all(&CANCEL_REQUEST_PACKET).await?;

    proxy.await??;
    assert_eq!(stub.await??, CANCEL_REQUEST_PACKET);

    // The cancel issuer hears nothing back, just the close.
    let mut rest = Vec::new();
    client_io.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_cancel_key_is_silently_dropped() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    client_io.write_all(&CANCEL_REQUEST_PACKET).await?;

    proxy.await??;
    let mut rest = Vec::new();
    client_io.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());
    Ok(())
}

#[tokio::test]
async fn replica_sessions_round_robin() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();
    let (accepted_tx, mut accepted_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut ports = Vec::new();
    for i in 0..2i32 {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        ports.push(port);

        let accepted_tx = accepted_tx.clone();
        tokio::spawn(async move {
            let mut pid = 100 * (i + 1);
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let _ = accepted_tx.send(port);
                pid += 1;
                if serve_stub_session(&mut socket, "app", BackendKey::new(pid, pid))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        oracle
            .update(StatusEvent {
                backend: format!("host=127.0.0.1 port={port}"),
                status: BackendStatus::Replica,
            })
            .await;
    }

    // Sequential sessions, so the accept order is the routing order.
    for _ in 0..3 {
        let (client_io, proxy) = spawn_proxy(&oracle, &registry);
        let (pg_client, connection) = tokio_postgres::Config::new()
            .user("alice")
            .dbname("app_replica")
            .connect_raw(client_io, NoTls)
            .await?;
        let pg_conn = tokio::spawn(connection);
        drop(pg_client);
        let _ = pg_conn.await?;
        proxy.await??;
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(accepted_rx.recv().await.unwrap());
    }
    assert_eq!(order, vec![ports[0], ports[1], ports[0]]);
    Ok(())
}

#[tokio::test]
async fn ssl_request_is_declined_then_startup_proceeds() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    client_io.write_all(&SSL_REQUEST_PACKET).await?;

    let mut decline = [0u8; 1];
    client_io.read_exact(&mut decline).await?;
    assert_eq!(decline[0], b'N');

    // The second startup packet is handled normally; with no master up it
    // must come back as a routing error, not a protocol error.
    let mut params = StartupParameters::default();
    params.insert("user", "alice");
    params.insert("database", "app");
    client_io.write_all(&params.to_startup_packet()).await?;

    let mut response = Vec::new();
    client_io.read_to_end(&mut response).await?;
    assert_error_response(&response, "Unable to find satisfactory backend server");

    assert!(proxy.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn second_ssl_request_is_rejected() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    client_io.write_all(&SSL_REQUEST_PACKET).await?;

    let mut decline = [0u8; 1];
    client_io.read_exact(&mut decline).await?;
    assert_eq!(decline[0], b'N');

    client_io.write_all(&SSL_REQUEST_PACKET).await?;

    let mut response = Vec::new();
    client_io.read_to_end(&mut response).await?;
    assert_error_response(&response, "Unsupported protocol version");

    assert!(proxy.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn missing_master_yields_error_response() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    let mut params = StartupParameters::default();
    params.insert("user", "alice");
    params.insert("database", "app");
    client_io.write_all(&params.to_startup_packet()).await?;

    let mut response = Vec::new();
    client_io.read_to_end(&mut response).await?;
    assert_error_response(&response, "Unable to find satisfactory backend server");

    assert!(proxy.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn missing_database_and_user_yields_error_response() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    let mut params = StartupParameters::default();
    params.insert("application_name", "psql");
    client_io.write_all(&params.to_startup_packet()).await?;

    let mut response = Vec::new();
    client_io.read_to_end(&mut response).await?;
    assert_error_response(&response, "Missing database or user parameter");

    assert!(proxy.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn oversized_startup_is_terminated() -> anyhow::Result<()> {
    let oracle = oracle::spawn();
    let registry = registry::spawn();

    let (mut client_io, proxy) = spawn_proxy(&oracle, &registry);
    let mut packet = Vec::new();
    packet.put_i32(9000);
    packet.put_u32(196608);
    client_io.write_all(&packet).await?;

    let mut response = Vec::new();
    client_io.read_to_end(&mut response).await?;
    if !response.is_empty() {
        assert_error_response(&response, "Startup packet size invalid");
    }

    assert!(proxy.await?.is_err());
    Ok(())
}

#[rstest]
#[case("app", RouteIntent::Writer, "app")]
#[case("app_replica", RouteIntent::Reader, "app")]
#[case("app_replica_replica", RouteIntent::Reader, "app_replica")]
fn route_by_database_name(
    #[case] database: &str,
    #[case] intent: RouteIntent,
    #[case] rewritten: &str,
) {
    let mut params = StartupParameters::default();
    params.insert("user", "alice");
    params.insert("database", database);

    assert_eq!(route_intent(&mut params), Some(intent));
    assert_eq!(params.get("database"), Some(rewritten));
}

#[test]
fn route_prefers_database_over_user() {
    let mut params = StartupParameters::default();
    params.insert("user", "bob_replica");
    params.insert("database", "app");

    // The routing name is the database when present; the user's suffix is
    // irrelevant.
    assert_eq!(route_intent(&mut params), Some(RouteIntent::Writer));
    assert_eq!(params.get("database"), Some("app"));
}

#[test]
fn route_user_suffix_rewrites_into_database() {
    let mut params = StartupParameters::default();
    params.insert("user", "nightly_replica");

    assert_eq!(route_intent(&mut params), Some(RouteIntent::Reader));
    assert_eq!(params.get("database"), Some("nightly"));
    assert_eq!(params.get("user"), Some("nightly_replica"));
}

#[test]
fn route_missing_database_and_user() {
    let mut params = StartupParameters::default();
    params.insert("application_name", "psql");
    assert_eq!(route_intent(&mut params), None);
}
