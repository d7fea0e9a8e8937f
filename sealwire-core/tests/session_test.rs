//! Client/server sessions over an in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sealwire_core::crypto::sha256;
use sealwire_core::{
    Attribute, Context, FaultController, FaultKind, Handle, Keyset, MemoryTransport, PrivateKey,
    Registry, ResourceKind, Role, Session, SessionState, Status, Transform, Transport,
};

struct Pair {
    client: Session,
    server: Session,
    server_key: Arc<PrivateKey>,
}

/// Logs go to the test writer; set `RUST_LOG=sealwire_core=debug` to see
/// handshake transitions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Memory transport that counts read calls.
struct CountingTransport {
    inner: MemoryTransport,
    reads: Arc<AtomicUsize>,
}

impl Transport for CountingTransport {
    fn read(&mut self, buf: &mut [u8]) -> sealwire_core::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> sealwire_core::Result<usize> {
        self.inner.write(buf)
    }
}

fn pair_with(ctx: &Context) -> Pair {
    let (a, b) = MemoryTransport::pair();
    pair_over(ctx, a, b)
}

fn pair_over(ctx: &Context, a: impl Transport + 'static, b: MemoryTransport) -> Pair {
    init_tracing();
    let client = ctx.create_session(Role::Client, a).unwrap();
    let mut server = ctx.create_session(Role::Server, b).unwrap();
    let server_key = Arc::new(PrivateKey::generate());
    server
        .set_handle(Attribute::PrivateKey, Handle::PrivateKey(Arc::clone(&server_key)))
        .unwrap();
    Pair {
        client,
        server,
        server_key,
    }
}

fn keyset_with(users: &[(&str, &str)]) -> Handle {
    let mut keyset = Keyset::new();
    for (user, password) in users {
        keyset.add_user(user, password);
    }
    Handle::Keyset(Arc::new(keyset))
}

fn login(session: &mut Session, user: &str, password: &str) {
    session.set_string(Attribute::Username, user).unwrap();
    session.set_string(Attribute::Password, password).unwrap();
}

fn activate(pair: &mut Pair) {
    pair.server.set_numeric(Attribute::Active, 1).unwrap();
    pair.client.set_numeric(Attribute::Active, 1).unwrap();
}

/// Flush both ends until neither makes progress. Returns the last
/// non-timeout status seen from each side.
fn pump(pair: &mut Pair) -> (Option<Status>, Option<Status>) {
    let mut last = (None, None);
    for _ in 0..16 {
        let server = pair.server.flush().err().map(|err| err.status());
        let client = pair.client.flush().err().map(|err| err.status());
        last = (
            client.filter(|status| *status != Status::Timeout),
            server.filter(|status| *status != Status::Timeout),
        );
    }
    last
}

fn established(ctx: &Context) -> Pair {
    establish(pair_with(ctx))
}

fn establish(mut pair: Pair) -> Pair {
    pair.server
        .set_handle(Attribute::Keyset, keyset_with(&[("alice", "wonderland")]))
        .unwrap();
    login(&mut pair.client, "alice", "wonderland");
    activate(&mut pair);
    assert_eq!(pump(&mut pair), (None, None));
    assert_eq!(pair.client.state(), SessionState::Established);
    assert_eq!(pair.server.state(), SessionState::Established);
    pair
}

fn receive(session: &mut Session, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..64 {
        if out.len() >= want {
            break;
        }
        match session.pop(&mut buf) {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.status() == Status::Timeout => {}
            Err(err) => panic!("pop failed: {err}"),
        }
    }
    out
}

#[test]
fn test_handshake_with_keyset_login() {
    let ctx = Context::new();
    let pair = established(&ctx);

    assert_eq!(pair.client.peer_identity(), Some("alice"));
    assert_eq!(pair.server.peer_identity(), Some("alice"));
    assert_eq!(pair.client.version(), Some(2));
    assert_eq!(pair.server.get_numeric(Attribute::Version).unwrap(), 2);
    assert_eq!(pair.client.get_numeric(Attribute::Active).unwrap(), 1);

    let expected = hex::encode(&sha256(&pair.server_key.public_key().to_bytes())[..16]);
    assert_eq!(pair.client.fingerprint(), Some(expected.clone()));
    assert_eq!(pair.client.get_string(Attribute::Fingerprint).unwrap(), expected);
}

#[test]
fn test_bidirectional_data() {
    let ctx = Context::new();
    let mut pair = established(&ctx);

    pair.client.push(b"hello from the client").unwrap();
    pair.client.flush().unwrap();
    assert_eq!(receive(&mut pair.server, 21), b"hello from the client");

    pair.server.push(b"hello back").unwrap();
    pair.server.flush().unwrap();
    assert_eq!(receive(&mut pair.client, 10), b"hello back");
}

#[test]
fn test_pop_returns_without_waiting_once_data_arrived() {
    let ctx = Context::new();
    let reads = Arc::new(AtomicUsize::new(0));
    let (a, b) = MemoryTransport::pair();
    let client = CountingTransport {
        inner: a,
        reads: Arc::clone(&reads),
    };
    let mut pair = establish(pair_over(&ctx, client, b));

    pair.server.push(b"one record").unwrap();
    pair.server.flush().unwrap();
    reads.store(0, Ordering::SeqCst);
    let mut buf = [0u8; 4096];
    assert_eq!(pair.client.pop(&mut buf).unwrap(), 10);
    assert_eq!(&buf[..10], b"one record");
    assert_eq!(reads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_large_payload_spans_records() {
    let ctx = Context::new();
    let mut pair = established(&ctx);
    let data: Vec<u8> = (0..20_000).map(|i| (i % 253) as u8).collect();

    assert_eq!(pair.client.push(&data).unwrap(), data.len());
    pair.client.flush().unwrap();
    assert_eq!(receive(&mut pair.server, data.len()), data);
}

#[test]
fn test_full_send_buffer_reports_consumed() {
    let ctx = Context::new();
    let mut pair = pair_with(&ctx);
    pair.client.set_numeric(Attribute::BufferSize, 4096).unwrap();
    pair.server
        .set_handle(Attribute::Keyset, keyset_with(&[("alice", "wonderland")]))
        .unwrap();
    login(&mut pair.client, "alice", "wonderland");
    activate(&mut pair);
    pump(&mut pair);
    assert_eq!(
        pair.client.set_numeric(Attribute::BufferSize, 8192).unwrap_err().status(),
        Status::BadParam
    );

    let data = vec![0x42u8; 10_000];
    let err = pair.client.push(&data).unwrap_err();
    assert_eq!(err.status(), Status::Overflow);
    assert_eq!(err.consumed(), 8192);
    pair.client.push(&data[8192..]).unwrap();
    pair.client.flush().unwrap();
    assert_eq!(receive(&mut pair.server, data.len()), data);
}

#[test]
fn test_server_suspends_without_static_key() {
    let ctx = Context::new();
    let (a, b) = MemoryTransport::pair();
    let mut client = ctx.create_session(Role::Client, a).unwrap();
    let mut server = ctx.create_session(Role::Server, b).unwrap();
    login(&mut client, "alice", "wonderland");
    client.set_numeric(Attribute::Active, 1).unwrap();

    let err = server.set_numeric(Attribute::Active, 1).unwrap_err();
    assert_eq!(err.status(), Status::ResourceNeeded);
    assert_eq!(server.required_resource(), Some(ResourceKind::PrivateKey));
    server
        .set_handle(Attribute::PrivateKey, Handle::PrivateKey(Arc::new(PrivateKey::generate())))
        .unwrap();
    assert_eq!(server.state(), SessionState::Negotiating);
}

#[test]
fn test_client_suspends_for_password() {
    let ctx = Context::new();
    let mut pair = pair_with(&ctx);
    pair.server
        .set_handle(Attribute::Keyset, keyset_with(&[("bob", "builder")]))
        .unwrap();
    activate(&mut pair);

    let (client, _) = pump(&mut pair);
    assert_eq!(client, Some(Status::ResourceNeeded));
    assert_eq!(pair.client.state(), SessionState::Authenticating);
    assert_eq!(pair.client.required_resource(), Some(ResourceKind::Password));

    login(&mut pair.client, "bob", "builder");
    assert_eq!(pump(&mut pair), (None, None));
    assert_eq!(pair.client.state(), SessionState::Established);
    assert_eq!(pair.server.peer_identity(), Some("bob"));
}

#[test]
fn test_manual_deny_then_approve_other_identity() {
    let ctx = Context::new();
    let mut pair = pair_with(&ctx);
    pair.server.set_numeric(Attribute::ManualAuth, 1).unwrap();
    login(&mut pair.client, "mallory", "guess");
    activate(&mut pair);

    let (_, server) = pump(&mut pair);
    assert_eq!(server, Some(Status::ResourceNeeded));
    assert_eq!(pair.server.required_resource(), Some(ResourceKind::Authorization));
    assert_eq!(pair.server.get_string(Attribute::Username).unwrap(), "mallory");
    pair.server.set_numeric(Attribute::AuthResponse, 0).unwrap();

    let err = pair.client.flush().unwrap_err();
    assert_eq!(err.status(), Status::WrongKey);
    assert_eq!(pair.client.required_resource(), Some(ResourceKind::Password));
    assert_eq!(pair.client.state(), SessionState::Authenticating);

    login(&mut pair.client, "alice", "wonderland");
    pump(&mut pair);
    assert_eq!(pair.server.get_string(Attribute::Username).unwrap(), "alice");
    pair.server.set_numeric(Attribute::AuthResponse, 1).unwrap();
    pump(&mut pair);

    assert_eq!(pair.client.state(), SessionState::Established);
    assert_eq!(pair.server.state(), SessionState::Established);
    assert_eq!(pair.client.peer_identity(), Some("alice"));
    assert_eq!(pair.server.get_string(Attribute::PeerIdentity).unwrap(), "alice");
}

#[test]
fn test_retry_limit_ends_both_sides() {
    let ctx = Context::new();
    let mut pair = pair_with(&ctx);
    pair.server.set_numeric(Attribute::AuthRetryLimit, 2).unwrap();
    pair.server
        .set_handle(Attribute::Keyset, keyset_with(&[("alice", "wonderland")]))
        .unwrap();
    login(&mut pair.client, "alice", "wrong-1");
    activate(&mut pair);

    let (client, _) = pump(&mut pair);
    assert_eq!(client, Some(Status::ResourceNeeded));
    login(&mut pair.client, "alice", "wrong-2");
    pump(&mut pair);

    assert_eq!(pair.server.state(), SessionState::Failed(Status::WrongKey));
    assert_eq!(pair.client.state(), SessionState::Failed(Status::WrongKey));
    assert_eq!(pair.client.flush().unwrap_err().status(), Status::WrongKey);
}

#[test]
fn test_deny_fault_forces_retry() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    let mut pair = pair_with(&ctx);
    pair.server
        .set_handle(Attribute::Keyset, keyset_with(&[("alice", "wonderland")]))
        .unwrap();
    faults.arm(FaultKind::DenyAuth);
    login(&mut pair.client, "alice", "wonderland");
    activate(&mut pair);

    pump(&mut pair);
    assert_eq!(pair.client.required_resource(), Some(ResourceKind::Password));
    login(&mut pair.client, "alice", "wonderland");
    assert_eq!(pump(&mut pair), (None, None));
    assert_eq!(pair.client.state(), SessionState::Established);
}

#[test]
fn test_version_negotiation_takes_minimum() {
    let ctx = Context::new();
    let mut pair = pair_with(&ctx);
    pair.client.set_numeric(Attribute::Version, 1).unwrap();
    pair.server
        .set_handle(Attribute::Keyset, keyset_with(&[("alice", "wonderland")]))
        .unwrap();
    login(&mut pair.client, "alice", "wonderland");
    activate(&mut pair);
    pump(&mut pair);

    assert_eq!(pair.client.version(), Some(1));
    assert_eq!(pair.server.version(), Some(1));
    assert_eq!(pair.server.state(), SessionState::Established);
}

#[test]
fn test_version_below_server_minimum_fails() {
    let client_ctx = Context::new();
    let server_ctx = Context::new().with_registry(Registry::builtin().with_versions(2, 2));
    let (a, b) = MemoryTransport::pair();
    let mut client = client_ctx.create_session(Role::Client, a).unwrap();
    client.set_numeric(Attribute::Version, 1).unwrap();
    let mut server = server_ctx.create_session(Role::Server, b).unwrap();
    server
        .set_handle(Attribute::PrivateKey, Handle::PrivateKey(Arc::new(PrivateKey::generate())))
        .unwrap();

    server.set_numeric(Attribute::Active, 1).unwrap();
    client.set_numeric(Attribute::Active, 1).unwrap();
    assert_eq!(server.flush().unwrap_err().status(), Status::BadData);
    assert_eq!(server.state(), SessionState::Failed(Status::BadData));
    assert!(matches!(client.flush(), Err(err) if !err.is_recoverable()));
}

#[test]
fn test_peer_gone_during_handshake_is_read_error() {
    let ctx = Context::new();
    let mut pair = pair_with(&ctx);
    pair.client.set_numeric(Attribute::Active, 1).unwrap();
    let Pair { mut client, server, .. } = pair;
    drop(server);

    assert_eq!(client.flush().unwrap_err().status(), Status::Read);
    assert_eq!(client.state(), SessionState::Failed(Status::Read));
}

#[test]
fn test_transport_read_fault_is_fatal() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    let mut pair = established(&ctx);

    faults.arm(FaultKind::TransportRead);
    let mut buf = [0u8; 64];
    assert_eq!(pair.server.pop(&mut buf).unwrap_err().status(), Status::Read);
    assert_eq!(pair.server.state(), SessionState::Failed(Status::Read));
    assert_eq!(pair.server.push(b"x").unwrap_err().status(), Status::Read);
}

#[test]
fn test_received_data_survives_write_fault() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    let mut pair = established(&ctx);

    pair.client.push(b"hello world").unwrap();
    pair.client.flush().unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(pair.server.pop(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"hell");

    faults.arm(FaultKind::TransportWrite);
    pair.server.push(b"reply").unwrap();
    assert_eq!(pair.server.flush().unwrap_err().status(), Status::Write);
    assert_eq!(pair.server.state(), SessionState::Failed(Status::Write));

    let mut rest = Vec::new();
    while let Ok(n) = pair.server.pop(&mut buf) {
        rest.extend_from_slice(&buf[..n]);
    }
    assert_eq!(rest, b"o world");
    assert_eq!(pair.server.pop(&mut buf).unwrap_err().status(), Status::Write);
}

#[test]
fn test_corrupt_record_fails_authentication() {
    let faults = Arc::new(FaultController::new());
    let ctx = Context::new().with_faults(Arc::clone(&faults));
    let mut pair = established(&ctx);

    pair.client.push(b"tamper with me").unwrap();
    pair.client.flush().unwrap();
    faults.arm(FaultKind::CorruptPayload);
    let mut buf = [0u8; 64];
    assert_eq!(pair.server.pop(&mut buf).unwrap_err().status(), Status::Signature);
}

#[test]
fn test_close_reaches_peer() {
    let ctx = Context::new();
    let mut pair = established(&ctx);

    pair.client.push(b"last words").unwrap();
    pair.client.close().unwrap();
    assert_eq!(pair.client.state(), SessionState::Closed);

    assert_eq!(receive(&mut pair.server, 10), b"last words");
    let mut buf = [0u8; 16];
    assert_eq!(pair.server.pop(&mut buf).unwrap(), 0);
    assert_eq!(pair.server.state(), SessionState::Closed);
    assert_eq!(pair.server.push(b"x").unwrap_err().status(), Status::Complete);
}

#[test]
fn test_destroy_sends_close() {
    let ctx = Context::new();
    let pair = established(&ctx);
    let Pair { client, mut server, .. } = pair;
    client.destroy();

    let mut buf = [0u8; 16];
    assert_eq!(server.pop(&mut buf).unwrap(), 0);
    assert_eq!(server.state(), SessionState::Closed);
}
