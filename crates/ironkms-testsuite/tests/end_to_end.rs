//! Live-server scenarios: a real listener, the synthetic client, and
//! the documented activation behaviors.

use std::sync::Arc;
use std::time::Duration;

use ironkms_catalog::Catalog;
use ironkms_pdu::kms::{self, ProtocolVersion};
use ironkms_server::{KmsEvent, KmsServer, KmsServerOptions, ProtocolErrorKind, ShutdownHandle};
use ironkms_store::ActivationStore;
use ironkms_testsuite::{
    sample_request, CollectingSink, Exchange, TestClient, OFFICE_2016_SKU, OFFICE_GROUP, SAMPLE_CMID,
    SAMPLE_REQUEST_TIME, UNKNOWN_SKU, WINDOWS_GROUP, WINDOWS_PRO_SKU,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

struct TestServer {
    addr: std::net::SocketAddr,
    handle: ShutdownHandle,
    task: JoinHandle<Result<(), ironkms_server::ServerError>>,
}

impl TestServer {
    async fn start(configure: impl FnOnce(&mut KmsServerOptions)) -> Self {
        Self::start_with(configure, None, None).await
    }

    async fn start_with(
        configure: impl FnOnce(&mut KmsServerOptions),
        store: Option<ActivationStore>,
        sink: Option<Arc<CollectingSink>>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        let mut options = KmsServerOptions {
            addr,
            ..KmsServerOptions::default()
        };
        configure(&mut options);

        let catalog = Arc::new(Catalog::load_embedded().expect("embedded catalog"));
        let mut builder = KmsServer::builder().with_options(options).with_catalog(catalog);
        if let Some(store) = store {
            builder = builder.with_store(store);
        }
        if let Some(sink) = sink {
            builder = builder.with_event_sink(sink);
        }

        let server = builder.build();
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.run_with_listener(listener));

        Self { addr, handle, task }
    }

    async fn stop(self) {
        self.handle.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.task).await;
    }
}

// S1: a V6 Windows client activates; the envelope authenticates and the
// derived EPID carries the Windows PID prefix.
#[tokio::test]
async fn v6_windows_activation() {
    let server = TestServer::start(|_| {}).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, WINDOWS_PRO_SKU, SAMPLE_CMID);
    let Exchange::Response { response, .. } = client.activate(&request).await.unwrap() else {
        panic!("expected a response");
    };

    assert_eq!(response.version, ProtocolVersion::V6);
    assert!(response.kms_epid.starts_with("03612"));
    assert_eq!(response.client_machine_id, SAMPLE_CMID);
    assert_eq!(response.response_time, SAMPLE_REQUEST_TIME);
    assert!(response.activated_machines >= 25);
    assert_eq!(response.activation_interval, 120);
    assert_eq!(response.renewal_interval, 10080);
    assert!(response.kms_host_id.is_some());

    server.stop().await;
}

// S2: a V5 Office client gets a salted RC4 envelope whose trailing
// digest verifies (open_response performs the client-side check).
#[tokio::test]
async fn v5_office_activation() {
    let server = TestServer::start(|_| {}).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V5, OFFICE_GROUP, OFFICE_2016_SKU, SAMPLE_CMID);
    let Exchange::Response { envelope, response } = client.activate(&request).await.unwrap() else {
        panic!("expected a response");
    };

    assert_eq!(response.version, ProtocolVersion::V5);
    assert!(response.kms_host_id.is_none());
    // version (4) || salt (16) || stream at least digest-sized
    assert!(envelope.len() >= 4 + 16 + 16);
    assert!(kms::open_response(&envelope).is_ok());

    server.stop().await;
}

// S3: the legacy V4 shape is served and accepted on input.
#[tokio::test]
async fn v4_legacy_activation() {
    let server = TestServer::start(|_| {}).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V4, WINDOWS_GROUP, WINDOWS_PRO_SKU, SAMPLE_CMID);
    let Exchange::Response { envelope, response } = client.activate(&request).await.unwrap() else {
        panic!("expected a response");
    };

    assert_eq!(response.version, ProtocolVersion::V4);
    // inner || 16-byte keyed hash
    assert!(envelope.len() > 16);

    server.stop().await;
}

// S4: a flipped CMAC byte drops the connection without any response
// bytes and surfaces as a BadV6Cmac protocol event.
#[tokio::test]
async fn tampered_v6_cmac_drops_connection() {
    let sink = Arc::new(CollectingSink::new());
    let server = TestServer::start_with(|_| {}, None, Some(Arc::clone(&sink))).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, WINDOWS_PRO_SKU, SAMPLE_CMID);
    let mut envelope = kms::seal_request(&request).unwrap();
    let last = envelope.len() - 1;
    envelope[last] ^= 0x01;

    let outcome = client.activate_envelope(&envelope).await.unwrap();
    assert!(matches!(outcome, Exchange::Closed), "got {outcome:?}");

    let events = sink.events();
    assert!(events.iter().any(|event| matches!(
        event,
        KmsEvent::ProtocolError {
            kind: ProtocolErrorKind::BadV6Cmac,
            ..
        }
    )));
    assert!(!events.iter().any(|event| matches!(event, KmsEvent::ResponseSent { .. })));

    server.stop().await;
}

// S5: an unknown SKU still activates; events carry the hex fallback.
#[tokio::test]
async fn unknown_sku_still_activates() {
    let sink = Arc::new(CollectingSink::new());
    let server = TestServer::start_with(|_| {}, None, Some(Arc::clone(&sink))).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, UNKNOWN_SKU, SAMPLE_CMID);
    let Exchange::Response { response, .. } = client.activate(&request).await.unwrap() else {
        panic!("expected a response");
    };
    assert!(response.activated_machines >= 25);

    let accepted = sink
        .events()
        .into_iter()
        .find_map(|event| match event {
            KmsEvent::RequestAccepted { sku, .. } => Some(sku),
            _ => None,
        })
        .expect("request accepted event");
    assert_eq!(accepted, UNKNOWN_SKU.to_string());

    server.stop().await;
}

// S6: with persistence on, repeat requests from one machine share one
// record and one EPID.
#[tokio::test]
async fn persistence_counts_and_pins_the_epid() {
    let store = ActivationStore::open(":memory:").unwrap();
    let server = TestServer::start_with(|_| {}, Some(store.clone()), None).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, WINDOWS_PRO_SKU, SAMPLE_CMID);
    let mut epids = Vec::new();
    for _ in 0..2 {
        let Exchange::Response { response, .. } = client.activate(&request).await.unwrap() else {
            panic!("expected a response");
        };
        epids.push(response.kms_epid);
    }
    assert_eq!(epids[0], epids[1]);

    let record = store.fetch(SAMPLE_CMID, WINDOWS_GROUP).unwrap().expect("record");
    assert_eq!(record.n_requests, 2);
    assert_eq!(record.epid, epids[0]);
    assert_eq!(record.request_ring, vec![SAMPLE_REQUEST_TIME, SAMPLE_REQUEST_TIME]);

    server.stop().await;
}

// Property 3: EPID stability also holds across connections without any
// store.
#[tokio::test]
async fn epid_is_stable_across_connections() {
    let server = TestServer::start(|_| {}).await;
    let request = sample_request(ProtocolVersion::V5, OFFICE_GROUP, OFFICE_2016_SKU, SAMPLE_CMID);

    let mut epids = Vec::new();
    for _ in 0..2 {
        let mut client = TestClient::connect(server.addr).await.unwrap();
        client.bind().await.unwrap();
        let Exchange::Response { response, .. } = client.activate(&request).await.unwrap() else {
            panic!("expected a response");
        };
        epids.push(response.kms_epid);
    }

    assert_eq!(epids[0], epids[1]);
    assert!(epids[0].starts_with("06401"));

    server.stop().await;
}

// A request before bind violates the session state machine.
#[tokio::test]
async fn request_before_bind_is_refused() {
    let sink = Arc::new(CollectingSink::new());
    let server = TestServer::start_with(|_| {}, None, Some(Arc::clone(&sink))).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    let request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, WINDOWS_PRO_SKU, SAMPLE_CMID);

    let outcome = client.activate(&request).await.unwrap();
    assert!(matches!(outcome, Exchange::Closed), "got {outcome:?}");

    assert!(sink.events().iter().any(|event| matches!(
        event,
        KmsEvent::ProtocolError {
            kind: ProtocolErrorKind::BindRequired,
            ..
        }
    )));

    server.stop().await;
}

// Unknown opnums fault with nca_s_op_rng_error.
#[tokio::test]
async fn unknown_opnum_faults() {
    let server = TestServer::start(|_| {}).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let outcome = client.call_opnum(7).await.unwrap();
    let Exchange::Fault(fault) = outcome else {
        panic!("expected a fault, got {outcome:?}");
    };
    assert_eq!(fault.status, ironkms_pdu::rpc::NCA_S_OP_RNG_ERROR);

    server.stop().await;
}

// Fragmented requests reassemble into one activation.
#[tokio::test]
async fn fragmented_request_is_served() {
    let server = TestServer::start(|_| {}).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, WINDOWS_PRO_SKU, SAMPLE_CMID);
    let Exchange::Response { response, .. } = client.activate_fragmented(&request, 3).await.unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(response.client_machine_id, SAMPLE_CMID);

    server.stop().await;
}

// Idle sessions close after the configured read timeout.
#[tokio::test]
async fn idle_timeout_closes_the_session() {
    let server = TestServer::start(|options| {
        options.timeout_idle = Some(Duration::from_millis(100));
    })
    .await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), client.read_frame())
        .await
        .expect("server should close the idle session");
    assert!(closed.unwrap().is_none());

    server.stop().await;
}

// Graceful shutdown stops the acceptor and drains sessions.
#[tokio::test]
async fn graceful_shutdown_completes() {
    let server = TestServer::start(|_| {}).await;

    let mut client = TestClient::connect(server.addr).await.unwrap();
    client.bind().await.unwrap();

    let addr = server.addr;
    server.handle.shutdown();
    let outcome = tokio::time::timeout(Duration::from_secs(10), server.task)
        .await
        .expect("server drains within the grace period")
        .expect("server task completes");
    assert!(outcome.is_ok());

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

// Property 7: concurrent sessions never see each other's responses.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_stay_isolated() {
    const SESSIONS: usize = 64;
    const REQUESTS_PER_SESSION: usize = 20;

    let server = TestServer::start(|_| {}).await;
    let addr = server.addr;

    let mut workers = Vec::with_capacity(SESSIONS);
    for session in 0..SESSIONS {
        workers.push(tokio::spawn(async move {
            let cmid = Uuid::from_u128(0xA000_0000_0000_0000_0000_0000_0000_0000 + session as u128);
            let mut client = TestClient::connect(addr).await.unwrap();
            client.bind().await.unwrap();

            for round in 0..REQUESTS_PER_SESSION {
                let mut request = sample_request(ProtocolVersion::V6, WINDOWS_GROUP, WINDOWS_PRO_SKU, cmid);
                request.request_time = SAMPLE_REQUEST_TIME + round as u64;

                let Exchange::Response { response, .. } = client.activate(&request).await.unwrap() else {
                    panic!("expected a response");
                };
                assert_eq!(response.client_machine_id, cmid, "response crossed sessions");
                assert_eq!(response.response_time, request.request_time);
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }

    server.stop().await;
}
