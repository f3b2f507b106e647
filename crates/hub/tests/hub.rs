//! End-to-end coverage of the §8 scenarios over a real HTTP/WebSocket
//! listener, complementing the in-process `HubState`/`HubContext` unit
//! tests in `scheduler.rs`/`state.rs`. Grounded on the way
//! `turn-server`'s `crates/service/tests/turn.rs` drives a constructed
//! service directly rather than shelling out to a client binary: each
//! test here stands up `boardshare_hub::http::router` on an ephemeral
//! port and talks to it with a real `tokio-tungstenite` client.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use boardshare_hub::auth::{AuthPolicy, NoopAuthPolicy, StaticTokenAuthPolicy};
use boardshare_hub::http::{router, AppState};
use boardshare_hub::session::Role;
use boardshare_hub::state::HubContext;
use boardshare_hub::ws::new_outboxes;
use boardshare_model::{ImportSpec, Part, PartSpec};
use boardshare_protocol::{decode_method, encode_request, Frame, HubNotification, HubRequest, HubResponse, IdAllocator};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

struct Server {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

async fn spawn_server(auth: Arc<dyn AuthPolicy>) -> Server {
    let state = AppState {
        hub: HubContext::new(),
        auth,
        outboxes: new_outboxes(),
    };
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server { addr, _task: task }
}

struct Client {
    write: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >,
    read: futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
    ids: IdAllocator,
}

impl Client {
    async fn connect(server: &Server, role: &str, token: Option<&str>) -> Self {
        let url = match token {
            Some(t) => format!("ws://{}/ws?role={role}&token={t}", server.addr),
            None => format!("ws://{}/ws?role={role}", server.addr),
        };
        let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (write, read) = stream.split();
        Self {
            write,
            read,
            ids: IdAllocator::initiator(),
        }
    }

    async fn call(&mut self, call: HubRequest) -> Result<HubResponse, boardshare_protocol::RpcError> {
        let id = self.ids.next();
        let req = encode_request(id, &call).unwrap();
        let bytes = Frame::Request(req).encode().unwrap();
        self.write.send(Message::Text(String::from_utf8(bytes).unwrap().into())).await.unwrap();

        loop {
            let msg = self.read.next().await.expect("connection closed before response").unwrap();
            let Message::Text(text) = msg else { continue };
            match Frame::decode(text.as_bytes()).unwrap() {
                Frame::Response(resp) if resp.id == id => {
                    return resp.into_result().map(|v| serde_json::from_value(v).unwrap());
                }
                _ => continue, // a notification that arrived before our response
            }
        }
    }

    async fn next_notification(&mut self) -> HubNotification {
        loop {
            let msg = self.read.next().await.expect("connection closed waiting for notification").unwrap();
            let Message::Text(text) = msg else { continue };
            if let Frame::Notification(n) = Frame::decode(text.as_bytes()).unwrap() {
                return decode_method(&n.method, &n.params).unwrap();
            }
        }
    }
}

fn spec(tag: &str) -> ImportSpec {
    let mut parts = BTreeMap::new();
    parts.insert(
        "dut".to_string(),
        PartSpec {
            compatible: [tag.to_string()].into_iter().collect(),
            tcp: Default::default(),
            usb: Default::default(),
        },
    );
    ImportSpec {
        auto_return_time: Duration::from_secs(0),
        parts,
    }
}

fn part(tag: &str) -> Part {
    Part {
        compatible: [tag.to_string()].into_iter().collect(),
        tcp: Default::default(),
        usb: Default::default(),
    }
}

#[tokio::test]
async fn happy_path_register_then_reserve_delivers_place_available() {
    let server = spawn_server(Arc::new(NoopAuthPolicy)).await;
    let mut exporter = Client::connect(&server, "exporter", None).await;
    let mut agent = Client::connect(&server, "agent", None).await;

    let resp = exporter
        .call(HubRequest::RegisterExporter { port: 2192, parts: vec![part("dut")] })
        .await
        .unwrap();
    let place_id = match resp {
        HubResponse::PlaceId { place_id } => place_id,
        other => panic!("unexpected response: {other:?}"),
    };

    let resp = agent.call(HubRequest::Reserve { import_spec: spec("dut") }).await.unwrap();
    assert!(matches!(resp, HubResponse::ReservationId { .. }));

    let notification = agent.next_notification().await;
    match notification {
        HubNotification::PlaceAvailable { place_id: got, .. } => assert_eq!(got, place_id),
        other => panic!("expected place_available, got {other:?}"),
    }
    let notification = exporter.next_notification().await;
    assert!(matches!(notification, HubNotification::PlaceReserved { .. }));
}

#[tokio::test]
async fn fifo_queue_second_reservation_waits_until_return() {
    let server = spawn_server(Arc::new(NoopAuthPolicy)).await;
    let mut exporter = Client::connect(&server, "exporter", None).await;
    let mut first = Client::connect(&server, "agent", None).await;
    let mut second = Client::connect(&server, "agent", None).await;

    exporter
        .call(HubRequest::RegisterExporter { port: 2192, parts: vec![part("dut")] })
        .await
        .unwrap();

    let first_resp = first.call(HubRequest::Reserve { import_spec: spec("dut") }).await.unwrap();
    let first_id = match first_resp {
        HubResponse::ReservationId { reservation_id } => reservation_id,
        other => panic!("unexpected response: {other:?}"),
    };
    let _ = first.next_notification().await; // place_available
    let _ = exporter.next_notification().await; // place_reserved

    let second_resp = second.call(HubRequest::Reserve { import_spec: spec("dut") }).await.unwrap();
    assert!(matches!(second_resp, HubResponse::ReservationId { .. }));

    first.call(HubRequest::ReturnReservation { reservation_id: first_id }).await.unwrap();

    let notification = second.next_notification().await;
    assert!(matches!(notification, HubNotification::PlaceAvailable { .. }));
}

#[tokio::test]
async fn exporter_disconnect_returns_the_agent_with_exporter_gone() {
    let server = spawn_server(Arc::new(NoopAuthPolicy)).await;
    let mut exporter = Client::connect(&server, "exporter", None).await;
    let mut agent = Client::connect(&server, "agent", None).await;

    exporter
        .call(HubRequest::RegisterExporter { port: 2192, parts: vec![part("dut")] })
        .await
        .unwrap();
    agent.call(HubRequest::Reserve { import_spec: spec("dut") }).await.unwrap();
    let _ = agent.next_notification().await; // place_available

    exporter.write.close().await.unwrap();

    let notification = agent.next_notification().await;
    match notification {
        HubNotification::ReservationLost { reason, .. } => {
            assert_eq!(reason, boardshare_model::ReturnReason::ExporterGone);
        }
        other => panic!("expected reservation_lost, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthorized_reserve_is_rejected_with_auth_error() {
    let auth: Arc<dyn AuthPolicy> = Arc::new(
        StaticTokenAuthPolicy::new().grant("exp-token", "exporter-bot", &[Role::Exporter]),
    );
    let server = spawn_server(auth).await;
    let mut agent = Client::connect(&server, "agent", Some("exp-token")).await;

    let err = agent
        .call(HubRequest::Reserve { import_spec: spec("dut") })
        .await
        .expect_err("a token granted only the exporter role must not be able to reserve");
    assert_eq!(err.kind, boardshare_protocol::ErrorKind::Auth);
}

#[tokio::test]
async fn reserve_with_no_matching_place_fails_synchronously_with_no_match() {
    let server = spawn_server(Arc::new(NoopAuthPolicy)).await;
    let mut exporter = Client::connect(&server, "exporter", None).await;
    let mut agent = Client::connect(&server, "agent", None).await;

    exporter
        .call(HubRequest::RegisterExporter { port: 2192, parts: vec![part("other-tag")] })
        .await
        .unwrap();

    let err = agent
        .call(HubRequest::Reserve { import_spec: spec("dut") })
        .await
        .expect_err("a spec with no candidate place must fail the call itself, not enqueue it");
    assert_eq!(err.kind, boardshare_protocol::ErrorKind::NoMatch);

    // Nothing was enqueued, so registering a matching place later must not
    // retroactively satisfy a reservation that was never admitted.
    exporter
        .call(HubRequest::RegisterExporter { port: 2193, parts: vec![part("dut")] })
        .await
        .unwrap();
    let places = agent.read.next();
    let timeout = tokio::time::timeout(Duration::from_millis(200), places).await;
    assert!(timeout.is_err(), "a rejected reserve must leave nothing in the pending queue");
}
