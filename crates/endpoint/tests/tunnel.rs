mod common;

use bytes::{Buf, Bytes, BytesMut};
use common::*;
use http::{HeaderMap, Request};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::{TokioExecutor, TokioIo};
use prost::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tlsmux_endpoint::server::EndpointMode;
use tlsmux_endpoint::tunnel::TunnelSettings;
use tlsmux_endpoint::{RecordingSink, RouteTable, TunnelFrame};
use tokio::task::JoinHandle;

/// Length-prefixed gRPC messages for `payloads`
fn grpc_body(payloads: &[&[u8]]) -> Bytes {
    let mut body = BytesMut::new();
    for payload in payloads {
        let encoded = TunnelFrame {
            payload: Bytes::copy_from_slice(payload),
        }
        .encode_to_vec();
        body.extend_from_slice(&[0]);
        body.extend_from_slice(&u32::try_from(encoded.len()).unwrap().to_be_bytes());
        body.extend_from_slice(&encoded);
    }
    body.freeze()
}

/// Concatenated payloads of every gRPC message in `body`
fn decode_frames(mut body: Bytes) -> Vec<u8> {
    let mut out = Vec::new();
    while body.has_remaining() {
        assert_eq!(body.get_u8(), 0, "compressed frames are not expected");
        let len = body.get_u32() as usize;
        let frame = TunnelFrame::decode(body.split_to(len)).unwrap();
        out.extend_from_slice(&frame.payload);
    }
    out
}

type Connection = JoinHandle<Result<(), hyper::Error>>;

async fn h2_connect(
    addr: SocketAddr,
    identity: &tlsmux_endpoint::Identity,
) -> (SendRequest<Full<Bytes>>, Connection) {
    let connector = connector(identity, &[&rustls::version::TLS13], &[b"h2"]);
    let tls = connect(addr, &connector).await.unwrap();
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let (sender, connection) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .unwrap();
    (sender, tokio::spawn(connection))
}

async fn h2_client(
    addr: SocketAddr,
    identity: &tlsmux_endpoint::Identity,
) -> SendRequest<Full<Bytes>> {
    h2_connect(addr, identity).await.0
}

/// Make one tunnel call and return `(payload bytes, headers, trailers)`
async fn call(
    sender: &mut SendRequest<Full<Bytes>>,
    path: &str,
    payloads: &[&[u8]],
) -> (Vec<u8>, HeaderMap, Option<HeaderMap>) {
    let request = Request::post(format!("https://{SERVER_NAME}/{path}/Connect"))
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .header(http::header::TE, "trailers")
        .body(Full::new(grpc_body(payloads)))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
    let headers = response.headers().clone();
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned();
    (decode_frames(collected.to_bytes()), headers, trailers)
}

fn grpc_status(headers: &HeaderMap, trailers: Option<&HeaderMap>) -> Option<String> {
    trailers
        .and_then(|t| t.get("grpc-status"))
        .or_else(|| headers.get("grpc-status"))
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn test_tunnel_echo_on_default_service_name() {
    let identity = identity();
    let sink = RecordingSink::new();
    let dst = echo_server().await;
    let routes = RouteTable::parse(&dst).unwrap();
    let addr = start_endpoint(
        EndpointMode::MultiplexedTunnel(routes),
        "tlsmux.Tunnel",
        policy(&identity),
        sink.clone(),
    )
    .await;

    let mut sender = h2_client(addr, &identity).await;
    let (echoed, headers, trailers) =
        call(&mut sender, "tlsmux.Tunnel", &[b"hello ", b"through ", b"the tunnel"]).await;

    assert_eq!(echoed, b"hello through the tunnel");
    assert_eq!(grpc_status(&headers, trailers.as_ref()).as_deref(), Some("0"));
    assert!(sink.connection_errors().is_empty());
}

#[tokio::test]
async fn test_paths_route_to_their_own_destinations() {
    let identity = identity();
    let alpha = greeting_server(b"alpha").await;
    let beta = greeting_server(b"beta").await;
    let routes = RouteTable::parse(&format!("a/{alpha},b/{beta}")).unwrap();
    let addr = start_endpoint(
        EndpointMode::MultiplexedTunnel(routes),
        "tlsmux.Tunnel",
        policy(&identity),
        RecordingSink::new(),
    )
    .await;

    // Both calls share one HTTP/2 connection
    let mut sender = h2_client(addr, &identity).await;
    let (a, _, _) = call(&mut sender, "a", &[]).await;
    let (b, _, _) = call(&mut sender, "b", &[]).await;

    assert_eq!(a, b"alpha");
    assert_eq!(b, b"beta");
}

#[tokio::test]
async fn test_unknown_path_is_unimplemented() {
    let identity = identity();
    let dst = echo_server().await;
    let routes = RouteTable::parse(&format!("known/{dst}")).unwrap();
    let addr = start_endpoint(
        EndpointMode::MultiplexedTunnel(routes),
        "tlsmux.Tunnel",
        policy(&identity),
        RecordingSink::new(),
    )
    .await;

    let mut sender = h2_client(addr, &identity).await;
    let (payload, headers, trailers) = call(&mut sender, "tlsmux.Tunnel", &[b"nobody home"]).await;

    assert!(payload.is_empty());
    assert_eq!(grpc_status(&headers, trailers.as_ref()).as_deref(), Some("12"));
}

#[tokio::test]
async fn test_tunnel_rejects_tls12() {
    let identity = identity();
    let sink = RecordingSink::new();
    let dst = echo_server().await;
    let addr = start_endpoint(
        EndpointMode::MultiplexedTunnel(RouteTable::parse(&dst).unwrap()),
        "tlsmux.Tunnel",
        policy(&identity),
        sink.clone(),
    )
    .await;

    let tls12 = connector(&identity, &[&rustls::version::TLS12], &[b"h2"]);
    assert!(connect(addr, &tls12).await.is_err());

    let errors = wait_for_connection_error(&sink).await;
    assert!(errors[0].starts_with("unsafe tls version"), "{}", errors[0]);
}

#[tokio::test]
async fn test_handler_failure_ends_call_with_error_status() {
    let identity = identity();
    let sink = RecordingSink::new();
    let dst = unreachable_destination().await;
    let addr = start_endpoint(
        EndpointMode::MultiplexedTunnel(RouteTable::parse(&dst).unwrap()),
        "tlsmux.Tunnel",
        policy(&identity),
        sink.clone(),
    )
    .await;

    let mut sender = h2_client(addr, &identity).await;
    let (payload, headers, trailers) = call(&mut sender, "tlsmux.Tunnel", &[b"hello"]).await;

    assert!(payload.is_empty());
    // UNAVAILABLE
    assert_eq!(grpc_status(&headers, trailers.as_ref()).as_deref(), Some("14"));
    let errors = wait_for_connection_error(&sink).await;
    assert!(errors[0].contains(&dst), "{}", errors[0]);
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let identity = identity();
    let dst = echo_server().await;
    let settings = TunnelSettings {
        max_connection_idle: Duration::from_millis(300),
        ..TunnelSettings::default()
    };
    let addr = start_endpoint_with(
        EndpointMode::MultiplexedTunnel(RouteTable::parse(&dst).unwrap()),
        "tlsmux.Tunnel",
        policy(&identity),
        RecordingSink::new(),
        settings,
    )
    .await;

    let (mut sender, connection) = h2_connect(addr, &identity).await;
    // A finished call restarts the idle clock but does not keep the connection
    let (echoed, _, _) = call(&mut sender, "tlsmux.Tunnel", &[b"once"]).await;
    assert_eq!(echoed, b"once");

    tokio::time::timeout(Duration::from_secs(5), connection)
        .await
        .expect("idle connection was not closed")
        .unwrap()
        .ok();
    assert!(sender.is_closed());
}
