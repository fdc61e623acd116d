//! Integration tests for the HTTP surface: handshake, event-stream framing,
//! keep-alives, inbound fan-out and the error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Request, StatusCode};
use futures_util::StreamExt;
use serde_json::{json, Value};
use sse_broker::{routes, Broker, ClientId, ClientSecret, EventEnvelope};
use tower::ServiceExt;

const CLIENT_ID: &str = "VHUFS_CXZf1rn4IFPRY7fA";
const CLIENT_SECRET: &str = "R0sxpQUrf7Yc2_uqbQi6E_YJUXUbKqXM-v7dm_m9qe-LuEAtR-ST9IUvwn31_dgSFMeJf51XVhZA-1XhytCnjg==";

async fn post_command(broker: &Arc<Broker>, body: Value) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method("POST")
        .uri("/command")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build");

    let response = routes(Arc::clone(broker))
        .oneshot(request)
        .await
        .expect("command request should be served");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    (status, body.to_vec())
}

async fn post_hello(broker: &Arc<Broker>, client_id: &str, secret: &str) -> (StatusCode, Value) {
    let (status, body) = post_command(
        broker,
        json!({"name": "hello", "clientId": client_id, "secret": secret}),
    )
    .await;
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, body)
}

async fn get_events(broker: &Arc<Broker>, events_url: &str) -> (StatusCode, BodyDataStream) {
    let request = Request::builder()
        .method("GET")
        .uri(events_url)
        .body(Body::empty())
        .expect("request should build");

    let response = routes(Arc::clone(broker))
        .oneshot(request)
        .await
        .expect("events request should be served");
    let status = response.status();
    if status == StatusCode::OK {
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .expect("content type"),
            "text/event-stream"
        );
        assert_eq!(
            response
                .headers()
                .get(header::CACHE_CONTROL)
                .expect("cache control"),
            "no-cache, no-transform"
        );
    }
    (status, response.into_body().into_data_stream())
}

async fn next_frame(stream: &mut BodyDataStream) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(30), stream.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended unexpectedly")
        .expect("stream error");
    String::from_utf8(frame.to_vec()).expect("frame should be UTF-8")
}

#[tokio::test(start_paused = true)]
async fn handshake_then_stream_delivers_preamble_keepalive_and_events() {
    let broker = Broker::new("/api/");

    let (status, hello) = post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hello["eventsUrl"], format!("/api/events/{CLIENT_ID}"));

    // The router is mounted at the prefix root in these tests.
    let (status, mut stream) = get_events(&broker, &format!("/events/{CLIENT_ID}")).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(
        next_frame(&mut stream).await,
        ": Beginning of the event stream\n\n"
    );

    // The keep-alive arrives after the interval elapses (auto-advanced).
    assert_eq!(
        next_frame(&mut stream).await,
        "data: {\"event\":\"keep-alive\"}\n\n"
    );

    let client_id: ClientId = CLIENT_ID.parse().expect("client id");
    broker
        .send(client_id, "test", json!({"test": 42}))
        .await
        .expect("send");
    let frame = next_frame(&mut stream).await;
    let envelope: EventEnvelope = serde_json::from_str(
        frame
            .strip_prefix("data: ")
            .and_then(|frame| frame.strip_suffix("\n\n"))
            .expect("data framing"),
    )
    .expect("envelope should parse");
    assert_eq!(envelope.event, "test");
    assert_eq!(envelope.payload, Some(json!({"test": 42})));
}

#[tokio::test]
async fn data_command_fans_payload_out_to_listeners() {
    let broker = Broker::new("/api/");
    let (status, _) = post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;
    assert_eq!(status, StatusCode::OK);

    let client_id: ClientId = CLIENT_ID.parse().expect("client id");
    let mut sink = broker.listen(client_id).await.expect("listen");

    let (status, body) = post_command(
        &broker,
        json!({
            "name": "data",
            "clientId": CLIENT_ID,
            "secret": CLIENT_SECRET,
            "payload": {"hello": "world"},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"{}");

    assert_eq!(sink.recv().await, Some(json!({"hello": "world"})));
}

#[tokio::test]
async fn command_endpoint_rejects_malformed_requests() {
    let broker = Broker::new("/api/");

    let request = Request::builder()
        .method("POST")
        .uri("/command")
        .body(Body::from("{not json"))
        .expect("request should build");
    let response = routes(Arc::clone(&broker))
        .oneshot(request)
        .await
        .expect("served");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let (status, _) = post_command(
        &broker,
        json!({"name": "bogus", "clientId": CLIENT_ID, "secret": CLIENT_SECRET}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post_hello(&broker, "tooshort", CLIENT_SECRET).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, Value::Null);

    let (status, _) = post_hello(&broker, CLIENT_ID, "tooshort").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn data_command_requires_known_client_and_matching_secret() {
    let broker = Broker::new("/api/");

    let (status, _) = post_command(
        &broker,
        json!({"name": "data", "clientId": CLIENT_ID, "secret": CLIENT_SECRET, "payload": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;
    let wrong_secret = ClientSecret::random().encode();
    let (status, body) = post_command(
        &broker,
        json!({"name": "data", "clientId": CLIENT_ID, "secret": wrong_secret, "payload": 1}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"invalid client secret");
}

#[tokio::test]
async fn events_endpoint_rejects_unknown_and_already_streaming_clients() {
    let broker = Broker::new("/api/");

    let (status, _) = get_events(&broker, &format!("/events/{}", ClientId::random())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;
    let (status, _stream) = get_events(&broker, &format!("/events/{CLIENT_ID}")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = get_events(&broker, &format!("/events/{CLIENT_ID}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_pauses_connection_and_keeps_events() {
    let broker = Broker::new("/api/");
    post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;
    let client_id: ClientId = CLIENT_ID.parse().expect("client id");

    let (status, mut stream) = get_events(&broker, &format!("/events/{CLIENT_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        next_frame(&mut stream).await,
        ": Beginning of the event stream\n\n"
    );

    // Downstream goes away; the drain task must hand the queue back.
    drop(stream);
    tokio::time::sleep(Duration::from_millis(10)).await;

    broker
        .send(client_id, "while-paused", json!(1))
        .await
        .expect("send to paused connection");

    let (status, mut stream) = get_events(&broker, &format!("/events/{CLIENT_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        next_frame(&mut stream).await,
        ": Beginning of the event stream\n\n"
    );
    let frame = next_frame(&mut stream).await;
    assert!(
        frame.contains("\"event\":\"while-paused\""),
        "expected the queued event, got {frame:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn replacing_hello_ends_the_previous_stream() {
    let broker = Broker::new("/api/");
    post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;

    let (status, mut stream) = get_events(&broker, &format!("/events/{CLIENT_ID}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        next_frame(&mut stream).await,
        ": Beginning of the event stream\n\n"
    );

    let (status, _) = post_hello(&broker, CLIENT_ID, CLIENT_SECRET).await;
    assert_eq!(status, StatusCode::OK);

    // The old connection's queue was closed, which ends its body stream.
    let ended = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream should end promptly");
    assert!(ended.is_none(), "expected end of stream, got {ended:?}");
}
