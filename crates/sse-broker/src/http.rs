//! HTTP surface of the broker: the command endpoint and the event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::broker::{Broker, EventEnvelope, KEEP_ALIVE_EVENT, KEEP_ALIVE_INTERVAL};
use crate::error::ConnError;
use crate::ids::{ClientId, ClientSecret};

/// The broker's routes, to be nested under its URL prefix.
pub fn routes(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/command", post(command))
        .route("/events/:id", get(events))
        .with_state(broker)
}

/// Transport-level command, discriminated by the `name` field.
#[derive(Deserialize)]
#[serde(tag = "name", rename_all = "lowercase", rename_all_fields = "camelCase")]
enum CommandRequest {
    Hello {
        client_id: String,
        secret: String,
    },
    Data {
        client_id: String,
        secret: String,
        #[serde(default)]
        payload: Value,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelloResponse {
    events_url: String,
}

#[derive(Serialize)]
struct DataResponse {}

async fn command(State(broker): State<Arc<Broker>>, body: Bytes) -> Response {
    match handle_command(&broker, &body).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn handle_command(broker: &Broker, body: &[u8]) -> Result<Response, ConnError> {
    let request: CommandRequest =
        serde_json::from_slice(body).map_err(|_| ConnError::InvalidRequest)?;

    match request {
        CommandRequest::Hello { client_id, secret } => {
            let client_id: ClientId = client_id.parse()?;
            let secret: ClientSecret = secret.parse()?;
            let events_url = broker.hello(client_id, secret).await?;
            debug!(client_id = %client_id, "client handshake complete");
            Ok(Json(HelloResponse { events_url }).into_response())
        }
        CommandRequest::Data {
            client_id,
            secret,
            payload,
        } => {
            let client_id: ClientId = client_id.parse()?;
            let secret: ClientSecret = secret.parse()?;
            broker.dispatch_data(client_id, secret, payload).await?;
            Ok(Json(DataResponse {}).into_response())
        }
    }
}

async fn events(State(broker): State<Arc<Broker>>, Path(id): Path<String>) -> Response {
    let client_id: ClientId = match id.parse() {
        Ok(client_id) => client_id,
        Err(err) => return error_response(&err),
    };

    let event_rx = match broker.open_events(client_id).await {
        Ok(event_rx) => event_rx,
        Err(err) => return error_response(&err),
    };

    let (frame_tx, frame_rx) = mpsc::channel::<Result<Bytes, Infallible>>(8);
    tokio::spawn(drain_events(broker, client_id, event_rx, frame_tx));

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        Body::from_stream(ReceiverStream::new(frame_rx)),
    )
        .into_response()
}

/// Drains a connection's event queue into the wire framing. Ends when the
/// client disconnects (pausing the connection) or the broker closes the
/// queue.
async fn drain_events(
    broker: Arc<Broker>,
    client_id: ClientId,
    mut event_rx: mpsc::Receiver<EventEnvelope>,
    frame_tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    if frame_tx
        .send(Ok(Bytes::from_static(b": Beginning of the event stream\n\n")))
        .await
        .is_err()
    {
        broker.pause(client_id, event_rx).await;
        return;
    }

    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL,
        KEEP_ALIVE_INTERVAL,
    );
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let envelope = tokio::select! {
            maybe = event_rx.recv() => match maybe {
                Some(envelope) => envelope,
                // Queue closed: the broker dropped the connection.
                None => return,
            },
            _ = keep_alive.tick() => EventEnvelope {
                event: KEEP_ALIVE_EVENT.to_owned(),
                payload: None,
            },
            () = frame_tx.closed() => {
                broker.pause(client_id, event_rx).await;
                return;
            }
        };

        let json = match serde_json::to_vec(&envelope) {
            Ok(json) => json,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "error encoding event, pausing stream");
                broker.pause(client_id, event_rx).await;
                return;
            }
        };

        let mut frame = Vec::with_capacity(json.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&json);
        frame.extend_from_slice(b"\n\n");

        if frame_tx.send(Ok(Bytes::from(frame))).await.is_err() {
            broker.pause(client_id, event_rx).await;
            return;
        }
    }
}

fn error_response(err: &ConnError) -> Response {
    match err {
        ConnError::InvalidRequest
        | ConnError::InvalidClientId
        | ConnError::InvalidClientSecret
        | ConnError::UnknownClient
        | ConnError::InvalidConnectionState => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        ConnError::EventBufferFull | ConnError::ConnectionExists | ConnError::InvalidPayload => {
            warn!(error = %err, "internal error serving connection request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_owned(),
            )
                .into_response()
        }
    }
}
