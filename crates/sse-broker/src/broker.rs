//! Connection table and event routing.
//!
//! One [`Broker`] owns every client connection in the process. Inbound
//! payloads are fanned out to registered listener sinks; outbound events are
//! queued per client and drained by the event-stream handler. A client whose
//! stream drops is kept paused with its queue intact until it resumes or the
//! reaper gives up on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ConnError;
use crate::ids::{ClientId, ClientSecret};

/// Capacity of a connection's outbound event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 128;
/// Capacity of inbound and new-connection listener channels. Delivery is
/// lossy: a listener that is not draining misses payloads.
const LISTENER_QUEUE_CAPACITY: usize = 32;
/// How long a paused connection survives before the reaper closes it.
const PAUSED_TTL: Duration = Duration::from_secs(3 * 60);
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const KEEP_ALIVE_EVENT: &str = "keep-alive";

/// A single server-to-client event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

enum ConnectionState {
    /// Hello received, event stream not yet open.
    HandshakeDone,
    /// Event stream currently drained by a request handler.
    Streaming,
    /// Stream was open and the downstream side went away; the connection
    /// waits for resumption until the reaper claims it.
    Paused { paused_at: Instant },
}

struct Connection {
    state: ConnectionState,
    secret: ClientSecret,
    event_tx: mpsc::Sender<EventEnvelope>,
    /// Present unless an events request currently owns the drain side.
    event_rx: Option<mpsc::Receiver<EventEnvelope>>,
    listeners: Vec<mpsc::Sender<Value>>,
}

#[derive(Default)]
struct BrokerTable {
    connections: HashMap<ClientId, Connection>,
    connection_listeners: Vec<mpsc::Sender<ClientId>>,
}

impl BrokerTable {
    /// Dropping the entry drops its event sender and listener senders, which
    /// ends the drain loop and closes every inbound sink.
    fn remove_connection(&mut self, client_id: ClientId) -> bool {
        self.connections.remove(&client_id).is_some()
    }
}

/// Owns the connection table; see the module docs.
pub struct Broker {
    prefix: String,
    table: RwLock<BrokerTable>,
}

impl Broker {
    /// `prefix` is the URL prefix under which [`crate::routes`] is mounted;
    /// it is normalized to start and end with `/`.
    pub fn new(prefix: &str) -> Arc<Self> {
        let mut prefix = prefix.to_owned();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        Arc::new(Self {
            prefix,
            table: RwLock::new(BrokerTable::default()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a listener notified of every newly handshaked client.
    /// Notifications are lossy wake-ups, not a reliable log.
    pub async fn listen_connections(&self) -> mpsc::Receiver<ClientId> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        self.table.write().await.connection_listeners.push(tx);
        rx
    }

    /// Registers an inbound payload sink for one client. The channel closes
    /// when the connection does.
    pub async fn listen(&self, client_id: ClientId) -> Result<mpsc::Receiver<Value>, ConnError> {
        let mut table = self.table.write().await;
        let conn = table
            .connections
            .get_mut(&client_id)
            .ok_or(ConnError::UnknownClient)?;

        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        conn.listeners.push(tx);
        Ok(rx)
    }

    /// Queues an event for a client without blocking. A full queue rejects
    /// the event and leaves the connection untouched.
    pub async fn send<T: Serialize>(
        &self,
        client_id: ClientId,
        event: &str,
        payload: T,
    ) -> Result<(), ConnError> {
        let envelope = EventEnvelope {
            event: event.to_owned(),
            payload: Some(serde_json::to_value(payload).map_err(|_| ConnError::InvalidPayload)?),
        };

        let table = self.table.read().await;
        let conn = table
            .connections
            .get(&client_id)
            .ok_or(ConnError::UnknownClient)?;

        conn.event_tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ConnError::EventBufferFull,
            mpsc::error::TrySendError::Closed(_) => ConnError::UnknownClient,
        })
    }

    /// Handshake: replaces any previous connection opened with the same
    /// secret, registers the new one and wakes connection listeners up.
    /// Returns the events URL the client must open next.
    pub async fn hello(
        &self,
        client_id: ClientId,
        secret: ClientSecret,
    ) -> Result<String, ConnError> {
        let mut table = self.table.write().await;

        if table
            .connections
            .get(&client_id)
            .is_some_and(|conn| conn.secret == secret)
        {
            table.remove_connection(client_id);
            info!(client_id = %client_id, "replaced connection on new hello");
        }

        // Same ID under a different secret: refuse to take the entry over.
        if table.connections.contains_key(&client_id) {
            return Err(ConnError::ConnectionExists);
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        table.connections.insert(
            client_id,
            Connection {
                state: ConnectionState::HandshakeDone,
                secret,
                event_tx,
                event_rx: Some(event_rx),
                listeners: Vec::new(),
            },
        );

        table
            .connection_listeners
            .retain(|listener| match listener.try_send(client_id) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("connection listener lagging behind, dropping notification");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });

        Ok(format!("{}events/{}", self.prefix, client_id))
    }

    /// Fans an inbound payload out to every listener registered for the
    /// client. Listeners that are not draining miss the payload.
    pub async fn dispatch_data(
        &self,
        client_id: ClientId,
        secret: ClientSecret,
        payload: Value,
    ) -> Result<(), ConnError> {
        let table = self.table.read().await;
        let conn = table
            .connections
            .get(&client_id)
            .ok_or(ConnError::UnknownClient)?;
        if conn.secret != secret {
            return Err(ConnError::InvalidClientSecret);
        }

        for listener in &conn.listeners {
            if listener.try_send(payload.clone()).is_err() {
                warn!(client_id = %client_id, "listener lagging behind, dropping data");
            }
        }

        Ok(())
    }

    /// Closes a connection: removes it from the table, which ends its
    /// inbound sinks and outbound queue.
    pub async fn close(&self, client_id: ClientId) -> Result<(), ConnError> {
        let mut table = self.table.write().await;
        if table.remove_connection(client_id) {
            Ok(())
        } else {
            Err(ConnError::UnknownClient)
        }
    }

    /// Claims the outbound queue for an events request. Allowed from the
    /// handshake-done and paused states only.
    pub async fn open_events(
        &self,
        client_id: ClientId,
    ) -> Result<mpsc::Receiver<EventEnvelope>, ConnError> {
        let mut table = self.table.write().await;
        let conn = table
            .connections
            .get_mut(&client_id)
            .ok_or(ConnError::UnknownClient)?;

        match conn.state {
            ConnectionState::HandshakeDone | ConnectionState::Paused { .. } => {}
            ConnectionState::Streaming => return Err(ConnError::InvalidConnectionState),
        }

        let rx = conn
            .event_rx
            .take()
            .ok_or(ConnError::InvalidConnectionState)?;
        conn.state = ConnectionState::Streaming;
        Ok(rx)
    }

    /// Hands the outbound queue back after the downstream side went away.
    /// Queued events are kept for resumption.
    pub(crate) async fn pause(&self, client_id: ClientId, event_rx: mpsc::Receiver<EventEnvelope>) {
        // A closed queue belongs to a connection that was since removed; the
        // table entry, if any, is a replacement that must not be touched.
        if event_rx.is_closed() {
            return;
        }

        let mut table = self.table.write().await;
        match table.connections.get_mut(&client_id) {
            Some(conn) if matches!(conn.state, ConnectionState::Streaming) => {
                conn.state = ConnectionState::Paused {
                    paused_at: Instant::now(),
                };
                conn.event_rx = Some(event_rx);
                debug!(client_id = %client_id, "event stream paused");
            }
            // Closed or replaced concurrently; nothing to resume.
            _ => {}
        }
    }

    /// Spawns the background task that closes connections left paused for
    /// longer than the TTL.
    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broker.reap_expired().await;
            }
        })
    }

    async fn reap_expired(&self) {
        let mut table = self.table.write().await;
        let expired: Vec<ClientId> = table
            .connections
            .iter()
            .filter_map(|(client_id, conn)| match conn.state {
                ConnectionState::Paused { paused_at } if paused_at.elapsed() >= PAUSED_TTL => {
                    Some(*client_id)
                }
                _ => None,
            })
            .collect();

        for client_id in expired {
            info!(client_id = %client_id, "reaping abandoned connection");
            table.remove_connection(client_id);
        }
    }
}
