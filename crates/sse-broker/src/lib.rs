//! Bidirectional client connections on top of HTTP and server-sent events.
//!
//! Client-to-server messages arrive over regular POST requests; server-to-
//! client messages are pushed over a long-lived event stream. The [`Broker`]
//! owns every connection in the process and exposes two axum routes, mounted
//! under a configurable prefix by the embedding service:
//!
//! 1. `POST {prefix}/command` for client-sent messages
//! 2. `GET {prefix}/events/{id}` for the server-sent event stream

pub mod broker;
pub mod error;
pub mod http;
pub mod ids;

pub use broker::{Broker, EventEnvelope};
pub use error::ConnError;
pub use http::routes;
pub use ids::{ClientId, ClientSecret};
