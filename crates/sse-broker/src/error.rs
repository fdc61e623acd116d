use thiserror::Error;

/// Connection-layer failures.
///
/// The first five variants describe requests the client got wrong and map to
/// HTTP 400; the remainder are internal conditions and map to 500 when they
/// surface over HTTP at all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnError {
    #[error("invalid request")]
    InvalidRequest,
    #[error("invalid client ID")]
    InvalidClientId,
    #[error("invalid client secret")]
    InvalidClientSecret,
    #[error("unknown client")]
    UnknownClient,
    #[error("invalid connection state")]
    InvalidConnectionState,
    #[error("event buffer full")]
    EventBufferFull,
    #[error("connection already exists")]
    ConnectionExists,
    #[error("unencodable event payload")]
    InvalidPayload,
}
