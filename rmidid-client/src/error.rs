//! Client error types.

use rmidid_session::SessionError;
use thiserror::Error;

/// Errors surfaced by the connection driver's operations. Failures of a
/// running connection are reported through the `disconnected` signal
/// instead.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("no endpoints to connect to")]
    NoEndpoints,

    #[error("sockets are not an even/odd pair: control {control}, data {data}")]
    BadPortPair { control: u16, data: u16 },

    #[error("client is shut down")]
    Closed,
}
