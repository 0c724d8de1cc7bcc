//! Transport-specific error types.

use std::io;
use thiserror::Error;
use veil_types::Identifier;

pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur while establishing channels or sending messages.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket to the destination could not be opened.
    #[error("failed to connect to peer {destination}: {source}")]
    ConnectionFailed {
        destination: Identifier,
        #[source]
        source: io::Error,
    },

    /// Handshake rejected, or the peer disconnected mid-handshake.
    #[error("authentication with peer failed: {0}")]
    AuthenticationFailed(String),

    /// Channel creation ran and concluded without a usable channel.
    #[error("channel to {destination} could not be established: {reason}")]
    EstablishFailed {
        destination: Identifier,
        reason: String,
    },

    /// Channel closed before or while writing.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// A bounded wait (connect, handshake) expired.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Destination has no known address.
    #[error("peer {0} not found in directory")]
    PeerUnknown(Identifier),

    /// Listener bind failed.
    #[error("failed to bind listener on {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Packet encoding/decoding error.
    #[error("packet codec error: {0}")]
    CodecError(String),

    /// Channel is closed and cannot carry traffic.
    #[error("channel to peer is closed")]
    ChannelClosed,

    /// The endpoint is shut down.
    #[error("endpoint is shut down")]
    Shutdown,
}
