//! Authenticated peer-to-peer message transport.
//!
//! Layers reliable-attempt messaging on top of byte streams opened through
//! a pluggable dialer. Every connection runs an identity handshake before
//! it carries traffic; every send is tracked as an attempt that resolves
//! exactly once as acknowledged, failed, or timed out. A fixed pool of
//! workers polls all sockets with non-blocking reads, and a single shared
//! timer drives timeout detection.
//!
//! The [`endpoint::Endpoint`] is the entry point: start it with a
//! [`config::NetConfig`], key material, and a peer directory, register the
//! receive and delivery listeners, then send.

pub mod acceptor;
pub mod auth;
pub mod channel;
pub mod config;
pub mod dialer;
pub mod directory;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod packet;
pub mod pool;
pub mod waker;

pub use acceptor::Acceptor;
pub use auth::{AuthEvent, Authenticator, AuthenticatorFactory, HandshakeProof, HandshakeSide};
pub use channel::{AuthProgress, ChannelState, MessageChannel};
pub use config::{AssignPolicy, AuthStrategy, NetConfig};
pub use dialer::{Dialer, SharedDialer, TcpDialer};
pub use directory::{PeerAddress, PeerDirectory};
pub use dispatcher::{DeliveryListener, Dispatcher};
pub use endpoint::Endpoint;
pub use error::{NetError, NetResult};
pub use manager::ConnectionManager;
pub use packet::{Packet, PacketDecoder, PacketKind};
pub use pool::{Origin, PacketHooks, ReceiveHook, ReceiveListener, WorkerPool};
pub use waker::Waker;

pub use veil_crypto::{derive_identifier, IdentityKey};
pub use veil_types::{DeliveryOutcome, Identifier, IdentifierError};
