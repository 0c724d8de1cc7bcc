//! Configuration surface consumed by the transport.
//!
//! The embedder owns loading (files, env, flags); this crate only consumes
//! the resulting values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Address the acceptor binds to.
    pub listen_addr: String,
    /// Number of receive workers in the fixed pool.
    pub worker_count: usize,
    /// Sleep between poll rounds, in milliseconds.
    pub poll_interval_ms: u64,
    /// Default per-attempt timeout, in milliseconds.
    pub default_timeout_ms: u64,
    /// Socket connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Bound on the whole handshake, in seconds.
    pub handshake_timeout_secs: u64,
    /// Accepted age of an identity proof, in seconds.
    pub proof_freshness_secs: u64,
    /// Maximum encoded packet size in bytes.
    pub max_packet_size: u32,
    /// How new origins are assigned to workers.
    pub assign_policy: AssignPolicy,
    /// Handshake strategy run on every new channel.
    pub auth_strategy: AuthStrategy,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4020".to_string(),
            worker_count: 2,
            poll_interval_ms: 50,
            default_timeout_ms: 10_000,
            connect_timeout_secs: 5,
            handshake_timeout_secs: 10,
            proof_freshness_secs: 120,
            max_packet_size: 16 * 1024 * 1024,
            assign_policy: AssignPolicy::LeastLoaded,
            auth_strategy: AuthStrategy::Proof,
        }
    }
}

impl NetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn proof_freshness(&self) -> Duration {
        Duration::from_secs(self.proof_freshness_secs)
    }
}

/// Origin assignment policy. Both variants are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignPolicy {
    /// Pick the worker with the fewest live origins, lowest index on ties.
    LeastLoaded,
    /// Cycle through workers in index order.
    RoundRobin,
}

impl std::fmt::Display for AssignPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeastLoaded => write!(f, "least-loaded"),
            Self::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// Handshake strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStrategy {
    /// Signed identity proof, verified before the channel opens.
    Proof,
    /// Unverified hello. Trusted or local deployments only.
    Dummy,
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proof => write!(f, "proof"),
            Self::Dummy => write!(f, "dummy"),
        }
    }
}
