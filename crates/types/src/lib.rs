//! Shared vocabulary types for the veil transport.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const IDENTIFIER_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum IdentifierError {
    #[error("invalid identifier length: expected {IDENTIFIER_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid identifier hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Stable name of a peer, derived from its public identity.
///
/// Identifiers key the channel table and never change for a given peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier([u8; IDENTIFIER_LEN]);

impl Identifier {
    pub fn from_bytes(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Identifier(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentifierError> {
        let raw = hex::decode(s)?;
        let bytes: [u8; IDENTIFIER_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| IdentifierError::InvalidLength(raw.len()))?;
        Ok(Identifier(bytes))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; full hex via Display.
        write!(f, "Identifier({}..)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Identifier::from_hex(s)
    }
}

/// Terminal resolution of one send attempt. Every attempt resolves to
/// exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    Acknowledged,
    Failed(String),
    TimedOut,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Acknowledged => write!(f, "acknowledged"),
            DeliveryOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            DeliveryOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}
