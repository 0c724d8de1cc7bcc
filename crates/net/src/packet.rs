//! Wire format and resumable packet decoding.
//!
//! Packets are sent as length-prefixed frames:
//! ```text
//! +-----------------------------------+
//! | length (4 bytes, big-endian)      |
//! +-----------------------------------+
//! | kind (1 byte)                     |
//! +-----------------------------------+
//! | attempt id (8 bytes, big-endian)  |
//! +-----------------------------------+
//! | payload (opaque bytes)            |
//! +-----------------------------------+
//! ```
//!
//! The length covers everything after the prefix, so a frame is
//! self-delimiting and the decoder can resume across partial reads. The
//! attempt id correlates a `Data` packet with the `Ack` it earns; handshake
//! traffic carries id 0.

use bytes::BytesMut;

use super::error::{NetError, NetResult};

/// Bytes of header inside every frame: kind + attempt id.
const HEADER_LEN: u32 = 9;

/// Distinguishes control traffic from application data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Application payload, acked by the receiver.
    Data,
    /// Acknowledgment of a previously sent `Data` packet.
    Ack,
    /// Authentication handshake traffic.
    Handshake,
}

impl PacketKind {
    fn as_byte(self) -> u8 {
        match self {
            PacketKind::Data => 0,
            PacketKind::Ack => 1,
            PacketKind::Handshake => 2,
        }
    }

    fn from_byte(byte: u8) -> NetResult<Self> {
        match byte {
            0 => Ok(PacketKind::Data),
            1 => Ok(PacketKind::Ack),
            2 => Ok(PacketKind::Handshake),
            other => Err(NetError::CodecError(format!(
                "unknown packet kind: {other:#04x}"
            ))),
        }
    }
}

/// Atomic wire unit. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub attempt_id: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn data(attempt_id: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            attempt_id,
            payload,
        }
    }

    pub fn ack(attempt_id: u64) -> Self {
        Self {
            kind: PacketKind::Ack,
            attempt_id,
            payload: Vec::new(),
        }
    }

    pub fn handshake(payload: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Handshake,
            attempt_id: 0,
            payload,
        }
    }

    /// Encode to a length-prefixed frame.
    pub fn encode(&self, max_size: u32) -> NetResult<Vec<u8>> {
        let frame_len = HEADER_LEN as usize + self.payload.len();
        if frame_len > max_size as usize {
            return Err(NetError::CodecError(format!(
                "packet too large: {} bytes (max {})",
                frame_len, max_size
            )));
        }

        let mut buf = Vec::with_capacity(4 + frame_len);
        buf.extend_from_slice(&(frame_len as u32).to_be_bytes());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&self.attempt_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Incremental frame decoder, one per origin.
///
/// Bytes arrive in arbitrary chunks from the polling worker; a packet may
/// span several polls and one poll may carry several packets. `feed` never
/// fails; framing violations surface on `next_packet`.
pub struct PacketDecoder {
    buf: BytesMut,
    max_size: u32,
}

impl PacketDecoder {
    pub fn new(max_size: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_size,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete packet, or `None` if more bytes are needed.
    pub fn next_packet(&mut self) -> NetResult<Option<Packet>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[..4]);
        let frame_len = u32::from_be_bytes(len_bytes);

        if frame_len > self.max_size {
            return Err(NetError::CodecError(format!(
                "incoming packet too large: {} bytes (max {})",
                frame_len, self.max_size
            )));
        }
        if frame_len < HEADER_LEN {
            return Err(NetError::CodecError(format!(
                "frame shorter than header: {} bytes",
                frame_len
            )));
        }
        if self.buf.len() < 4 + frame_len as usize {
            return Ok(None);
        }

        let _ = self.buf.split_to(4);
        let frame = self.buf.split_to(frame_len as usize);

        let kind = PacketKind::from_byte(frame[0])?;
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&frame[1..9]);
        let attempt_id = u64::from_be_bytes(id_bytes);

        Ok(Some(Packet {
            kind,
            attempt_id,
            payload: frame[9..].to_vec(),
        }))
    }
}
