//! Packet structure and wire format.
//!
//! Every frame starts with a one-byte header and a hop count, followed by
//! the optional transport address, the destination hash, and the payload:
//!
//! ```text
//! +--------+------+---------------------+---------------------+----------+
//! | header | hops | transport_id (8)    | destination (8)     | payload  |
//! | 1 byte | 1 B  | iff header bit 7    | all types EXCEPT    | 0..=235  |
//! |        |      |                     | announce            |          |
//! +--------+------+---------------------+---------------------+----------+
//! ```
//!
//! Announce frames omit the destination; the receiver derives it from the
//! public key carried in the payload (see [`crate::destination`]). Header
//! layout:
//!
//! ```text
//! bit 7    bit 3      bits 0-2
//! transport keep-path  packet type (Data=0 Announce=1 Reply=2 ReplySigned=3)
//! ```
//!
//! An announce payload is `pub_key(32) | timestamp(4 LE) | random(4) |
//! signature(64) | app_data(0..=32)`; the 8 bytes at offset 32 form the
//! rand blob that identifies one announce instance. A signed reply payload
//! is `signature(64) | reply_data`.

use serde::{Deserialize, Serialize};

use crate::crypto::sha256_trunc8;
use crate::destination::Destination;
use crate::traits::{MeshError, MeshResult};

/// Truncated hash identifying one packet. Replies are addressed to the
/// hash of the datagram they answer.
pub type PacketHash = [u8; 8];

/// Largest application data an announce can carry.
pub const MAX_APP_DATA: usize = 32;

/// Shortest valid announce payload: pub_key + rand blob + signature.
pub const ANNOUNCE_MIN_LEN: usize = 104;

/// Packet types carried in the low header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Data = 0,
    Announce = 1,
    Reply = 2,
    ReplySigned = 3,
}

impl PacketType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Announce),
            2 => Some(PacketType::Reply),
            3 => Some(PacketType::ReplySigned),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// The first wire byte: type in the low bits, option flags above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Header(u8);

impl Header {
    const TYPE_MASK: u8 = 0x07;
    const KEEP_PATH: u8 = 0x08;
    const HAS_TRANSPORT: u8 = 0x80;

    pub fn new(ptype: PacketType) -> Self {
        Self(ptype.bits())
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Just the type bits, as hashed into the packet hash.
    pub fn type_bits(&self) -> u8 {
        self.0 & Self::TYPE_MASK
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_bits(self.type_bits())
    }

    /// Keep-path: the sender wants a reply, and relays on the way should
    /// remember the reverse hop.
    pub fn keep_path(&self) -> bool {
        self.0 & Self::KEEP_PATH != 0
    }

    pub fn set_keep_path(&mut self, keep: bool) {
        if keep {
            self.0 |= Self::KEEP_PATH;
        } else {
            self.0 &= !Self::KEEP_PATH;
        }
    }

    pub fn has_transport(&self) -> bool {
        self.0 & Self::HAS_TRANSPORT != 0
    }

    pub fn set_has_transport(&mut self, has: bool) {
        if has {
            self.0 |= Self::HAS_TRANSPORT;
        } else {
            self.0 &= !Self::HAS_TRANSPORT;
        }
    }
}

/// Borrowed view of an announce payload.
#[derive(Debug)]
pub struct AnnounceView<'a> {
    pub pub_key: &'a [u8; 32],
    /// Announce creation time, epoch seconds.
    pub timestamp: u32,
    /// Timestamp plus random bytes; unique per announce instance.
    pub rand_blob: &'a [u8; 8],
    pub signature: &'a [u8; 64],
    pub app_data: &'a [u8],
}

/// One mesh packet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Packet {
    pub header: Header,
    pub hops: u8,
    pub destination: Destination,
    /// Zeroed whenever the has-transport flag is clear, so plain equality
    /// comparisons stay meaningful.
    pub transport_id: Destination,
    payload: Vec<u8>,
}

impl Packet {
    /// Largest payload a frame can carry.
    pub const MAX_PAYLOAD: usize = 235;
    /// Largest wire frame, including the optional simulated-sender byte.
    pub const MAX_WIRE: usize = 255;

    pub fn new(ptype: PacketType) -> Self {
        Self {
            header: Header::new(ptype),
            ..Self::default()
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.header.packet_type()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: &[u8]) -> MeshResult<()> {
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(MeshError::PayloadTooLarge {
                len: payload.len(),
                max: Self::MAX_PAYLOAD,
            });
        }
        self.payload.clear();
        self.payload.extend_from_slice(payload);
        Ok(())
    }

    /// Set the transport address and its header flag together.
    pub fn set_transport(&mut self, transport: Destination) {
        self.transport_id = transport;
        self.header.set_has_transport(true);
    }

    /// Clear the transport address and its header flag together.
    pub fn clear_transport(&mut self) {
        self.transport_id = Destination::UNSET;
        self.header.set_has_transport(false);
    }

    /// Reset for pool reuse, keeping the payload allocation.
    pub fn reset(&mut self) {
        self.header = Header::default();
        self.hops = 0;
        self.destination = Destination::UNSET;
        self.transport_id = Destination::UNSET;
        self.payload.clear();
    }

    /// Truncated SHA-256 over the type bits, destination and payload.
    ///
    /// Flags, hops and the transport address change in flight and are
    /// excluded, so the hash survives forwarding.
    pub fn packet_hash(&self) -> PacketHash {
        sha256_trunc8(&[
            &[self.header.type_bits()],
            self.destination.as_bytes(),
            &self.payload,
        ])
    }

    /// Parse the announce payload, or None when this is not an announce
    /// or the payload is short. `app_data` is capped at [`MAX_APP_DATA`].
    pub fn announce_view(&self) -> Option<AnnounceView<'_>> {
        if self.packet_type() != Some(PacketType::Announce) {
            return None;
        }
        let p: &[u8] = &self.payload;
        if p.len() < ANNOUNCE_MIN_LEN {
            return None;
        }
        let pub_key = p[0..32].try_into().ok()?;
        let timestamp = u32::from_le_bytes(p[32..36].try_into().ok()?);
        let rand_blob = p[32..40].try_into().ok()?;
        let signature = p[40..104].try_into().ok()?;
        let app_data = &p[104..p.len().min(ANNOUNCE_MIN_LEN + MAX_APP_DATA)];
        Some(AnnounceView {
            pub_key,
            timestamp,
            rand_blob,
            signature,
            app_data,
        })
    }

    /// Append the wire encoding to `out`.
    pub fn to_wire(&self, out: &mut Vec<u8>) {
        out.push(self.header.bits());
        out.push(self.hops);
        if self.header.has_transport() {
            out.extend_from_slice(self.transport_id.as_bytes());
        }
        if self.packet_type() != Some(PacketType::Announce) {
            out.extend_from_slice(self.destination.as_bytes());
        }
        out.extend_from_slice(&self.payload);
    }

    /// Decode a wire frame.
    ///
    /// The destination of a decoded announce is left unset; the mesh layer
    /// derives it from the payload.
    pub fn from_wire(raw: &[u8]) -> MeshResult<Packet> {
        if raw.len() < 2 {
            return Err(MeshError::MalformedFrame("truncated header"));
        }
        let header = Header::from_bits(raw[0]);
        let ptype = header
            .packet_type()
            .ok_or(MeshError::MalformedFrame("unknown packet type"))?;
        let hops = raw[1];
        let mut i = 2;

        let transport_id = if header.has_transport() {
            let bytes = raw
                .get(i..i + Destination::LEN)
                .ok_or(MeshError::MalformedFrame("truncated transport address"))?;
            i += Destination::LEN;
            Destination::from_slice(bytes).unwrap_or(Destination::UNSET)
        } else {
            Destination::UNSET
        };

        let destination = if ptype != PacketType::Announce {
            let bytes = raw
                .get(i..i + Destination::LEN)
                .ok_or(MeshError::MalformedFrame("truncated destination"))?;
            i += Destination::LEN;
            Destination::from_slice(bytes).unwrap_or(Destination::UNSET)
        } else {
            Destination::UNSET
        };

        let payload = &raw[i..];
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(MeshError::MalformedFrame("payload too long"));
        }

        let mut packet = Packet {
            header,
            hops,
            destination,
            transport_id,
            payload: Vec::new(),
        };
        packet.set_payload(payload)?;
        Ok(packet)
    }
}
