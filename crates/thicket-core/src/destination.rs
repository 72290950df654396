//! Destination hashes.
//!
//! Nodes are addressed by 8-byte truncated SHA-256 hashes rather than by
//! raw public keys. A destination either binds a service name to an
//! identity (only that keyholder can sign for it) or is derived from a
//! name alone (a well-known rendezvous every node can compute).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::sha256_trunc8;
use crate::identity::Identity;

/// Fixed name binding for node announces. Announce frames carry no
/// destination on the wire; receivers derive it from this name and the
/// public key in the payload.
pub const ANNOUNCE_NAME: &str = "node.announce";

/// Name-only rendezvous for path requests.
pub const PATH_REQUEST_NAME: &str = "path.request";

/// Name binding for a relay's transport address.
pub const TRANSPORT_NAME: &str = "trans.data";

/// An 8-byte destination hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Destination([u8; Destination::LEN]);

impl Destination {
    pub const LEN: usize = 8;

    /// The all-zero placeholder used for absent transport addresses.
    pub const UNSET: Destination = Destination([0; Self::LEN]);

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// First 8 bytes of `bytes`, or None when too short.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head: [u8; Self::LEN] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(head))
    }

    /// Name-only destination: `trunc8(sha256(name))`.
    pub fn named(name: &str) -> Self {
        Self(sha256_trunc8(&[name.as_bytes()]))
    }

    /// Identity-bound destination: `trunc8(sha256(sha256(name) || pub_key))`.
    pub fn bound(name: &str, identity: &Identity) -> Self {
        let name_hash = crate::crypto::sha256(&[name.as_bytes()]);
        Self(sha256_trunc8(&[&name_hash, identity.as_bytes()]))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == [0; Self::LEN]
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self)
    }
}

/// The announce destination for `identity`.
pub fn announce_destination(identity: &Identity) -> Destination {
    Destination::bound(ANNOUNCE_NAME, identity)
}

/// The shared path-request destination.
pub fn path_request_destination() -> Destination {
    Destination::named(PATH_REQUEST_NAME)
}

/// The transport address a relay advertises for `identity`.
pub fn transport_destination(identity: &Identity) -> Destination {
    Destination::bound(TRANSPORT_NAME, identity)
}
