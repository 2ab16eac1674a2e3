//! Peer identities: keys, content-derived ids and the [`Entity`] record.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use uuid::Uuid;

use crate::TransportError;

/// Derive a 128-bit id from a domain tag and a sequence of byte strings.
///
/// Each part is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
/// hash differently.
pub fn content_id(domain: &str, parts: &[&[u8]]) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

// ── Keys ─────────────────────────────────────────────────────────────

/// A public key: a Ristretto point. Keys aggregate by point addition.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(RistrettoPoint);

impl PublicKey {
    /// The neutral element of aggregation.
    pub fn identity() -> Self {
        Self(RistrettoPoint::identity())
    }

    /// Compressed 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    /// Decode a compressed point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, TransportError> {
        CompressedRistretto(bytes)
            .decompress()
            .map(Self)
            .ok_or(TransportError::InvalidKey)
    }
}

impl Add for PublicKey {
    type Output = PublicKey;

    fn add(self, other: PublicKey) -> PublicKey {
        PublicKey(self.0 + other.0)
    }
}

impl<'a> Sum<&'a PublicKey> for PublicKey {
    fn sum<I: Iterator<Item = &'a PublicKey>>(iter: I) -> Self {
        iter.fold(PublicKey::identity(), |acc, k| acc + *k)
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(
            f,
            "PublicKey({:02x}{:02x}{:02x}{:02x}...)",
            bytes[0], bytes[1], bytes[2], bytes[3]
        )
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        PublicKey::from_bytes(bytes).map_err(serde::de::Error::custom)
    }
}

/// A secret scalar with its public point.
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: PublicKey,
}

impl KeyPair {
    /// Fresh random key pair.
    pub fn generate() -> Self {
        let mut wide = [0u8; 64];
        rand::rng().fill_bytes(&mut wide);
        Self::from_wide(&wide)
    }

    /// Deterministic key pair, for tests and reproducible simulations.
    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = Sha512::digest(seed);
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&digest);
        Self::from_wide(&wide)
    }

    fn from_wide(wide: &[u8; 64]) -> Self {
        let secret = Scalar::from_bytes_mod_order_wide(wide);
        let public = PublicKey(RISTRETTO_BASEPOINT_POINT * secret);
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Raw secret scalar, for protocols doing their own cryptography.
    pub fn secret(&self) -> &Scalar {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

// ── EntityId ─────────────────────────────────────────────────────────

/// Content-derived identity of an [`Entity`]: a hash of its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn from_public(public: &PublicKey) -> Self {
        Self(content_id("arbor/entity", &[&public.to_bytes()]))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "EntityId({}...)", &s[..8])
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// ── Entity ───────────────────────────────────────────────────────────

/// A peer's identity: a public key plus one or more network addresses.
///
/// The id is recomputed from the key on deserialization, so a received
/// entity can never carry an id that does not match its key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "EntityRepr", from = "EntityRepr")]
pub struct Entity {
    id: EntityId,
    public: PublicKey,
    addresses: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct EntityRepr {
    public: PublicKey,
    addresses: Vec<String>,
}

impl From<EntityRepr> for Entity {
    fn from(repr: EntityRepr) -> Self {
        Entity::with_addresses(repr.public, repr.addresses)
    }
}

impl From<Entity> for EntityRepr {
    fn from(entity: Entity) -> Self {
        EntityRepr {
            public: entity.public,
            addresses: entity.addresses,
        }
    }
}

impl Entity {
    pub fn new(public: PublicKey, address: impl Into<String>) -> Self {
        Self::with_addresses(public, vec![address.into()])
    }

    pub fn with_addresses(public: PublicKey, addresses: Vec<String>) -> Self {
        Self {
            id: EntityId::from_public(&public),
            public,
            addresses,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Primary address, or the empty string for address-less clients.
    pub fn address(&self) -> &str {
        self.addresses.first().map(String::as_str).unwrap_or("")
    }

    /// Network host of the primary address (IP or hostname, no port).
    pub fn host(&self) -> &str {
        let addr = self.address();
        match addr.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
                host.trim_start_matches('[').trim_end_matches(']')
            }
            _ => addr,
        }
    }
}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({:?} @ {})", self.id, self.address())
    }
}
