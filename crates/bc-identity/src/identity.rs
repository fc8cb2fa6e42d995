//! Unified cryptographic identity: a secp256k1 keypair plus an ed25519
//! keypair, with derived per-transport addresses and a printable magnet-link
//! codec.

use std::collections::HashMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};

use crate::error::IdentityError;
use crate::protocol::Protocol;

const MAGNET_XT: &str = "urn:identity:v1";

/// The public-only half of an [`Identity`] — what `Decode` produces and what
/// other peers exchange as an address.  Never holds secret key material.
#[derive(Debug, Clone)]
pub struct PublicIdentity {
    secp256k1_pub: PublicKey,
    ed25519_pub: ed25519_dalek::VerifyingKey,
    eth_address: String,
}

impl PartialEq for PublicIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.secp256k1_pub == other.secp256k1_pub
            && self.ed25519_pub.to_bytes() == other.ed25519_pub.to_bytes()
            && self.eth_address == other.eth_address
    }
}

impl Eq for PublicIdentity {}

impl PublicIdentity {
    /// Ethereum address: last 20 bytes of keccak256(uncompressed pubkey minus
    /// the leading 0x04 byte), lowercase 0x-prefixed hex.
    pub fn eth_address(&self) -> &str {
        &self.eth_address
    }

    /// Nostr public key: the x-coordinate of the secp256k1 public key, 32
    /// bytes, lowercase hex (no 0x prefix).
    pub fn nostr_pubkey(&self) -> String {
        let uncompressed = self.secp256k1_pub.serialize_uncompressed();
        hex::encode(&uncompressed[1..33])
    }

    /// Generic hex pub/sub identifier (compressed secp256k1 public key).
    /// Used to address D3 (broker pub/sub) and D4 (p2p pub/sub mesh).
    pub fn pubsub_id(&self) -> String {
        hex::encode(self.secp256k1_pub.serialize())
    }

    /// Hex-encoded ed25519 public key — the D5 (direct p2p) node id.
    pub fn node_id(&self) -> String {
        hex::encode(self.ed25519_pub.to_bytes())
    }

    pub fn secp256k1_public(&self) -> &PublicKey {
        &self.secp256k1_pub
    }

    pub fn ed25519_public(&self) -> &ed25519_dalek::VerifyingKey {
        &self.ed25519_pub
    }

    /// The address this identity is reached at on `protocol`.
    pub fn address_for(&self, protocol: Protocol) -> String {
        match protocol {
            Protocol::Xmtp => self.eth_address.clone(),
            Protocol::Nostr => self.nostr_pubkey(),
            Protocol::Mqtt | Protocol::Waku => self.pubsub_id(),
            Protocol::Iroh => self.node_id(),
        }
    }

    /// Encode as a magnet link.
    pub fn encode(&self) -> String {
        let uncompressed = self.secp256k1_pub.serialize_uncompressed();
        let secp_hex = hex::encode(uncompressed);
        let ed_hex = hex::encode(self.ed25519_pub.to_bytes());

        let enc = |s: &str| utf8_percent_encode(s, NON_ALPHANUMERIC).to_string();
        format!(
            "magnet:?xt={}&secp256k1pub={}&ed25519pub={}&eth={}",
            enc(MAGNET_XT),
            enc(&secp_hex),
            enc(&ed_hex),
            enc(&self.eth_address),
        )
    }
}

/// A unified identity: immutable, holds both private keys. Derive once,
/// persist via an external profile store (out of scope here).
pub struct Identity {
    secp256k1_secret: SecretKey,
    secp256k1_public: PublicKey,
    ed25519_signing: ed25519_dalek::SigningKey,
    ed25519_verifying: ed25519_dalek::VerifyingKey,
}

impl Identity {
    /// Generate a fresh identity from the OS CSPRNG.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut OsRng);
        let public = PublicKey::from_secret_key(&secp, &secret);

        let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();

        Identity {
            secp256k1_secret: secret,
            secp256k1_public: public,
            ed25519_signing: signing,
            ed25519_verifying: verifying,
        }
    }

    /// Reconstruct an identity from previously-persisted raw key material.
    /// The profile store (out of scope) owns persistence; this is its
    /// counterpart to `generate()`.
    pub fn from_raw(
        secp256k1_secret: [u8; 32],
        ed25519_secret: [u8; 32],
    ) -> Result<Self, IdentityError> {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&secp256k1_secret)
            .map_err(|e| IdentityError::InvalidSecp256k1Key(e.to_string()))?;
        let public = PublicKey::from_secret_key(&secp, &secret);
        let signing = ed25519_dalek::SigningKey::from_bytes(&ed25519_secret);
        let verifying = signing.verifying_key();

        Ok(Identity {
            secp256k1_secret: secret,
            secp256k1_public: public,
            ed25519_signing: signing,
            ed25519_verifying: verifying,
        })
    }

    pub fn secp256k1_secret(&self) -> &SecretKey {
        &self.secp256k1_secret
    }

    pub fn secp256k1_public(&self) -> &PublicKey {
        &self.secp256k1_public
    }

    pub fn ed25519_signing(&self) -> &ed25519_dalek::SigningKey {
        &self.ed25519_signing
    }

    /// The public-only view of this identity, safe to hand to peers.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            secp256k1_pub: self.secp256k1_public,
            ed25519_pub: self.ed25519_verifying,
            eth_address: eth_address_from_pubkey(&self.secp256k1_public),
        }
    }

    pub fn eth_address(&self) -> String {
        eth_address_from_pubkey(&self.secp256k1_public)
    }

    pub fn address_for(&self, protocol: Protocol) -> String {
        self.public().address_for(protocol)
    }

    /// Encode this identity's public half as a magnet link.
    pub fn encode(&self) -> String {
        self.public().encode()
    }
}

fn eth_address_from_pubkey(pubkey: &PublicKey) -> String {
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Decode a magnet link into a [`PublicIdentity`].
///
/// Strict: unknown top-level parameters are tolerated, but malformed hex,
/// wrong key lengths, or a missing required parameter all produce an
/// [`IdentityError`].
pub fn decode(link: &str) -> Result<PublicIdentity, IdentityError> {
    let rest = link
        .strip_prefix("magnet:?")
        .ok_or(IdentityError::NotAMagnetLink)?;

    let mut params: HashMap<&str, String> = HashMap::new();
    for pair in rest.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let decoded = percent_decode_str(value)
            .decode_utf8_lossy()
            .into_owned();
        params.insert(key, decoded);
    }

    params.get("xt").ok_or(IdentityError::MissingParameter("xt"))?;

    let secp_hex = params
        .get("secp256k1pub")
        .ok_or(IdentityError::MissingParameter("secp256k1pub"))?;
    let ed_hex = params
        .get("ed25519pub")
        .ok_or(IdentityError::MissingParameter("ed25519pub"))?;
    let eth_hex = params
        .get("eth")
        .ok_or(IdentityError::MissingParameter("eth"))?;

    let secp_bytes =
        hex::decode(secp_hex).map_err(|_| IdentityError::InvalidHex("secp256k1pub"))?;
    if secp_bytes.len() != 65 {
        return Err(IdentityError::BadSecp256k1Length(secp_bytes.len()));
    }
    let secp256k1_pub = PublicKey::from_slice(&secp_bytes)
        .map_err(|e| IdentityError::InvalidSecp256k1Key(e.to_string()))?;

    let ed_bytes = hex::decode(ed_hex).map_err(|_| IdentityError::InvalidHex("ed25519pub"))?;
    if ed_bytes.len() != 32 {
        return Err(IdentityError::BadEd25519Length(ed_bytes.len()));
    }
    let ed_arr: [u8; 32] = ed_bytes.try_into().expect("checked length above");
    let ed25519_pub = ed25519_dalek::VerifyingKey::from_bytes(&ed_arr)
        .map_err(|e| IdentityError::InvalidEd25519Key(e.to_string()))?;

    let eth_trimmed = eth_hex.strip_prefix("0x").unwrap_or(eth_hex);
    let eth_bytes = hex::decode(eth_trimmed).map_err(|_| IdentityError::InvalidHex("eth"))?;
    if eth_bytes.len() != 20 {
        return Err(IdentityError::BadEthLength(eth_bytes.len()));
    }
    let eth_address = format!("0x{}", hex::encode(&eth_bytes));

    Ok(PublicIdentity {
        secp256k1_pub,
        ed25519_pub,
        eth_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_round_trips_through_magnet_link() {
        let id = Identity::generate();
        let link = id.encode();
        let decoded = decode(&link).unwrap();
        assert_eq!(decoded, id.public());
    }

    #[test]
    fn eth_address_is_lowercase_0x_prefixed_40_hex() {
        let id = Identity::generate();
        let addr = id.eth_address();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        assert_eq!(addr, addr.to_lowercase());
    }

    #[test]
    fn nostr_pubkey_is_32_byte_hex() {
        let id = Identity::generate();
        let pk = id.public().nostr_pubkey();
        assert_eq!(pk.len(), 64);
        hex::decode(&pk).unwrap();
    }

    #[test]
    fn node_id_is_32_byte_hex() {
        let id = Identity::generate();
        let nid = id.public().node_id();
        assert_eq!(nid.len(), 64);
    }

    #[test]
    fn decode_rejects_missing_ed25519pub() {
        let id = Identity::generate();
        let link = id.encode();
        let truncated: Vec<&str> = link
            .split('&')
            .filter(|p| !p.starts_with("ed25519pub="))
            .collect();
        let broken = truncated.join("&");
        let err = decode(&broken).unwrap_err();
        assert_eq!(err, IdentityError::MissingParameter("ed25519pub"));
    }

    #[test]
    fn decode_rejects_non_magnet_string() {
        assert_eq!(decode("not-a-magnet-link").unwrap_err(), IdentityError::NotAMagnetLink);
    }

    #[test]
    fn decode_rejects_wrong_length_secp256k1pub() {
        let bad = "magnet:?xt=urn:identity:v1&secp256k1pub=deadbeef&ed25519pub=\
                   0000000000000000000000000000000000000000000000000000000000000000&\
                   eth=0x0000000000000000000000000000000000000000";
        assert!(matches!(
            decode(bad).unwrap_err(),
            IdentityError::BadSecp256k1Length(_)
        ));
    }

    #[test]
    fn decode_tolerates_unknown_parameters() {
        let id = Identity::generate();
        let link = format!("{}&future=stuff", id.encode());
        let decoded = decode(&link).unwrap();
        assert_eq!(decoded, id.public());
    }

    #[test]
    fn address_for_each_protocol_matches_derivation() {
        let id = Identity::generate();
        let pub_id = id.public();
        assert_eq!(pub_id.address_for(Protocol::Xmtp), pub_id.eth_address());
        assert_eq!(pub_id.address_for(Protocol::Nostr), pub_id.nostr_pubkey());
        assert_eq!(pub_id.address_for(Protocol::Mqtt), pub_id.pubsub_id());
        assert_eq!(pub_id.address_for(Protocol::Waku), pub_id.pubsub_id());
        assert_eq!(pub_id.address_for(Protocol::Iroh), pub_id.node_id());
    }
}
