//! Unified cryptographic identity for `broadcast-dm`.
//!
//! An [`Identity`] bundles a secp256k1 keypair and an ed25519 keypair and
//! derives every per-transport address a peer needs: an Ethereum address, a
//! Nostr public key, a generic pub/sub hex identifier, and an ed25519 node
//! id. [`decode`]/[`PublicIdentity::encode`] round-trip the public half
//! through a printable magnet link.

mod error;
mod identity;
mod protocol;

pub use error::IdentityError;
pub use identity::{decode, Identity, PublicIdentity};
pub use protocol::Protocol;
