use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("magnet link missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("magnet link parameter {0} is not valid hex")]
    InvalidHex(&'static str),

    #[error("secp256k1pub must be 65 bytes (uncompressed, 04-prefixed), got {0}")]
    BadSecp256k1Length(usize),

    #[error("ed25519pub must be 32 bytes, got {0}")]
    BadEd25519Length(usize),

    #[error("eth address must be 20 bytes (40 hex chars), got {0}")]
    BadEthLength(usize),

    #[error("secp256k1pub is not a valid public key: {0}")]
    InvalidSecp256k1Key(String),

    #[error("ed25519pub is not a valid public key: {0}")]
    InvalidEd25519Key(String),

    #[error("magnet link does not start with 'magnet:?'")]
    NotAMagnetLink,
}
