use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("recipient magnet link is invalid: {0}")]
    InvalidRecipient(#[from] bc_identity::IdentityError),

    #[error("message content is invalid: {0}")]
    InvalidMessage(#[from] bc_envelope::EnvelopeError),
}
