use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("message content exceeds 64 KiB ({0} bytes)")]
    ContentTooLarge(usize),
}
