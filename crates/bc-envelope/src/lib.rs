//! Chat message and acknowledgment wire format for `broadcast-dm`.
//!
//! A [`Message`] is the one envelope shape every transport driver carries:
//! plain chat content or an acknowledgment correlated back to the original
//! message's uuid. Deliberately independent of `bc-identity` — magnet links
//! and protocol names cross this boundary as plain strings.

mod error;
mod message;

pub use error::EnvelopeError;
pub use message::{create_acknowledgment, ChannelPreference, Message, MessageType, MAX_CONTENT_BYTES};
