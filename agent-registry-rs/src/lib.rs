//! Agent messaging for the assistant core: the [`MessageBroker`] that workers
//! use to exchange [`Message`]s, and the static [`CapabilityRegistry`]
//! populated at startup.

pub mod broker;
pub mod capability;
pub mod message;

pub use broker::MessageBroker;
pub use capability::{CapabilityProbe, CapabilityRegistry};
pub use message::{context, Message, Priority};

use error_handling_rs::{Error, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("agent name must not be empty")]
    InvalidName,
    #[error("capability configuration error: {0}")]
    Capabilities(String),
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        let kind = match &err {
            BrokerError::UnknownRecipient(_) => ErrorKind::UnknownRecipient,
            BrokerError::InvalidName => ErrorKind::InputValidation,
            BrokerError::Capabilities(_) => ErrorKind::Internal,
        };
        Error::new(kind, err.to_string()).service("message_broker")
    }
}
