mod proto;
mod server;

pub use proto::*;
pub use server::*;

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("socks5: unsupported version {0}")]
    BadVersion(u8),
    #[error("socks5: unknown CMD {0}")]
    UnknownCommand(u8),
    #[error("socks5: unknown addr type {0}")]
    UnknownAddressType(u8),
    #[error("socks5: invalid domain")]
    InvalidDomain,
}

impl ProtocolError {
    /// Reply sent for a violation found in the request frame.
    pub fn reply_status(&self) -> ReplyStatus {
        match self {
            ProtocolError::UnknownCommand(_) => ReplyStatus::CommandNotSupported,
            ProtocolError::UnknownAddressType(_) => ReplyStatus::AddressTypeNotSupported,
            ProtocolError::BadVersion(_) | ProtocolError::InvalidDomain => {
                ReplyStatus::GeneralFailure
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("socks5: client closed during negotiation")]
    Closed,
    #[error("socks5: no acceptable auth method")]
    NoAcceptableMethods,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Io(e) => return e,
            Error::Closed => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
