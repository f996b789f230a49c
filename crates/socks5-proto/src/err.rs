//! Declare an error type for socks5_proto
use thiserror::Error;

use crate::msg::{AddrType, AuthMethod, Reply, SocksCmd, SocksStatus, SOCKS_VERSION};

/// An error that occurs while negotiating a SOCKS handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to handle a message what wasn't complete: try again.
    #[error("Message truncated; need to wait for more")]
    Truncated,

    /// The SOCKS client declared a SOCKS version number that isn't
    /// one we support.
    ///
    /// In all likelihood, this is somebody trying to use the port for
    /// some protocol other than SOCKS.
    #[error("Unrecognized SOCKS protocol version {0}")]
    BadProtocol(u8),

    /// The client offered no authentication method that we accept.
    #[error("No acceptable authentication method offered")]
    NoAcceptableMethod,

    /// The client asked for a command other than CONNECT.
    #[error("SOCKS command {0} not supported")]
    CommandNotSupported(SocksCmd),

    /// The client used an address type we don't know.
    #[error("SOCKS address type {0} not supported")]
    AddrTypeNotSupported(AddrType),

    /// The client sent a hostname that was not valid UTF-8.
    #[error("Hostname in SOCKS request was not valid UTF-8")]
    BadHostname,

    /// Tried to progress the SOCKS handshake when it was already
    /// finished.  This is a programming error.
    #[error("SOCKS handshake was finished; no need to call this again")]
    AlreadyFinished,
}

impl Error {
    /// Return the reply (if any) that the protocol lets us send the client
    /// before closing the connection because of this error.
    ///
    /// A client that spoke the wrong version gets nothing: we can't know
    /// what it would understand.
    pub fn reply(&self) -> Option<Vec<u8>> {
        match self {
            Error::NoAcceptableMethod => Some(vec![
                SOCKS_VERSION,
                AuthMethod::NO_ACCEPTABLE_METHODS.into(),
            ]),
            Error::CommandNotSupported(_) => {
                Some(Reply::failure(SocksStatus::COMMAND_NOT_SUPPORTED).encode())
            }
            Error::AddrTypeNotSupported(_) | Error::BadHostname => {
                Some(Reply::failure(SocksStatus::ADDRTYPE_NOT_SUPPORTED).encode())
            }
            Error::Truncated | Error::BadProtocol(_) | Error::AlreadyFinished => None,
        }
    }
}
