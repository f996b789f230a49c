//! Declare error types for socks5-server

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socks5_proto::SocksStatus;
use thiserror::Error;

use crate::resolve::ResolveError;

/// An error returned while running the server or serving one connection.
///
/// Errors from a single connection never leave that connection's task:
/// they are logged there and the connection is closed.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The client broke the SOCKS protocol, or asked for something we
    /// don't do.
    #[error("SOCKS protocol error: {0}")]
    Proto(#[from] socks5_proto::Error),

    /// An I/O error while doing something on a socket.
    #[error("I/O error while {action}: {source}")]
    Io {
        /// What we were doing.
        action: &'static str,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A socket was idle for longer than we allow.
    #[error("Timed out while {0}")]
    Timeout(&'static str),

    /// A hostname could not be turned into addresses.
    #[error("{0}")]
    Resolve(#[from] ResolveError),

    /// The access policy refused every candidate address.
    #[error("No permitted destination among {0} candidate(s)")]
    NotAllowed(usize),

    /// No candidate address could be connected to.
    #[error("{0}")]
    Dial(Arc<retry_error::RetryError<DialError>>),

    /// Tried to reconfigure a server that has listeners running.
    #[error("Can't change the {0} while the server is listening")]
    AlreadyListening(&'static str),

    /// Couldn't open a listener.
    #[error("Unable to listen on {addr}: {source}")]
    Listen {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A listener failed in a way that won't get better by retrying.
    #[error("Failed to accept on {addr}: {source}")]
    Accept {
        /// The address of the failed listener.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// An internal error of some kind that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// An error from a single outbound connection attempt.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum DialError {
    /// We couldn't build a local/remote address pair for this candidate.
    #[error("Can't reach {candidate} from local address {local}")]
    AddressFamily {
        /// The address we were told to bind outbound sockets to.
        local: IpAddr,
        /// The candidate destination.
        candidate: IpAddr,
    },

    /// The connection attempt itself failed.
    #[error("Unable to connect to {addr}: {source}")]
    Connect {
        /// The destination we tried.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The connection attempt took longer than the idle timeout.
    #[error("Connection to {0} timed out")]
    Timeout(SocketAddr),
}

impl Error {
    /// Construct an [Error::Io] from an io::Error and a description of
    /// what we were doing.
    pub(crate) fn io(action: &'static str, source: io::Error) -> Self {
        Error::Io {
            action,
            source: Arc::new(source),
        }
    }

    /// Return the SOCKS reply status that reports this error to a
    /// client, if it is one that happens while answering a request.
    ///
    /// Handshake errors carry their own reply (see
    /// [socks5_proto::Error::reply]) and give `None` here.
    pub fn socks_status(&self) -> Option<SocksStatus> {
        match self {
            Error::Resolve(e) => Some(e.socks_status()),
            Error::NotAllowed(_) => Some(SocksStatus::NOT_ALLOWED),
            Error::Dial(errs) => Some(match errs.sources().last() {
                Some(DialError::AddressFamily { .. }) => SocksStatus::ADDRTYPE_NOT_SUPPORTED,
                _ => SocksStatus::GENERAL_FAILURE,
            }),
            _ => None,
        }
    }
}

/// A Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;
    use retry_error::RetryError;

    #[test]
    fn dial_status_follows_last_error() {
        let refused = DialError::Connect {
            addr: "192.0.2.1:80".parse().unwrap(),
            source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
        };
        let family = DialError::AddressFamily {
            local: "192.0.2.5".parse().unwrap(),
            candidate: "2001:db8::1".parse().unwrap(),
        };

        let mut errs = RetryError::in_attempt_to("connect");
        errs.push(refused.clone());
        errs.push(family.clone());
        let e = Error::Dial(Arc::new(errs));
        assert_eq!(e.socks_status(), Some(SocksStatus::ADDRTYPE_NOT_SUPPORTED));

        let mut errs = RetryError::in_attempt_to("connect");
        errs.push(family);
        errs.push(refused);
        let e = Error::Dial(Arc::new(errs));
        assert_eq!(e.socks_status(), Some(SocksStatus::GENERAL_FAILURE));
    }

    #[test]
    fn status_for_policy_and_io() {
        assert_eq!(
            Error::NotAllowed(3).socks_status(),
            Some(SocksStatus::NOT_ALLOWED)
        );
        let e = Error::io("reading", io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(e.socks_status(), None);
        assert_eq!(Error::Timeout("reading").socks_status(), None);
    }
}
