//! Implements the server side of the SOCKS5 handshake.
//!
//! SOCKS5 is specified in [RFC 1928](https://tools.ietf.org/html/rfc1928).
//! This crate supports the subset of it that `socks5d` speaks: the "no
//! authentication" method, and the CONNECT command with IPv4, IPv6 and
//! hostname destinations.
//!
//! Nothing here touches the network.  The [SocksHandshake] type is fed
//! whatever bytes a client has sent so far, and answers with an [Action]
//! telling the caller how much input to drain, what to send back, and
//! whether the handshake is over.  When it is, [SocksHandshake::into_request]
//! yields the [SocksRequest] the client asked for, and a [Reply] can be
//! encoded to report the outcome.
//!
//! Failures that the protocol lets us report (no acceptable method, an
//! unsupported command, an unknown address type) carry their wire reply:
//! see [Error::reply].

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::exhaustive_structs)]

mod err;
mod handshake;
mod msg;
mod reader;

pub use err::Error;
pub use handshake::{Action, SocksHandshake};
pub use msg::{
    AddrType, AuthMethod, Reply, SocksAddr, SocksCmd, SocksHostname, SocksRequest, SocksStatus,
    SOCKS_VERSION,
};

/// A Result type for the socks5_proto crate.
pub type Result<T> = std::result::Result<T, Error>;
