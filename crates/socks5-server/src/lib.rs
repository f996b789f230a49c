//! A SOCKS5 proxy server.
//!
//! # Overview
//!
//! A [`Server`] listens on one or more local addresses, speaks SOCKS5 to
//! whoever connects, and relays bytes between each client and the
//! destination it asked for.  Only the "no authentication" method and the
//! CONNECT command are supported; the wire format itself lives in
//! [`socks5_proto`].
//!
//! Three parts of the server are pluggable, and can be replaced before
//! the server starts listening:
//!
//!  * A [`Resolver`] turns hostnames into candidate addresses.  By default
//!    this is [`SystemResolver`]; [`ShuffleResolver`] randomizes the order
//!    of another resolver's answers.
//!  * A [`Ruler`] decides which candidates a client may reach.  By default
//!    this is [`DefaultRuler`], which keeps clients away from the server's
//!    own networks.
//!  * A [`Logger`] receives log messages, each prefixed with the
//!    connection it concerns.  By default this is [`TracingLogger`].
//!
//! Each accepted connection gets its own task.  Nothing that goes wrong on
//! one connection affects the server or any other connection: errors are
//! logged and the connection is closed.
//!
//! # Example
//!
//! ```no_run
//! use socks5_server::{AllowAll, Server};
//! use std::net::Ipv4Addr;
//!
//! # async fn run() -> socks5_server::Result<()> {
//! let server = Server::new();
//! server.set_ruler(AllowAll)?;
//! server.listen_and_serve(Ipv4Addr::LOCALHOST.into(), 1080).await
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod conn;
mod deadline;
mod err;
mod log;
mod policy;
mod relay;
mod resolve;
mod server;

pub use deadline::DEFAULT_IDLE_TIMEOUT;
pub use err::{DialError, Error, Result};
pub use log::{Logger, NullLogger, PrefixLogger, TracingLogger};
pub use policy::{AllowAll, Decision, DefaultRuler, Ruler};
pub use resolve::{ResolveError, Resolver, ShuffleResolver, SystemResolver};
pub use server::{Server, ServerConfig, DEFAULT_INTAKE_QUEUE};
