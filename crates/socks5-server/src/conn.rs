//! The per-connection SOCKS state machine.
//!
//! A [`SocksConn`] owns one accepted connection.  It runs the handshake,
//! works out where the client wants to go, checks and dials each
//! candidate address in turn, reports the outcome, and finally hands
//! both sockets to the relay.  Whatever goes wrong stays inside the
//! connection: [`SocksConn::serve`] logs it and closes the socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use retry_error::RetryError;
use socks5_proto::{Reply, SocksAddr, SocksHandshake, SocksRequest, SocksStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use crate::deadline::Deadline;
use crate::err::DialError;
use crate::log::PrefixLogger;
use crate::policy::Decision;
use crate::relay::relay;
use crate::resolve::ResolveError;
use crate::server::Services;
use crate::{Error, Result};

/// Size of the buffer that holds handshake messages.
///
/// The largest message a client can send us is a request with a 255-byte
/// hostname, which is well under this.
const HANDSHAKE_BUF_LEN: usize = 1024;

/// One client connection, from handshake to teardown.
pub(crate) struct SocksConn {
    /// The socket the client connected on.
    stream: TcpStream,
    /// The client's address.
    peer: SocketAddr,
    /// The local address we bind outbound connections to, and report
    /// back to the client.
    outbound_ip: IpAddr,
    /// How long any socket may go without successful I/O.
    idle: Duration,
    /// Rolling deadline for the client socket, until relaying starts.
    deadline: Deadline,
    /// Logger, prefixed with this connection's identity.
    log: PrefixLogger,
    /// Resolver and ruler to use.
    services: Services,
}

impl SocksConn {
    /// Wrap an accepted connection from `peer`.
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        outbound_ip: IpAddr,
        idle: Duration,
        services: Services,
    ) -> Self {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let log = PrefixLogger::new(
            format!("[{} -> {}]", local, peer),
            Arc::clone(&services.logger),
        );
        SocksConn {
            stream,
            peer,
            outbound_ip,
            idle,
            deadline: Deadline::new(idle),
            log,
            services,
        }
    }

    /// Handle this connection to the end, logging how it went.
    ///
    /// The client socket is closed when this returns.
    pub(crate) async fn serve(self) {
        let log = self.log.clone();
        match self.handle().await {
            Ok(()) => log.info(format_args!("Done serving")),
            Err(e) => log.warn(format_args!("Error while serving: {}", e)),
        }
    }

    /// Run the SOCKS protocol on this connection, then relay.
    async fn handle(mut self) -> Result<()> {
        if let Err(e) = self.stream.set_nodelay(true) {
            self.log.debug(format_args!("Couldn't set TCP_NODELAY: {}", e));
        }

        let (request, early_data) = self.negotiate().await?;
        self.log.info(format_args!(
            "Got a socks request: {} {}:{}",
            request.command(),
            request.addr(),
            request.port()
        ));

        let upstream = match self.connect(&request).await {
            Ok(s) => s,
            Err(e) => {
                let status = e.socks_status().unwrap_or(SocksStatus::GENERAL_FAILURE);
                // We're giving up on this client anyway; if it can't hear
                // the reply, there's nobody left to tell.
                let _ = self.send_reply(&Reply::failure(status)).await;
                return Err(e);
            }
        };
        self.log.info(format_args!(
            "Connected to {}",
            upstream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| request.addr().to_string())
        ));

        // The port we report is the one that was asked for, not our
        // outbound socket's ephemeral port.
        let reply = Reply::new(
            SocksStatus::SUCCEEDED,
            SocksAddr::Ip(self.outbound_ip),
            request.port(),
        );
        self.send_reply(&reply).await?;

        let mut upstream = upstream;
        if !early_data.is_empty() {
            let mut up_deadline = Deadline::new(self.idle);
            up_deadline
                .run("forwarding early data", upstream.write_all(&early_data))
                .await?;
        }

        let stats = relay(self.stream, upstream, self.idle, &self.log).await?;
        self.log.info(format_args!(
            "Relay finished: {} bytes up, {} bytes down",
            stats.upstream, stats.downstream
        ));
        Ok(())
    }

    /// Run the handshake until we have a request.
    ///
    /// Returns the request, along with anything the client sent after it
    /// without waiting for our reply.
    async fn negotiate(&mut self) -> Result<(SocksRequest, Vec<u8>)> {
        let mut handshake = SocksHandshake::new();
        let mut inbuf = [0_u8; HANDSHAKE_BUF_LEN];
        let mut n_read = 0;

        loop {
            // Try to advance the handshake with what we have, and only
            // read more if that isn't enough.
            let action = match handshake.handshake(&inbuf[..n_read]) {
                Err(socks5_proto::Error::Truncated) => {
                    if n_read == inbuf.len() {
                        return Err(Error::Internal("SOCKS message too long"));
                    }
                    let stream = &mut self.stream;
                    let n = self
                        .deadline
                        .run("reading SOCKS handshake", stream.read(&mut inbuf[n_read..]))
                        .await?;
                    if n == 0 {
                        return Err(Error::io(
                            "reading SOCKS handshake",
                            std::io::ErrorKind::UnexpectedEof.into(),
                        ));
                    }
                    n_read += n;
                    continue;
                }
                Err(e) => {
                    if let Some(reply) = e.reply() {
                        let _ = self.write_all(&reply).await;
                    }
                    return Err(e.into());
                }
                Ok(action) => action,
            };

            if action.drain > 0 {
                inbuf.copy_within(action.drain..n_read, 0);
                n_read -= action.drain;
            }
            if !action.reply.is_empty() {
                self.write_all(&action.reply).await?;
            }
            if action.finished {
                break;
            }
            self.log.debug(format_args!("No auth OK"));
        }

        let request = handshake
            .into_request()
            .ok_or(Error::Internal("Finished handshake without a request"))?;
        Ok((request, inbuf[..n_read].to_vec()))
    }

    /// Find the candidate addresses for `addr`.
    async fn candidates(&self, addr: &SocksAddr) -> Result<Vec<IpAddr>> {
        match addr {
            SocksAddr::Ip(ip) => Ok(vec![*ip]),
            SocksAddr::Hostname(host) => {
                let host = host.as_ref();
                let addrs = self.services.resolver.lookup_ip(host).await?;
                if addrs.is_empty() {
                    return Err(ResolveError::NotFound(host.to_string()).into());
                }
                Ok(addrs)
            }
        }
    }

    /// Open a connection to the destination of `request`.
    ///
    /// Candidates are tried in order; the first one that the ruler allows
    /// and that we can connect to wins.
    async fn connect(&mut self, request: &SocksRequest) -> Result<TcpStream> {
        let candidates = self.candidates(request.addr()).await?;
        let port = request.port();
        let requester = self.peer.ip();

        let mut failures = RetryError::in_attempt_to(format!("connect to {}", request.addr()));
        for &candidate in &candidates {
            match self.services.ruler.decide(requester, candidate) {
                Decision::Allow => self.log.info(format_args!("Connecting: {}", candidate)),
                Decision::Deny => {
                    self.log.info(format_args!("Not allowed: {}", candidate));
                    continue;
                }
            }
            match self.dial(candidate, port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    self.log.debug(format_args!("{}", e));
                    failures.push(e);
                }
            }
        }

        if failures.is_empty() {
            Err(Error::NotAllowed(candidates.len()))
        } else {
            Err(Error::Dial(Arc::new(failures)))
        }
    }

    /// Make one outbound connection to `candidate`:`port`.
    async fn dial(
        &mut self,
        candidate: IpAddr,
        port: u16,
    ) -> std::result::Result<TcpStream, DialError> {
        let remote = SocketAddr::new(candidate, port);
        let local = bind_addr(self.outbound_ip, candidate)?;
        let connect_err = |e| DialError::Connect {
            addr: remote,
            source: Arc::new(e),
        };

        let socket = match candidate {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(connect_err)?;
        socket.bind(local).map_err(connect_err)?;

        match tokio::time::timeout_at(self.deadline.expires(), socket.connect(remote)).await {
            Ok(Ok(stream)) => {
                self.deadline.refresh();
                Ok(stream)
            }
            Ok(Err(e)) => Err(connect_err(e)),
            Err(_elapsed) => Err(DialError::Timeout(remote)),
        }
    }

    /// Send `reply` to the client.
    async fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        self.write_all(&reply.encode()).await
    }

    /// Write all of `data` to the client, bounded by the deadline.
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        self.deadline
            .run("writing to SOCKS client", stream.write_all(data))
            .await
    }
}

/// Return the local address to bind an outbound connection to
/// `candidate` to, given the configured outbound address `local`.
///
/// An unspecified local address works for either family; a concrete one
/// only for its own.
fn bind_addr(local: IpAddr, candidate: IpAddr) -> std::result::Result<SocketAddr, DialError> {
    let ip = match (local, candidate) {
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => local,
        (l, IpAddr::V4(_)) if l.is_unspecified() => Ipv4Addr::UNSPECIFIED.into(),
        (l, IpAddr::V6(_)) if l.is_unspecified() => Ipv6Addr::UNSPECIFIED.into(),
        _ => return Err(DialError::AddressFamily { local, candidate }),
    };
    Ok(SocketAddr::new(ip, 0))
}
