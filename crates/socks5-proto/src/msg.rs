//! Structures that represent SOCKS messages

use crate::{Error, Result};

use bytes::BufMut;
use caret::caret_int;
use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// The only SOCKS protocol version we speak.
pub const SOCKS_VERSION: u8 = 5;

/// A completed SOCKS request, as negotiated on a SOCKS connection.
///
/// Once this request is done, we know where to connect.  Don't
/// discard this object immediately: its port goes back to the client
/// in a successful [Reply].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksRequest {
    /// Negotiated SOCKS protocol version. Always 5.
    version: u8,
    /// The command requested by the SOCKS client.
    cmd: SocksCmd,
    /// The target address.
    addr: SocksAddr,
    /// The target port.
    port: u16,
}

/// An address sent or received as part of a SOCKS handshake
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum SocksAddr {
    /// A regular DNS hostname, still to be resolved.
    Hostname(SocksHostname),
    /// An IP address.
    Ip(IpAddr),
}

/// A hostname for use with SOCKS.  It is limited in length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksHostname(String);

caret_int! {
    /// Command from the socks client telling us what to do.
    pub struct SocksCmd(u8) {
        /// Connect to a remote TCP address:port.
        CONNECT = 1,
        /// Not supported.
        BIND = 2,
        /// Not supported.
        UDP_ASSOCIATE = 3,
    }
}

caret_int! {
    /// Possible reply status values from a SOCKS5 handshake.
    ///
    /// Note that the documentation for these values is kind of scant,
    /// and is limited to what the RFC says.
    pub struct SocksStatus(u8) {
        /// RFC 1928: "succeeded"
        SUCCEEDED = 0x00,
        /// RFC 1928: "general SOCKS server failure"
        GENERAL_FAILURE = 0x01,
        /// RFC 1928: "connection not allowable by ruleset"
        NOT_ALLOWED = 0x02,
        /// RFC 1928: "Network unreachable"
        NETWORK_UNREACHABLE = 0x03,
        /// RFC 1928: "Host unreachable"
        HOST_UNREACHABLE = 0x04,
        /// RFC 1928: "Connection refused"
        CONNECTION_REFUSED = 0x05,
        /// RFC 1928: "TTL expired"
        TTL_EXPIRED = 0x06,
        /// RFC 1928: "Command not supported"
        COMMAND_NOT_SUPPORTED = 0x07,
        /// RFC 1928: "Address type not supported"
        ADDRTYPE_NOT_SUPPORTED = 0x08,
    }
}

caret_int! {
    /// The ATYP byte that precedes an address in requests and replies.
    pub struct AddrType(u8) {
        /// Four bytes of IPv4 address follow.
        IPV4 = 0x01,
        /// A length byte and that many bytes of hostname follow.
        HOSTNAME = 0x03,
        /// Sixteen bytes of IPv6 address follow.
        IPV6 = 0x04,
    }
}

caret_int! {
    /// Authentication methods a client may offer during negotiation.
    pub struct AuthMethod(u8) {
        /// No authentication; the only one we accept.
        NO_AUTHENTICATION = 0x00,
        /// RFC 1961.  Not supported.
        GSSAPI = 0x01,
        /// RFC 1929.  Not supported.
        USERNAME_PASSWORD = 0x02,
        /// Sent by the server when nothing the client offered is usable.
        NO_ACCEPTABLE_METHODS = 0xFF,
    }
}

impl TryFrom<String> for SocksHostname {
    type Error = Error;
    fn try_from(s: String) -> Result<SocksHostname> {
        if s.len() > 255 {
            Err(Error::BadHostname)
        } else {
            Ok(SocksHostname(s))
        }
    }
}

impl AsRef<str> for SocksHostname {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl From<SocksHostname> for String {
    fn from(s: SocksHostname) -> String {
        s.0
    }
}

impl SocksRequest {
    /// Create a SocksRequest with a given set of fields.
    ///
    /// Return an error if the command isn't one we support.
    pub(crate) fn new(version: u8, cmd: SocksCmd, addr: SocksAddr, port: u16) -> Result<Self> {
        if version != SOCKS_VERSION {
            return Err(Error::BadProtocol(version));
        }
        if cmd != SocksCmd::CONNECT {
            return Err(Error::CommandNotSupported(cmd));
        }
        Ok(SocksRequest {
            version,
            cmd,
            addr,
            port,
        })
    }

    /// Return the negotiated version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Return the command that the client requested.
    pub fn command(&self) -> SocksCmd {
        self.cmd
    }

    /// Return the requested port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the requested address.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }
}

impl SocksAddr {
    /// Return the ATYP byte that introduces this address on the wire.
    pub fn addr_type(&self) -> AddrType {
        match self {
            SocksAddr::Ip(IpAddr::V4(_)) => AddrType::IPV4,
            SocksAddr::Ip(IpAddr::V6(_)) => AddrType::IPV6,
            SocksAddr::Hostname(_) => AddrType::HOSTNAME,
        }
    }

    /// Append the ATYP byte and address body onto `w`.
    fn write_onto<B: BufMut>(&self, w: &mut B) {
        w.put_u8(self.addr_type().into());
        match self {
            SocksAddr::Ip(IpAddr::V4(ip)) => w.put_slice(&ip.octets()),
            SocksAddr::Ip(IpAddr::V6(ip)) => w.put_slice(&ip.octets()),
            SocksAddr::Hostname(h) => {
                // SocksHostname can't be built any longer than this.
                let len = h.0.len() as u8;
                w.put_u8(len);
                w.put_slice(h.0.as_bytes());
            }
        }
    }
}

impl fmt::Display for SocksAddr {
    /// Format a string (a hostname or IP address) corresponding to this
    /// SocksAddr.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(a) => write!(f, "{}", a),
            SocksAddr::Hostname(h) => write!(f, "{}", h.0),
        }
    }
}

/// The server's answer to a [SocksRequest].
///
/// Exactly one of these is sent for every request that gets parsed far
/// enough for us to answer it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    /// Outcome of the request.
    status: SocksStatus,
    /// The "bound" address to report.
    addr: SocksAddr,
    /// The "bound" port to report.
    port: u16,
}

impl Reply {
    /// Construct a reply reporting `status`, with a given bound address and port.
    pub fn new(status: SocksStatus, addr: SocksAddr, port: u16) -> Self {
        Reply { status, addr, port }
    }

    /// Construct a reply for a failed request.
    ///
    /// The bound endpoint is meaningless on failure, so we send 0.0.0.0:0.
    pub fn failure(status: SocksStatus) -> Self {
        Reply::new(status, SocksAddr::Ip(Ipv4Addr::UNSPECIFIED.into()), 0)
    }

    /// Return the status carried by this reply.
    pub fn status(&self) -> SocksStatus {
        self.status
    }

    /// Encode this reply in the form sent on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(22);
        w.put_u8(SOCKS_VERSION);
        w.put_u8(self.status.into());
        w.put_u8(0); // reserved.
        self.addr.write_onto(&mut w);
        w.put_u16(self.port);
        w
    }
}
