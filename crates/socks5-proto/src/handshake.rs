//! Types to implement the SOCKS handshake.

use crate::msg::{AddrType, AuthMethod, SocksAddr, SocksCmd, SocksRequest, SOCKS_VERSION};
use crate::reader::Reader;
use crate::{Error, Result};

use std::convert::TryInto;

/// An ongoing SOCKS handshake.
///
/// To perform a handshake, call the [SocksHandshake::handshake]
/// method repeatedly with new inputs, until the resulting [Action]
/// has `finished` set to true.
#[derive(Clone, Debug)]
pub struct SocksHandshake {
    /// Current state of the handshake. Each completed message
    /// advances the state.
    state: State,
    /// Completed SOCKS request.
    request: Option<SocksRequest>,
}

/// Possible state for a Socks connection.
///
/// Each completed message advances the state.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
enum State {
    /// Starting state: waiting for the client's list of methods.
    Initial,
    /// We've agreed on "no authentication", and we're waiting for the
    /// actual request.
    Authenticated,
    /// Ending (successful) state: the client has sent all its messages.
    ///
    /// (Note that we still need to send a reply.)
    Done,
    /// The client sent something we had to reject.
    Failed,
}

/// An action to take in response to a SOCKS handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Action {
    /// If nonzero, this many bytes should be drained from the
    /// client's inputs.
    pub drain: usize,
    /// If nonempty, this reply should be sent to the client.
    pub reply: Vec<u8>,
    /// If true, then this handshake is over, successfully.
    pub finished: bool,
}

impl SocksHandshake {
    /// Construct a new SocksHandshake in its initial state
    pub fn new() -> Self {
        SocksHandshake {
            state: State::Initial,
            request: None,
        }
    }

    /// Try to advance a SocksHandshake, given some client input in
    /// `input`.
    ///
    /// If there isn't enough input, gives [Error::Truncated], and the
    /// caller should try again with the same bytes plus whatever else
    /// arrives.  Other errors indicate a failure: see [Error::reply] for
    /// what (if anything) to tell the client before hanging up.
    ///
    /// On success, return an Action describing what to tell the client,
    /// and how much of its input to consume.
    pub fn handshake(&mut self, input: &[u8]) -> Result<Action> {
        let result = match self.state {
            State::Initial => self.negotiate(input),
            State::Authenticated => self.request(input),
            State::Done | State::Failed => return Err(Error::AlreadyFinished),
        };
        match &result {
            Err(Error::Truncated) | Ok(_) => {}
            Err(_) => self.state = State::Failed,
        }
        result
    }

    /// Negotiate the authentication method.
    ///
    /// We only ever accept "no authentication".
    fn negotiate(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);
        let version = r.take_u8()?;
        if version != SOCKS_VERSION {
            return Err(Error::BadProtocol(version));
        }
        let nmethods = r.take_u8()?;
        let methods = r.take(nmethods as usize)?;

        if !methods.contains(&AuthMethod::NO_AUTHENTICATION.into()) {
            return Err(Error::NoAcceptableMethod);
        }

        self.state = State::Authenticated;
        Ok(Action {
            drain: r.consumed(),
            reply: vec![SOCKS_VERSION, AuthMethod::NO_AUTHENTICATION.into()],
            finished: false,
        })
    }

    /// Receive the client's request.
    ///
    /// The command and address type are checked as soon as the four
    /// header bytes are here, so that an unsupported request is rejected
    /// without waiting for an address we would never use.
    fn request(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);
        r.need(4)?;

        let version = r.take_u8()?;
        if version != SOCKS_VERSION {
            return Err(Error::BadProtocol(version));
        }
        let cmd: SocksCmd = r.take_u8()?.into();
        if cmd != SocksCmd::CONNECT {
            return Err(Error::CommandNotSupported(cmd));
        }
        let _reserved = r.take_u8()?;
        let atype: AddrType = r.take_u8()?.into();

        let addr = match atype {
            AddrType::IPV4 => SocksAddr::Ip(r.take_ipv4()?.into()),
            AddrType::IPV6 => SocksAddr::Ip(r.take_ipv6()?.into()),
            AddrType::HOSTNAME => {
                let hlen = r.take_u8()?;
                let hostname = r.take(hlen as usize)?;
                let hostname = std::str::from_utf8(hostname)
                    .map_err(|_| Error::BadHostname)?
                    .to_string();
                SocksAddr::Hostname(hostname.try_into()?)
            }
            other => return Err(Error::AddrTypeNotSupported(other)),
        };
        let port = r.take_u16()?;

        let request = SocksRequest::new(version, cmd, addr, port)?;

        self.state = State::Done;
        self.request = Some(request);

        Ok(Action {
            drain: r.consumed(),
            reply: Vec::new(),
            finished: true,
        })
    }

    /// Return true if this handshake is finished.
    pub fn finished(&self) -> bool {
        self.state == State::Done
    }

    /// Consume this handshake's state; if it finished successfully,
    /// return a SocksRequest.
    pub fn into_request(self) -> Option<SocksRequest> {
        self.request
    }
}

impl Default for SocksHandshake {
    fn default() -> Self {
        Self::new()
    }
}
