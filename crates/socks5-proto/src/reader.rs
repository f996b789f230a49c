//! Pull SOCKS messages out of a byte slice, using [`bytes::Buf`].

use crate::{Error, Result};

use bytes::Buf;
use std::net::{Ipv4Addr, Ipv6Addr};

/// A cursor over a slice of client input.
///
/// Every `take_*` method either consumes exactly what it needs, or fails
/// with [Error::Truncated] without consuming anything, so that the
/// caller can come back once more bytes have arrived.  Multi-byte values
/// are big-endian, as [`Buf`] reads them.
pub(crate) struct Reader<'a> {
    /// The part of the input we haven't read yet.
    buf: &'a [u8],
    /// Length of the whole input.
    total: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader from a slice of bytes.
    pub(crate) fn from_slice(slice: &'a [u8]) -> Self {
        Reader {
            buf: slice,
            total: slice.len(),
        }
    }
    /// Return the number of bytes that have not yet been read.
    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }
    /// Return the number of bytes that have already been read.
    pub(crate) fn consumed(&self) -> usize {
        self.total - self.buf.remaining()
    }
    /// Fail with [Error::Truncated] unless at least `n` more bytes are
    /// available.
    pub(crate) fn need(&self, n: usize) -> Result<()> {
        if n > self.buf.remaining() {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }
    /// Consume and return a slice of `n` bytes.
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
    /// Consume and return a single byte.
    pub(crate) fn take_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }
    /// Consume and return a big-endian u16.
    pub(crate) fn take_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }
    /// Consume and return an IPv4 address.
    pub(crate) fn take_ipv4(&mut self) -> Result<Ipv4Addr> {
        self.need(4)?;
        Ok(self.buf.get_u32().into())
    }
    /// Consume and return an IPv6 address.
    pub(crate) fn take_ipv6(&mut self) -> Result<Ipv6Addr> {
        self.need(16)?;
        Ok(self.buf.get_u128().into())
    }
}
