//! Relay bytes between a client and its destination.
//!
//! Each direction is copied by its own task.  When a direction ends, for
//! whatever reason, it shuts down reading on its source and writing on
//! its destination, so that the far end sees EOF right away while the
//! other direction carries on.  The connection is closed once both
//! directions are done.

use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::deadline::Deadline;
use crate::log::PrefixLogger;
use crate::{Error, Result};

/// How much we try to read at once.
const BUF_SIZE: usize = 1 << 16;

/// Number of bytes moved in each direction by [`relay`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RelayStats {
    /// Bytes copied from the client to the upstream.
    pub(crate) upstream: u64,
    /// Bytes copied from the upstream to the client.
    pub(crate) downstream: u64,
}

/// Copy data between `client` and `upstream` until both directions have
/// finished, then close both.
pub(crate) async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    idle: Duration,
    log: &PrefixLogger,
) -> Result<RelayStats> {
    let (client_r, client_w) = client.into_split();
    let (upstream_r, upstream_w) = upstream.into_split();

    let up = tokio::spawn(copy_direction(client_r, upstream_w, idle, log.clone()));
    let down = tokio::spawn(copy_direction(upstream_r, client_w, idle, log.clone()));

    let (up, down) = futures::join!(up, down);
    let (client_r, upstream_w, upstream) =
        up.map_err(|_| Error::Internal("Relay task panicked"))?;
    let (upstream_r, client_w, downstream) =
        down.map_err(|_| Error::Internal("Relay task panicked"))?;

    // Both directions are finished: now the sockets can really go.
    drop((client_r, client_w, upstream_r, upstream_w));

    Ok(RelayStats {
        upstream,
        downstream,
    })
}

/// Copy from `reader` to `writer` until EOF, an error, or the reader
/// stays idle for longer than `idle`.
///
/// Returns both halves (so the caller decides when the sockets close) and
/// the number of bytes copied.
async fn copy_direction(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    idle: Duration,
    log: PrefixLogger,
) -> (OwnedReadHalf, OwnedWriteHalf, u64) {
    let mut buf = vec![0_u8; BUF_SIZE];
    let mut deadline = Deadline::new(idle);
    let mut total = 0_u64;

    let outcome: Result<()> = loop {
        let n = match deadline.run("reading", reader.read(&mut buf[..])).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = write_all_patiently(&mut writer, &buf[..n], idle, &mut deadline).await {
            break Err(e);
        }
        total += n as u64;
    };

    match outcome {
        Ok(()) => log.debug(format_args!("Closed one direction after {} bytes", total)),
        Err(e) => log.debug(format_args!("Closed one direction after {} bytes: {}", total, e)),
    }

    // Half-close: nothing more will be read from our source, or written
    // to our destination.  Errors here just mean the socket is already gone.
    let _ = socket2::SockRef::from(reader.as_ref()).shutdown(Shutdown::Read);
    let _ = writer.shutdown().await;

    (reader, writer, total)
}

/// Write all of `data` to `writer`.
///
/// Short writes, and errors that just mean "not now", are retried in
/// place.  Each attempt gets a full `idle` period; a successful write
/// refreshes `deadline`.
async fn write_all_patiently(
    writer: &mut OwnedWriteHalf,
    mut data: &[u8],
    idle: Duration,
    deadline: &mut Deadline,
) -> Result<()> {
    while !data.is_empty() {
        match tokio::time::timeout(idle, writer.write(data)).await {
            Ok(Ok(0)) => return Err(Error::io("writing", ErrorKind::WriteZero.into())),
            Ok(Ok(n)) => {
                deadline.refresh();
                data = &data[n..];
            }
            Ok(Err(e)) if is_transient(&e) => continue,
            Ok(Err(e)) => return Err(Error::io("writing", e)),
            // The reader on the other side is slow; keep waiting for it.
            Err(_elapsed) => continue,
        }
    }
    Ok(())
}

/// Return true if `e` says to try the same operation again.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}
