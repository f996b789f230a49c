//! The server control loop: listeners, accepting, and pause/resume.
//!
//! A [`Server`] is a handle that can run any number of listeners, each
//! started with [`Server::listen_and_serve`].  Every running listener
//! feeds accepted connections through a bounded queue to its control
//! loop, which hands each one to a fresh connection task.
//!
//! [`Server::pause`] closes every listener without touching connections
//! that were already accepted; [`Server::resume`] opens them again on the
//! same addresses.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::conn::SocksConn;
use crate::deadline::DEFAULT_IDLE_TIMEOUT;
use crate::log::{Logger, PrefixLogger, TracingLogger};
use crate::policy::{DefaultRuler, Ruler};
use crate::resolve::{Resolver, ShuffleResolver, SystemResolver};
use crate::{Error, Result};

/// Default length of each listener's queue of accepted connections.
pub const DEFAULT_INTAKE_QUEUE: usize = 10;

/// Backlog passed to `listen(2)`.
const LISTEN_BACKLOG: i32 = 1024;

/// How long to stop accepting after running out of file descriptors or
/// memory, so that open connections get a chance to finish.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Tunable parameters for a [`Server`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerConfig {
    /// How long a socket may go without successful I/O before we give up
    /// on it.
    pub idle_timeout: Duration,
    /// How many accepted connections may wait for dispatch, per listener.
    pub intake_queue: usize,
    /// Local address to bind outbound connections to.
    ///
    /// If unset, outbound connections are bound to the address of the
    /// listener that accepted the client.
    pub outbound_addr: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            intake_queue: DEFAULT_INTAKE_QUEUE,
            outbound_addr: None,
        }
    }
}

/// The pluggable parts of a server, shared by every connection.
#[derive(Clone)]
pub(crate) struct Services {
    /// Turns hostnames into candidate addresses.
    pub(crate) resolver: Arc<dyn Resolver>,
    /// Where log messages go.
    pub(crate) logger: Arc<dyn Logger>,
    /// Decides which candidates we may connect to.
    pub(crate) ruler: Arc<dyn Ruler>,
}

impl Default for Services {
    fn default() -> Self {
        Services {
            resolver: Arc::new(SystemResolver),
            logger: Arc::new(TracingLogger),
            ruler: Arc::new(DefaultRuler),
        }
    }
}

/// What listeners should currently be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Accept connections.
    Run,
    /// Keep the listening socket closed.
    Pause,
}

/// Mutable state of a server.
#[derive(Default)]
struct State {
    /// Addresses of the listeners that are currently open.
    listening: Vec<SocketAddr>,
    /// Services to hand to new connections.
    services: Services,
}

/// Shared part of a [`Server`].
struct Inner {
    /// Parameters that never change.
    config: ServerConfig,
    /// State that the setters and listeners share.
    state: Mutex<State>,
    /// Broadcasts pause and resume to every control loop.
    control: watch::Sender<Control>,
}

impl Inner {
    /// Lock the state.
    ///
    /// Nothing we do while holding the lock can leave the state
    /// inconsistent, so a poisoned lock is still usable.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a copy of the current services.
    fn services(&self) -> Services {
        self.state().services.clone()
    }
}

/// A SOCKS5 server.
///
/// This is a cheap handle: clones share the same listeners,
/// configuration, and pause state.
#[derive(Clone)]
pub struct Server {
    /// The shared state.
    inner: Arc<Inner>,
}

impl Default for Server {
    fn default() -> Self {
        Server::new()
    }
}

impl Server {
    /// Create a server with the default configuration.
    ///
    /// It uses the system resolver, logs through `tracing`, and applies
    /// [`DefaultRuler`].
    pub fn new() -> Self {
        Server::with_config(ServerConfig::default())
    }

    /// Create a server with a given configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let (control, _) = watch::channel(Control::Run);
        Server {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                control,
            }),
        }
    }

    /// Use `resolver` to look up hostnames, shuffling the addresses it
    /// returns.
    ///
    /// Fails if any listener is running.
    pub fn set_resolver<R: Resolver + 'static>(&self, resolver: R) -> Result<()> {
        self.set_resolver_unshuffled(ShuffleResolver::new(resolver))
    }

    /// Use `resolver` to look up hostnames, trying the addresses in the
    /// order it returns them.
    ///
    /// Fails if any listener is running.
    pub fn set_resolver_unshuffled<R: Resolver + 'static>(&self, resolver: R) -> Result<()> {
        self.update("resolver", |s| s.resolver = Arc::new(resolver))
    }

    /// Send log messages to `logger`.
    ///
    /// Fails if any listener is running.
    pub fn set_logger<L: Logger + 'static>(&self, logger: L) -> Result<()> {
        self.update("logger", |s| s.logger = Arc::new(logger))
    }

    /// Use `ruler` to decide which destinations clients may reach.
    ///
    /// Fails if any listener is running.
    pub fn set_ruler<R: Ruler + 'static>(&self, ruler: R) -> Result<()> {
        self.update("ruler", |s| s.ruler = Arc::new(ruler))
    }

    /// Apply `f` to our services, unless a listener is running.
    fn update(&self, what: &'static str, f: impl FnOnce(&mut Services)) -> Result<()> {
        let mut state = self.inner.state();
        if !state.listening.is_empty() {
            return Err(Error::AlreadyListening(what));
        }
        f(&mut state.services);
        Ok(())
    }

    /// Return the number of listeners that are currently open.
    pub fn active_instances(&self) -> usize {
        self.inner.state().listening.len()
    }

    /// Return the addresses of the listeners that are currently open.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.state().listening.clone()
    }

    /// Stop accepting connections on every listener.
    ///
    /// Connections that were already accepted are still served.
    pub fn pause(&self) {
        self.inner.control.send_replace(Control::Pause);
    }

    /// Start accepting connections again on every paused listener.
    pub fn resume(&self) {
        self.inner.control.send_replace(Control::Run);
    }

    /// Listen on `ip`:`port` and serve SOCKS clients.
    ///
    /// This runs until the listener fails: either we can't (re)open it, or
    /// accepting hits an error that retrying won't fix.  Call it from its
    /// own task.
    ///
    /// If `port` is 0, the port picked by the system is kept across pause
    /// and resume.
    pub async fn listen_and_serve(&self, ip: IpAddr, port: u16) -> Result<()> {
        let log = PrefixLogger::new(
            format!("[{}]:{}", ip, port),
            self.inner.services().logger,
        );
        log.info(format_args!("Starting SOCKS server"));

        let mut control = self.inner.control.subscribe();
        // A pause from before we started doesn't apply to us.
        control.borrow_and_update();

        let (intake_tx, mut intake) = mpsc::channel(self.inner.config.intake_queue.max(1));
        let first = self.open(SocketAddr::new(ip, port), intake_tx.clone()).await?;
        let addr = first.addr;
        let mut listener = Some(first);

        loop {
            tokio::select! {
                accepted = intake.recv() => match accepted {
                    Some(Ok((stream, peer))) => self.dispatch(stream, peer, ip),
                    Some(Err(e)) => return Err(e),
                    // We hold a sender ourselves.
                    None => return Err(Error::Internal("intake queue closed")),
                },
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(Error::Internal("control channel closed"));
                    }
                    let wanted = *control.borrow_and_update();
                    match (wanted, listener.take()) {
                        (Control::Pause, Some(open)) => {
                            open.close().await;
                            log.info(format_args!("Paused"));
                        }
                        (Control::Run, None) => {
                            listener = Some(self.open(addr, intake_tx.clone()).await?);
                            log.info(format_args!("Resumed"));
                        }
                        (_, unchanged) => listener = unchanged,
                    }
                }
            }
        }
    }

    /// Open a listener on `addr` and start a task that feeds `intake`.
    async fn open(
        &self,
        addr: SocketAddr,
        intake: mpsc::Sender<Result<Accepted>>,
    ) -> Result<OpenListener> {
        let listen_err = |e| Error::Listen {
            addr,
            source: Arc::new(e),
        };
        let listener = bind(addr).map_err(listen_err)?;
        let addr = listener.local_addr().map_err(listen_err)?;

        let log = PrefixLogger::new(format!("[{}]", addr), self.inner.services().logger);
        log.info(format_args!("Listening"));
        let task = tokio::spawn(accept_loop(listener, addr, intake, log));

        self.inner.state().listening.push(addr);
        Ok(OpenListener {
            addr,
            task,
            server: Arc::clone(&self.inner),
        })
    }

    /// Hand an accepted connection to a new connection task.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, listen_ip: IpAddr) {
        let config = &self.inner.config;
        let outbound_ip = config.outbound_addr.unwrap_or(listen_ip);
        let conn = SocksConn::new(
            stream,
            peer,
            outbound_ip,
            config.idle_timeout,
            self.inner.services(),
        );
        tokio::spawn(conn.serve());
    }
}

/// A connection from an accept task: the stream and the client's address.
type Accepted = (TcpStream, SocketAddr);

/// A listener that is open and has an accept task running.
///
/// Dropping this stops the task and takes the listener out of the
/// server's count.
struct OpenListener {
    /// The bound address.
    addr: SocketAddr,
    /// The task accepting on the listener.
    task: JoinHandle<()>,
    /// The server this listener is counted in.
    server: Arc<Inner>,
}

impl OpenListener {
    /// Stop accepting, and wait until the listening socket is closed.
    async fn close(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for OpenListener {
    fn drop(&mut self) {
        self.task.abort();
        let mut state = self.server.state();
        if let Some(pos) = state.listening.iter().position(|a| *a == self.addr) {
            state.listening.swap_remove(pos);
        }
    }
}

/// Open a listening socket on `addr`.
///
/// The address can be reused right away, so resuming a paused listener
/// doesn't trip over connections in `TIME_WAIT`.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Accept connections on `listener` and push them onto `intake`.
///
/// Transient errors are logged and skipped; when they mean we're out of
/// some resource, we wait a little before accepting again.  Any other
/// error is pushed onto the queue, and ends the loop.
async fn accept_loop(
    listener: TcpListener,
    addr: SocketAddr,
    intake: mpsc::Sender<Result<Accepted>>,
    log: PrefixLogger,
) {
    loop {
        let item = match listener.accept().await {
            Ok(accepted) => Ok(accepted),
            Err(e) if is_resource_exhaustion(&e) => {
                log.warn(format_args!("Error while accepting: {}", e));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            Err(e) if is_transient_accept(&e) => {
                log.debug(format_args!("Error while accepting: {}", e));
                continue;
            }
            Err(e) => {
                log.warn(format_args!("Listener failed: {}", e));
                Err(Error::Accept {
                    addr,
                    source: Arc::new(e),
                })
            }
        };
        let fatal = item.is_err();
        if intake.send(item).await.is_err() || fatal {
            return;
        }
    }
}

/// Return true if an accept error will go away by itself: it concerns
/// one connection attempt only, or a resource that is exhausted for now.
fn is_transient_accept(e: &io::Error) -> bool {
    use io::ErrorKind as K;
    is_resource_exhaustion(e)
        || matches!(
            e.kind(),
            K::ConnectionAborted | K::ConnectionReset | K::Interrupted | K::WouldBlock | K::TimedOut
        )
}

/// Return true if `e` says we're out of file descriptors, buffers or
/// memory.
#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Return true if `e` says we're out of memory.
#[cfg(not(unix))]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::OutOfMemory
}
