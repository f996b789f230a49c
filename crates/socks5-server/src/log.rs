//! The logging capability injected into a [`Server`](crate::Server).
//!
//! The server never writes log lines on its own account: everything it
//! has to say about connections goes through a [`Logger`], so that an
//! embedding application can route, prefix, or silence it.  The default,
//! [`TracingLogger`], hands messages to `tracing`.

use std::fmt;
use std::sync::Arc;

use tracing::Level;

/// A sink for log messages.
pub trait Logger: Send + Sync {
    /// Emit `msg` at `level`.
    fn log(&self, level: Level, msg: fmt::Arguments<'_>);
}

/// A [`Logger`] that emits `tracing` events with the target `socks5d`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, msg: fmt::Arguments<'_>) {
        // The tracing macros need a constant level.
        match level {
            Level::ERROR => tracing::error!(target: "socks5d", "{}", msg),
            Level::WARN => tracing::warn!(target: "socks5d", "{}", msg),
            Level::INFO => tracing::info!(target: "socks5d", "{}", msg),
            Level::DEBUG => tracing::debug!(target: "socks5d", "{}", msg),
            _ => tracing::trace!(target: "socks5d", "{}", msg),
        }
    }
}

/// A [`Logger`] that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _msg: fmt::Arguments<'_>) {}
}

/// Wraps another [`Logger`], putting a fixed prefix in front of every
/// message.
#[derive(Clone)]
pub struct PrefixLogger {
    /// Text to put before each message.
    prefix: String,
    /// Where the prefixed messages go.
    inner: Arc<dyn Logger>,
}

impl PrefixLogger {
    /// Return a new PrefixLogger that sends `"{prefix} - {msg}"` to `inner`.
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Logger>) -> Self {
        PrefixLogger {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Return the prefix used by this logger.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Log `msg` at INFO.
    pub(crate) fn info(&self, msg: fmt::Arguments<'_>) {
        self.log(Level::INFO, msg);
    }

    /// Log `msg` at DEBUG.
    pub(crate) fn debug(&self, msg: fmt::Arguments<'_>) {
        self.log(Level::DEBUG, msg);
    }

    /// Log `msg` at WARN.
    pub(crate) fn warn(&self, msg: fmt::Arguments<'_>) {
        self.log(Level::WARN, msg);
    }
}

impl Logger for PrefixLogger {
    fn log(&self, level: Level, msg: fmt::Arguments<'_>) {
        self.inner
            .log(level, format_args!("{} - {}", self.prefix, msg));
    }
}

impl fmt::Debug for PrefixLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixLogger")
            .field("prefix", &self.prefix)
            .finish()
    }
}
