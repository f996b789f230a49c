//! A rolling I/O deadline.
//!
//! Every socket operation on a connection must finish before the
//! connection has been idle for too long.  "Idle" is measured from the
//! last operation that succeeded: failures and timeouts don't push the
//! deadline back.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Error, Result};

/// How long a connection may go without successful I/O, unless
/// configured otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Tracks when a connection last did something useful.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    /// How long we allow between successful operations.
    idle: Duration,
    /// When the last successful operation finished.
    last_io: Instant,
}

impl Deadline {
    /// Start a new deadline, counting from now.
    pub(crate) fn new(idle: Duration) -> Self {
        Deadline {
            idle,
            last_io: Instant::now(),
        }
    }

    /// Return the instant at which the current operation gives up.
    pub(crate) fn expires(&self) -> Instant {
        self.last_io + self.idle
    }

    /// Record a successful operation.
    pub(crate) fn refresh(&mut self) {
        self.last_io = Instant::now();
    }

    /// Run `fut`, an I/O operation described by `action`, bounded by this
    /// deadline.
    ///
    /// The deadline is refreshed if the operation succeeds.  An operation
    /// that fails (or runs out of time) leaves it untouched.
    pub(crate) async fn run<F, T>(&mut self, action: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout_at(self.expires(), fut).await {
            Ok(Ok(v)) => {
                self.refresh();
                Ok(v)
            }
            Ok(Err(e)) => Err(Error::io(action, e)),
            Err(_elapsed) => Err(Error::Timeout(action)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn refreshed_only_on_success() {
        let mut d = Deadline::new(Duration::from_secs(10));
        let start = d.expires();

        tokio::time::advance(Duration::from_secs(4)).await;
        let v = d.run("waiting", async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
        assert_eq!(d.expires(), start + Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(3)).await;
        let e = d
            .run("failing", async {
                Err::<(), _>(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            })
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Io { action: "failing", .. }));
        assert_eq!(d.expires(), start + Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let mut d = Deadline::new(Duration::from_secs(10));
        let e = d
            .run("sleeping", async {
                tokio::time::sleep(Duration::from_secs(11)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Timeout("sleeping")));
    }
}
