use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Interval between predicate evaluations.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WaitError<E: std::error::Error> {
    #[error("condition not met within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Probe(E),
}

impl<E: std::error::Error> WaitError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout(_))
    }
}

/// Repeatedly evaluates `probe` until it reports true or `timeout` elapses.
///
/// The probe is evaluated immediately, then once per [`POLL_INTERVAL`]. A probe
/// error aborts the wait right away; diagnostic context (browser console logs
/// and the like) is the caller's responsibility to attach on timeout.
pub fn wait_until<E, F>(mut probe: F, timeout: Duration) -> Result<(), WaitError<E>>
where
    E: std::error::Error,
    F: FnMut() -> Result<bool, E>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().map_err(WaitError::Probe)? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn returns_as_soon_as_the_probe_is_true() {
        let start = Instant::now();
        let mut calls = 0u32;
        wait_until::<Infallible, _>(
            || {
                calls += 1;
                Ok(calls > 1)
            },
            Duration::from_secs(20),
        )
        .expect("probe became true");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls, 2);
    }

    #[test]
    fn times_out_only_after_the_deadline() {
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let err = wait_until::<Infallible, _>(|| Ok(false), timeout)
            .expect_err("probe never became true");
        assert!(err.is_timeout());
        assert!(start.elapsed() >= timeout);
    }

    #[test]
    fn probe_errors_abort_the_wait() {
        let start = Instant::now();
        let err = wait_until(
            || Err::<bool, _>(std::io::Error::new(std::io::ErrorKind::Other, "probe broke")),
            Duration::from_secs(20),
        )
        .expect_err("probe error should propagate");
        assert!(matches!(err, WaitError::Probe(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
