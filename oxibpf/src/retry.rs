//! Exponential backoff around a fallible operation whose errors are
//! classified as [`crate::error::ErrnoKind::Transient`]. Callers opt in
//! explicitly; nothing in this crate retries implicitly.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use std::thread::sleep;
use std::time::Duration;

/// Call `f` up to `cfg.max_attempts` times, sleeping with exponential
/// backoff between attempts, as long as the returned error is retryable.
/// The first non-retryable error, or the last retryable one once attempts
/// are exhausted, is returned to the caller.
pub fn with_backoff<T>(cfg: &RetryConfig, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(cfg.base_delay_ms);
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < cfg.max_attempts => {
                attempt += 1;
                log::debug!("retrying after transient error (attempt {attempt}/{}): {e}", cfg.max_attempts);
                sleep(delay);
                delay = delay.mul_f64(cfg.backoff_factor);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrnoKind, Errno};
    use std::cell::Cell;

    fn transient_err() -> Error {
        Error::SyscallFailed {
            op: "test",
            kind: ErrnoKind::Transient,
            errno: Errno(libc::EAGAIN),
            source: std::io::Error::from_raw_os_error(libc::EAGAIN),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let cfg = RetryConfig { max_attempts: 3, base_delay_ms: 1, backoff_factor: 1.0 };
        let calls = Cell::new(0);
        let result = with_backoff(&cfg, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(transient_err()) } else { Ok(42) }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let cfg = RetryConfig { max_attempts: 2, base_delay_ms: 1, backoff_factor: 1.0 };
        let calls = Cell::new(0);
        let result = with_backoff(&cfg, || {
            calls.set(calls.get() + 1);
            Err::<(), _>(transient_err())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn non_retryable_error_stops_immediately() {
        let cfg = RetryConfig { max_attempts: 5, base_delay_ms: 1, backoff_factor: 1.0 };
        let calls = Cell::new(0);
        let result = with_backoff(&cfg, || {
            calls.set(calls.get() + 1);
            Err::<(), _>(Error::UsageError("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
