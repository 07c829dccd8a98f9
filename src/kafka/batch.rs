//! Batched waiting on producer acknowledgements.
//!
//! [`BatchSender`] accumulates the completion handles of sent records and
//! periodically synchronizes on them so the number of unacknowledged sends
//! stays bounded.  Two waiting modes exist:
//!
//! * **strict**, [`BatchSender::flush`]: any failure surfaces as a
//!   [`FlushError`]; the buffer is kept so the caller can retry.
//! * **silent**, [`BatchSender::try_flush`] and the threshold-triggered
//!   auto-flush inside [`BatchSender::add`]: failures report `false` and are
//!   counted; after a failed auto-flush further auto-flushes are suspended
//!   until some flush succeeds, so a degraded broker does not stall the hot
//!   path on every append.
//!
//! A single instance is owned by one replication pass and is deliberately
//! not shareable; see the crate docs for the threading model.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use rdkafka::error::KafkaError;
use thiserror::Error;
use tracing::{debug, warn};

use super::{DeliveryHandle, HandleWait};

/// A flush pass failed.
#[derive(Debug, Error)]
pub enum FlushError {
    /// The batch-wide deadline expired before every handle resolved.
    #[error("timed out after {timeout_ms} ms waiting for broker acknowledgements ({pending} pending)")]
    Timeout { timeout_ms: u64, pending: usize },

    /// The broker rejected a record.
    #[error("record delivery failed: {0}")]
    Delivery(#[from] KafkaError),

    /// A delivery notification channel closed without an outcome (the
    /// producer was torn down mid-flight).
    #[error("delivery notification channel disconnected")]
    Disconnected,
}

/// Buffer of pending completion handles with threshold-triggered waits.
pub struct BatchSender {
    pending: Vec<DeliveryHandle>,
    await_every: usize,
    await_timeout: Duration,
    counters_enabled: bool,
    debug_on_failure: bool,
    confirmed: u64,
    flushes: u64,
    failed_flushes: u64,
    auto_flush_suspended: bool,
}

impl BatchSender {
    /// Counters and failure debugging disabled.
    pub fn new(await_every: usize, await_timeout: Duration) -> Self {
        Self::with_flags(await_every, await_timeout, false, false)
    }

    /// Panics when `await_every` is zero or `await_timeout` is zero; both
    /// bounds are validated by the configuration layer first.
    pub fn with_flags(
        await_every: usize,
        await_timeout: Duration,
        counters_enabled: bool,
        debug_on_failure: bool,
    ) -> Self {
        assert!(await_every > 0, "await_every must be > 0");
        assert!(!await_timeout.is_zero(), "await_timeout must be > 0");
        Self {
            pending: Vec::with_capacity(await_every),
            await_every,
            await_timeout,
            counters_enabled,
            debug_on_failure,
            confirmed: 0,
            flushes: 0,
            failed_flushes: 0,
            auto_flush_suspended: false,
        }
    }

    /// Appends a handle.  Reaching the threshold triggers a silent flush;
    /// a failed silent flush suspends further auto-flushes until the next
    /// successful flush.
    pub fn add(&mut self, handle: DeliveryHandle) {
        self.pending.push(handle);
        if self.pending.len() >= self.await_every && !self.auto_flush_suspended {
            if !self.quiet_flush("add") {
                self.auto_flush_suspended = true;
            }
        }
    }

    /// Batched append.  Behaves exactly like a sequence of [`Self::add`]
    /// calls but checks the threshold by countdown instead of re-reading the
    /// buffer length; the trailing remainder below the threshold stays
    /// buffered.
    pub fn add_all(&mut self, handles: Vec<DeliveryHandle>) {
        if handles.is_empty() {
            return;
        }
        self.pending.reserve(handles.len());

        let mut remaining_to_threshold = if self.auto_flush_suspended {
            usize::MAX
        } else {
            let remaining = self.await_every.saturating_sub(self.pending.len());
            if remaining > 0 {
                remaining
            } else {
                self.try_auto_quiet_flush("add_all/pre")
            }
        };

        for handle in handles {
            self.pending.push(handle);
            remaining_to_threshold -= 1;
            if remaining_to_threshold == 0 {
                remaining_to_threshold = if self.auto_flush_suspended {
                    usize::MAX
                } else {
                    self.try_auto_quiet_flush("add_all/iter")
                };
            }
        }
    }

    /// Silent flush for the auto-flush path; returns the new countdown to
    /// the next threshold.
    fn try_auto_quiet_flush(&mut self, site: &str) -> usize {
        if self.quiet_flush(site) {
            self.await_every
        } else {
            self.auto_flush_suspended = true;
            usize::MAX
        }
    }

    /// Strict flush: waits for every pending handle under one batch-wide
    /// deadline.  On success the buffer is cleared and auto-flush
    /// suspension lifted; on failure the buffer is kept for a retry.
    pub fn flush(&mut self) -> Result<(), FlushError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let n = self.pending.len();
        self.wait_all()?;
        self.pending.clear();
        self.auto_flush_suspended = false;
        if self.counters_enabled {
            self.flushes += 1;
            self.confirmed += n as u64;
        }
        Ok(())
    }

    /// Silent flush: same waiting semantics as [`Self::flush`], but failures
    /// only count and report `false`.
    pub fn try_flush(&mut self) -> bool {
        self.quiet_flush("try_flush")
    }

    fn quiet_flush(&mut self, site: &str) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let n = self.pending.len();
        match self.wait_all() {
            Ok(()) => {
                self.pending.clear();
                self.auto_flush_suspended = false;
                if self.counters_enabled {
                    self.flushes += 1;
                    self.confirmed += n as u64;
                }
                true
            }
            Err(error) => {
                if self.counters_enabled {
                    self.failed_flushes += 1;
                }
                if self.debug_on_failure {
                    debug!(site, size = n, %error, "silent flush failed");
                }
                false
            }
        }
    }

    /// Waits for every pending handle with one shared deadline.  The buffer
    /// is left untouched; memoized handle outcomes make a later retry
    /// observe the same results without re-waiting.
    fn wait_all(&mut self) -> Result<(), FlushError> {
        let timeout_ms = self.await_timeout.as_millis() as u64;
        let pending = self.pending.len();
        let deadline = Instant::now() + self.await_timeout;
        for handle in &mut self.pending {
            wait_one(handle, deadline, timeout_ms, pending)?;
        }
        Ok(())
    }

    /// Diagnostic pass: waits handle by handle and reports the first
    /// failure.  The buffer, the counters and the suspension flag are left
    /// untouched.
    pub fn flush_up_to_first_failure(&mut self) -> Result<usize, FlushError> {
        let timeout_ms = self.await_timeout.as_millis() as u64;
        let pending = self.pending.len();
        let deadline = Instant::now() + self.await_timeout;
        let debug_enabled = self.debug_on_failure;
        let mut ok = 0usize;
        for handle in &mut self.pending {
            if let Err(error) = wait_one(handle, deadline, timeout_ms, pending) {
                if debug_enabled {
                    debug!(confirmed = ok, %error, "first failure during diagnostic flush");
                }
                return Err(error);
            }
            ok += 1;
        }
        Ok(ok)
    }

    /// Consumes the sender with a final strict flush.
    pub fn close(mut self) -> Result<(), FlushError> {
        self.flush()
    }

    /// Handles buffered and not yet confirmed.  This is the local buffer
    /// size, not the broker-side in-flight count.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn await_every(&self) -> usize {
        self.await_every
    }

    pub fn await_timeout(&self) -> Duration {
        self.await_timeout
    }

    pub fn counters_enabled(&self) -> bool {
        self.counters_enabled
    }

    pub fn debug_on_failure_enabled(&self) -> bool {
        self.debug_on_failure
    }

    pub fn auto_flush_suspended(&self) -> bool {
        self.auto_flush_suspended
    }

    /// Confirmations accumulated over successful flushes.
    pub fn confirmed_count(&self) -> u64 {
        self.confirmed
    }

    /// Successful flush passes.
    pub fn flush_calls(&self) -> u64 {
        self.flushes
    }

    /// Failed silent flush passes.
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes
    }

    pub fn reset_counters(&mut self) {
        self.confirmed = 0;
        self.flushes = 0;
        self.failed_flushes = 0;
    }
}

fn wait_one(
    handle: &mut DeliveryHandle,
    deadline: Instant,
    timeout_ms: u64,
    pending: usize,
) -> Result<(), FlushError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(FlushError::Timeout { timeout_ms, pending });
    }
    match handle.wait_timeout(remaining) {
        HandleWait::Ready(Ok(_)) => Ok(()),
        HandleWait::Ready(Err(error)) => Err(FlushError::Delivery(error)),
        HandleWait::TimedOut => Err(FlushError::Timeout { timeout_ms, pending }),
        HandleWait::Disconnected => Err(FlushError::Disconnected),
    }
}

impl Drop for BatchSender {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "batch sender dropped with unconfirmed sends"
            );
        }
    }
}

impl Display for BatchSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BatchSender{{await_every={}, timeout_ms={}, buffered={}",
            self.await_every,
            self.await_timeout.as_millis(),
            self.pending.len()
        )?;
        if self.counters_enabled {
            write!(
                f,
                ", confirmed={}, flushes={}, failed_flushes={}",
                self.confirmed, self.flushes, self.failed_flushes
            )?;
        }
        write!(f, "}}")
    }
}
