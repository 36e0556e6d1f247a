//! # Probes & Instrumentation
//!
//! Instrumentation is done via the [Probe] trait. Implementations
//! will always be shared via an [Arc](std::sync::Arc) internally.
//!
//! A probe can be attached to an individual transfer or globally
//! via a [ProbeFactory] which creates one probe per transfer.
//!
//! ```
//! # use std::time::Duration;
//! # use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
//! use partlift_core::probe::Probe;
//!
//! struct MyProbe {
//!     bytes_transferred: Arc<AtomicU64>,
//! }
//!
//! // Methods of Probe have noop default implementations
//! impl Probe for MyProbe {
//!     fn part_completed(&self, _part_number: u32, n_bytes: u64, _time: Duration) {
//!         self.bytes_transferred.fetch_add(n_bytes, Ordering::SeqCst);
//!     }
//! }
//! ```
use std::{fmt, time::Duration};

use crate::{errors::TransferError, InclusiveRange};

pub use simple_reporter::*;

pub trait ProbeFactory: Send + Sync + 'static {
    type Probe: Probe + Clone + Send + Sync + 'static;

    /// Create a new [Probe] for a transfer
    ///
    /// It might share state with the factory or not
    fn make(&self, object_name: &dyn fmt::Display) -> Self::Probe;
}

/// A Probe is an interface to track occurrences of different kinds
///
/// All methods should return quickly to not influence the transfer
/// too much with measuring.
#[allow(unused_variables)]
pub trait Probe: Send + Sync + 'static {
    /// The transfer machinery started
    fn transfer_started(&self) {}

    /// **This always is the last method called on a [Probe] if the transfer succeeded.**
    fn transfer_completed(&self, time: Duration) {}

    /// **This always is the last method called on a [Probe] if the transfer failed.**
    fn transfer_failed(&self, time: Option<Duration>) {}

    /// A part failed but the worker will retry it
    fn retry_attempt(&self, error: &TransferError, part_number: u32, next_in: Duration) {}

    /// A worker hit an expired token and triggered a re-authorization
    fn reauth_attempt(&self, part_number: u32) {}

    /// Transfer of a part has started
    fn part_started(&self, part_number: u32, range: InclusiveRange) {}

    /// Transfer of a part was completed
    fn part_completed(&self, part_number: u32, n_bytes: u64, time: Duration) {}

    /// Transfer of a part failed without a retry
    fn part_failed(&self, error: &TransferError, part_number: u32, range: &InclusiveRange) {}

    /// The governor changed the number of active workers
    fn concurrency_changed(&self, from: usize, to: usize) {}

    /// A panic was detected
    ///
    /// Unless from a bug in this library it is most likely caused by the
    /// [ObjectClient](crate::object_client::ObjectClient) implementation
    fn panic_detected(&self, msg: &str) {}
}

impl Probe for () {}

impl ProbeFactory for () {
    type Probe = ();

    fn make(&self, _object_name: &dyn fmt::Display) -> Self::Probe {}
}

mod simple_reporter {
    //! Simple reporting with (mostly) counters

    use std::{
        fmt,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::{Duration, Instant},
    };

    use crate::errors::TransferError;

    use super::Probe;

    /// A `SimpleReporter` collects metrics and creates a [SimpleReport]
    #[derive(Clone)]
    pub struct SimpleReporter {
        inner: Arc<Inner>,
    }

    impl SimpleReporter {
        pub fn new(object_name: &dyn fmt::Display) -> Self {
            SimpleReporter {
                inner: Arc::new(Inner::new(object_name.to_string())),
            }
        }

        /// Returns true once the transfer is finished
        ///
        /// As long as this method does not return `true` values in the
        /// [SimpleReport] will change.
        pub fn is_transfer_finished(&self) -> bool {
            self.inner.lock_finished_at().is_some()
        }

        /// Get a [SimpleReport].
        ///
        /// Takes a snapshot. A transfer might still be running when a
        /// snapshot is taken.
        pub fn report(&self) -> SimpleReport {
            let inner = self.inner.as_ref();

            let started_at = *match inner.started_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let transfer_time = if let Some(finished_at) = inner.lock_finished_at() {
                finished_at - started_at
            } else {
                Instant::now() - started_at
            };

            let n_bytes_transferred = inner.n_bytes_transferred.load(Ordering::SeqCst);
            let bytes_per_second_f64 = if n_bytes_transferred > 0 {
                n_bytes_transferred as f64 / transfer_time.as_secs_f64()
            } else {
                0.0
            };

            SimpleReport {
                object_name: inner.object_name.clone(),
                is_finished: self.is_transfer_finished(),
                is_failed: inner.is_failed.load(Ordering::SeqCst),
                n_retries: inner.n_retries.load(Ordering::SeqCst),
                n_reauths: inner.n_reauths.load(Ordering::SeqCst),
                n_panics: inner.n_panics_detected.load(Ordering::SeqCst),
                transfer_time,
                bytes_per_second: bytes_per_second_f64 as u64,
                mebibytes_per_second: bytes_per_second_f64 / 1_048_576.0,
                n_bytes_transferred,
                n_parts_transferred: inner.n_parts_transferred.load(Ordering::SeqCst),
                n_concurrency_changes: inner.n_concurrency_changes.load(Ordering::SeqCst),
            }
        }
    }

    impl Default for SimpleReporter {
        fn default() -> Self {
            Self::new(&"unknown")
        }
    }

    #[derive(Debug, Clone)]
    pub struct SimpleReport {
        pub object_name: String,
        /// `true` if the transfer was finished
        pub is_finished: bool,
        pub is_failed: bool,
        pub n_retries: usize,
        pub n_reauths: usize,
        pub n_panics: usize,
        /// If the transfer is not yet finished, this is the time
        /// elapsed since the start of the transfer.
        pub transfer_time: Duration,
        pub bytes_per_second: u64,
        pub mebibytes_per_second: f64,
        pub n_bytes_transferred: u64,
        pub n_parts_transferred: u64,
        pub n_concurrency_changes: usize,
    }

    struct Inner {
        object_name: String,
        started_at: Mutex<Instant>,
        finished_at: Mutex<Option<Instant>>,
        is_failed: AtomicBool,
        n_retries: AtomicUsize,
        n_reauths: AtomicUsize,
        n_panics_detected: AtomicUsize,
        n_bytes_transferred: AtomicU64,
        n_parts_transferred: AtomicU64,
        n_concurrency_changes: AtomicUsize,
    }

    impl Inner {
        fn new(object_name: String) -> Self {
            Inner {
                object_name,
                started_at: Mutex::new(Instant::now()),
                finished_at: Mutex::new(None),
                is_failed: AtomicBool::new(false),
                n_retries: AtomicUsize::new(0),
                n_reauths: AtomicUsize::new(0),
                n_panics_detected: AtomicUsize::new(0),
                n_bytes_transferred: AtomicU64::new(0),
                n_parts_transferred: AtomicU64::new(0),
                n_concurrency_changes: AtomicUsize::new(0),
            }
        }

        fn lock_finished_at(&self) -> Option<Instant> {
            *match self.finished_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }

        fn set_finished(&self) {
            let mut guard = match self.finished_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.is_none() {
                *guard = Some(Instant::now());
            }
        }
    }

    impl Probe for SimpleReporter {
        fn transfer_started(&self) {
            let mut guard = match self.inner.started_at.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Instant::now();
        }

        fn transfer_completed(&self, _time: Duration) {
            self.inner.set_finished();
        }

        fn transfer_failed(&self, _time: Option<Duration>) {
            self.inner.is_failed.store(true, Ordering::SeqCst);
            self.inner.set_finished();
        }

        fn retry_attempt(&self, _error: &TransferError, _part_number: u32, _next_in: Duration) {
            self.inner.n_retries.fetch_add(1, Ordering::SeqCst);
        }

        fn reauth_attempt(&self, _part_number: u32) {
            self.inner.n_reauths.fetch_add(1, Ordering::SeqCst);
        }

        fn part_completed(&self, _part_number: u32, n_bytes: u64, _time: Duration) {
            self.inner
                .n_bytes_transferred
                .fetch_add(n_bytes, Ordering::SeqCst);
            self.inner.n_parts_transferred.fetch_add(1, Ordering::SeqCst);
        }

        fn concurrency_changed(&self, _from: usize, _to: usize) {
            self.inner
                .n_concurrency_changes
                .fetch_add(1, Ordering::SeqCst);
        }

        fn panic_detected(&self, _msg: &str) {
            self.inner.n_panics_detected.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Creates [SimpleReporter]s which do not share any state
    pub struct SimpleReporterFactory;

    impl super::ProbeFactory for SimpleReporterFactory {
        type Probe = SimpleReporter;

        fn make(&self, object_name: &dyn fmt::Display) -> Self::Probe {
            SimpleReporter::new(object_name)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_probe_is_a_noop() {
        let probe = ();
        probe.transfer_started();
        probe.part_started(1, InclusiveRange(0, 9));
        probe.transfer_completed(Duration::from_secs(1));
    }
}
