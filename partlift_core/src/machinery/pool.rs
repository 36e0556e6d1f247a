//! The worker pool transferring parts concurrently
//!
//! Workers pop [PartDescriptor]s from a shared stack, run them
//! through a [PartTransfer] and push the results into a channel.
//! Transient failures put the part back onto the stack so any
//! worker may pick it up again. A fatal failure trips the kill
//! switch and the pool winds down cooperatively.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    config::Config,
    errors::{TransferError, TransferErrorKind},
    planner::PartDescriptor,
    probe::Probe,
};

use super::{
    backoff::Backoff,
    governor::{Governor, WindowStats},
};

/// The actual operation a worker performs for one part
///
/// Implemented once for uploads and once for downloads. The `slot`
/// is the worker's index and lets an implementation keep per-worker
/// state such as upload targets.
pub(crate) trait PartTransfer: Clone + Send + Sync + 'static {
    type Payload: Send + 'static;

    fn transfer(
        &self,
        part: PartDescriptor,
        slot: usize,
    ) -> BoxFuture<'static, Result<Self::Payload, TransferError>>;

    /// Called once when a transfer attempt came back with
    /// [TransferErrorKind::ReauthRequired] before the attempt is
    /// repeated
    fn reauthorize(&self, slot: usize) -> BoxFuture<'static, Result<(), TransferError>>;
}

/// A successfully transferred part
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartResult<T> {
    pub part_number: u32,
    pub payload: T,
}

#[derive(Clone)]
pub(crate) struct KillSwitch {
    is_pushed: Arc<AtomicBool>,
    tripped: Arc<Notify>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            is_pushed: Arc::new(AtomicBool::new(false)),
            tripped: Arc::new(Notify::new()),
        }
    }

    /// Check whether cancellation of the transfer was requested
    pub fn is_pushed(&self) -> bool {
        self.is_pushed.load(Ordering::SeqCst)
    }

    /// Request cancellation of the transfer
    pub fn push_the_button(&self) {
        self.is_pushed.store(true, Ordering::SeqCst);
        self.tripped.notify_waiters();
    }

    /// Completes once the button was pushed
    pub async fn pushed(&self) {
        loop {
            let notified = self.tripped.notified();
            tokio::pin!(notified);
            // Register for notify_waiters before checking the flag,
            // otherwise a push landing in between is lost
            notified.as_mut().enable();
            if self.is_pushed() {
                return;
            }
            notified.await;
        }
    }
}

/// Rolling counters of a single worker, only ever mutated by the
/// worker owning the slot
#[derive(Debug, Default, Clone, Copy)]
struct WorkerStat {
    attempts: u64,
    successes: u64,
    failures: u64,
    sleeps: u64,
    sleep_secs: f64,
}

impl WorkerStat {
    fn take(&mut self) -> WorkerStat {
        std::mem::take(self)
    }
}

struct Shared {
    /// Parts not yet claimed by any worker. A part which failed
    /// transiently is pushed back here.
    stack: Mutex<Vec<PartDescriptor>>,
    /// Parts currently being transferred by a worker
    in_flight: AtomicUsize,
    /// Workers with a slot index at or above this limit park
    active_limit: AtomicUsize,
    /// Workers currently in a backoff sleep
    sleeping: AtomicUsize,
    high_water_sleeping: AtomicUsize,
    /// Parts completed since the last governor decision
    window_completed: AtomicUsize,
    kill_switch: KillSwitch,
    /// Wakes parked and sleeping workers whenever the stack, the
    /// in flight count or the active limit changed
    changed: Notify,
    first_error: Mutex<Option<TransferError>>,
    stats: Vec<Mutex<WorkerStat>>,
    governor: Mutex<Governor>,
    window_size: usize,
}

impl Shared {
    fn pop_part(&self) -> Option<PartDescriptor> {
        let mut stack = self.lock_stack();
        let part = stack.pop()?;
        // Holding the lock keeps a part either on the stack or in flight
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(part)
    }

    fn push_back(&self, part: PartDescriptor) {
        self.lock_stack().push(part);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn part_done(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn is_drained(&self) -> bool {
        self.lock_stack().is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    fn lock_stack(&self) -> std::sync::MutexGuard<'_, Vec<PartDescriptor>> {
        match self.stack.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_error(&self, error: TransferError) {
        let mut first_error = match self.first_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if first_error.is_none() {
            *first_error = Some(error);
        }
    }

    fn take_error(&self) -> Option<TransferError> {
        match self.first_error.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn with_stat<R>(&self, slot: usize, f: impl FnOnce(&mut WorkerStat) -> R) -> R {
        let mut stat = match self.stats[slot].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut stat)
    }

    fn enter_sleep(&self) {
        let sleeping = self.sleeping.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water_sleeping
            .fetch_max(sleeping, Ordering::SeqCst);
    }

    fn leave_sleep(&self) {
        self.sleeping.fetch_sub(1, Ordering::SeqCst);
    }

    /// Aggregate and reset the window counters of all slots
    fn window_stats(&self) -> WindowStats {
        let mut attempts = 0;
        let mut successes = 0;
        let mut failed_workers = 0;
        let mut sleeps = 0;
        let mut sleep_secs = 0.0;

        for slot in &self.stats {
            let stat = match slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            attempts += stat.attempts;
            successes += stat.successes;
            sleeps += stat.sleeps;
            sleep_secs += stat.sleep_secs;
            if stat.failures > 0 {
                failed_workers += 1;
            }
        }

        WindowStats {
            failed_workers,
            high_water_sleeping: self.high_water_sleeping.swap(0, Ordering::SeqCst),
            avg_backoff_secs: if sleeps > 0 {
                sleep_secs / sleeps as f64
            } else {
                0.0
            },
            success_pct: if attempts > 0 {
                successes as f64 / attempts as f64 * 100.0
            } else {
                0.0
            },
            sleep_secs_per_success: if successes > 0 {
                sleep_secs / successes as f64
            } else {
                0.0
            },
        }
    }

    fn maybe_adjust_concurrency<P: Probe>(&self, max: usize, probe: &P) {
        let completed = self.window_completed.fetch_add(1, Ordering::SeqCst) + 1;
        if completed % self.window_size != 0 {
            return;
        }

        let window = self.window_stats();
        let current = self.active_limit.load(Ordering::SeqCst);

        let mut governor = match self.governor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let adjusted = governor.adjust(current, max, window);
        drop(governor);

        if adjusted != current {
            info!(from = current, to = adjusted, "adjusting worker count");
            probe.concurrency_changed(current, adjusted);
            self.active_limit.store(adjusted, Ordering::SeqCst);
            self.changed.notify_waiters();
        }
    }
}

/// Runs `worker_count` workers over the given parts
///
/// Returns the results in completion order once every part
/// succeeded. Returns the first error encountered if the pool
/// aborted. An optional deadline cancels the pool the same way a
/// fatal failure does.
pub(crate) async fn run_pool<T, P>(
    parts: Vec<PartDescriptor>,
    transfer: T,
    worker_count: usize,
    config: &Config,
    probe: P,
    deadline: Option<Duration>,
) -> Result<Vec<PartResult<T::Payload>>, TransferError>
where
    T: PartTransfer,
    P: Probe + Clone,
{
    let expected = parts.len();
    let (results_sender, mut results_receiver) = mpsc::unbounded_channel();

    run_pool_dispatch(
        parts,
        transfer,
        worker_count,
        config,
        probe,
        deadline,
        results_sender,
    )
    .await?;

    let mut results = Vec::with_capacity(expected);
    while let Ok(result) = results_receiver.try_recv() {
        results.push(result);
    }

    if results.len() != expected {
        return Err(TransferError::new_other(format!(
            "pool finished with {} of {} parts",
            results.len(),
            expected
        )));
    }

    Ok(results)
}

/// Like [run_pool] but pushes every result into the given channel
/// as soon as it is available
///
/// Used for downloads where a consumer writes the parts out while
/// the pool is still fetching.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_pool_dispatch<T, P>(
    parts: Vec<PartDescriptor>,
    transfer: T,
    worker_count: usize,
    config: &Config,
    probe: P,
    deadline: Option<Duration>,
    results_sender: mpsc::UnboundedSender<PartResult<T::Payload>>,
) -> Result<(), TransferError>
where
    T: PartTransfer,
    P: Probe + Clone,
{
    if parts.is_empty() {
        return Ok(());
    }

    let worker_count = worker_count.clamp(1, parts.len());

    // Reversed so that workers pop the lowest part numbers first
    // which keeps the reassembly buffer small
    let mut stack = parts;
    stack.reverse();

    let shared = Arc::new(Shared {
        stack: Mutex::new(stack),
        in_flight: AtomicUsize::new(0),
        active_limit: AtomicUsize::new(worker_count),
        sleeping: AtomicUsize::new(0),
        high_water_sleeping: AtomicUsize::new(0),
        window_completed: AtomicUsize::new(0),
        kill_switch: KillSwitch::new(),
        changed: Notify::new(),
        first_error: Mutex::new(None),
        stats: (0..worker_count).map(|_| Mutex::new(WorkerStat::default())).collect(),
        governor: Mutex::new(Governor::new()),
        window_size: config.governor_window_parts.into_inner(),
    });

    let mut handles = Vec::with_capacity(worker_count);
    for slot in 0..worker_count {
        let shared = Arc::clone(&shared);
        let transfer = transfer.clone();
        let probe = probe.clone();
        let results_sender = results_sender.clone();
        let config = config.clone();
        let span = debug_span!("worker", slot);
        handles.push(tokio::spawn(
            worker_loop(shared, transfer, slot, worker_count, config, probe, results_sender)
                .instrument(span),
        ));
    }
    drop(results_sender);

    let join_workers = async {
        for handle in handles {
            if let Err(join_error) = handle.await {
                if join_error.is_panic() {
                    let msg = format!("worker panicked: {join_error}");
                    probe.panic_detected(&msg);
                    shared.record_error(TransferError::new_other(msg));
                    shared.kill_switch.push_the_button();
                }
            }
        }
    };

    match deadline {
        Some(deadline) => {
            let expired = tokio::select! {
                _ = join_workers => false,
                _ = tokio::time::sleep(deadline) => true,
            };
            if expired {
                warn!("transfer deadline expired, cancelling workers");
                shared.record_error(TransferError::new_other(format!(
                    "transfer deadline of {deadline:?} exceeded"
                )));
                shared.kill_switch.push_the_button();
                // Workers stop claiming new parts but in flight
                // attempts run to completion
                loop {
                    let notified = shared.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if shared.in_flight.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    notified.await;
                }
            }
        }
        None => join_workers.await,
    }

    if let Some(error) = shared.take_error() {
        return Err(error);
    }

    Ok(())
}

async fn worker_loop<T, P>(
    shared: Arc<Shared>,
    transfer: T,
    slot: usize,
    max_workers: usize,
    config: Config,
    probe: P,
    results_sender: mpsc::UnboundedSender<PartResult<T::Payload>>,
) where
    T: PartTransfer,
    P: Probe + Clone,
{
    let mut backoff = Backoff::new(&config);

    loop {
        let notified = shared.changed.notified();
        tokio::pin!(notified);
        // notify_waiters only reaches registered waiters. Enabling
        // before the checks below closes the window in which a
        // sibling's wakeup would otherwise be lost.
        notified.as_mut().enable();

        if shared.kill_switch.is_pushed() {
            debug!("kill switch pushed, exiting");
            return;
        }

        if slot >= shared.active_limit.load(Ordering::SeqCst) {
            // Parked by the governor. Wait until the limit rises
            // again or the pool winds down.
            if shared.is_drained() {
                return;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = shared.kill_switch.pushed() => {}
            }
            continue;
        }

        let part = match shared.pop_part() {
            Some(part) => part,
            None => {
                if shared.is_drained() {
                    // Wake siblings blocked on the stack so they
                    // can observe the drained pool and exit
                    shared.changed.notify_waiters();
                    return;
                }
                // A sibling might still push its part back
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shared.kill_switch.pushed() => {}
                }
                continue;
            }
        };

        transfer_one_part(
            &shared,
            &transfer,
            slot,
            max_workers,
            &mut backoff,
            &probe,
            &results_sender,
            part,
        )
        .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn transfer_one_part<T, P>(
    shared: &Arc<Shared>,
    transfer: &T,
    slot: usize,
    max_workers: usize,
    backoff: &mut Backoff,
    probe: &P,
    results_sender: &mpsc::UnboundedSender<PartResult<T::Payload>>,
    part: PartDescriptor,
) where
    T: PartTransfer,
    P: Probe + Clone,
{
    let started_at = Instant::now();
    probe.part_started(part.part_number, part.range());
    shared.with_stat(slot, |stat| stat.attempts += 1);

    let mut outcome = transfer.transfer(part, slot).await;

    if matches!(
        outcome.as_ref().map_err(TransferError::kind),
        Err(TransferErrorKind::ReauthRequired)
    ) {
        probe.reauth_attempt(part.part_number);
        debug!(part_number = part.part_number, "token rejected, re-authorizing");
        match transfer.reauthorize(slot).await {
            Ok(()) => {
                shared.with_stat(slot, |stat| stat.attempts += 1);
                outcome = transfer.transfer(part, slot).await.map_err(|err| {
                    // A failure right after a fresh token is not an
                    // auth problem anymore
                    if err.kind() == TransferErrorKind::ReauthRequired {
                        TransferError::new_transient(err.to_string())
                    } else {
                        err
                    }
                });
            }
            Err(err) => {
                // Not being able to authorize dooms the whole transfer
                outcome = Err(TransferError::new_fatal(format!(
                    "re-authorization failed: {err}"
                )));
            }
        }
    }

    match outcome {
        Ok(payload) => {
            shared.with_stat(slot, |stat| stat.successes += 1);
            probe.part_completed(
                part.part_number,
                part.len,
                started_at.elapsed(),
            );
            if shared.kill_switch.is_pushed() {
                // The pool already aborted. The result of this in
                // flight attempt is discarded.
                shared.part_done();
                return;
            }
            // The receiver lives as long as the pool
            let _ = results_sender.send(PartResult {
                part_number: part.part_number,
                payload,
            });
            shared.part_done();
            shared.maybe_adjust_concurrency(max_workers, probe);
        }
        Err(err) if err.is_retryable() => {
            shared.with_stat(slot, |stat| stat.failures += 1);
            let sleep = backoff.failure();
            probe.retry_attempt(&err, part.part_number, sleep);
            warn!(
                part_number = part.part_number,
                next_attempt_in = ?sleep,
                "part failed, will be retried: {err}"
            );
            shared.push_back(part);
            shared.with_stat(slot, |stat| {
                stat.sleeps += 1;
                stat.sleep_secs += sleep.as_secs_f64();
            });
            backoff_sleep(shared, sleep).await;
        }
        Err(err) => {
            shared.with_stat(slot, |stat| stat.failures += 1);
            probe.part_failed(&err, part.part_number, &part.range());
            warn!(part_number = part.part_number, "part failed fatally: {err}");
            shared.part_done();
            shared.record_error(err);
            shared.kill_switch.push_the_button();
        }
    }
}

/// Sleep which ends early when the pool is cancelled or drained
async fn backoff_sleep(shared: &Arc<Shared>, duration: Duration) {
    shared.enter_sleep();

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    loop {
        let notified = shared.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if shared.kill_switch.is_pushed() || shared.is_drained() {
            break;
        }
        tokio::select! {
            _ = &mut sleep => break,
            _ = shared.kill_switch.pushed() => break,
            _ = &mut notified => {}
        }
    }

    shared.leave_sleep();
}
