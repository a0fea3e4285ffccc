//! Batch production
//!
//! One background thread drains the log source into batches and hands each
//! one to the orchestrator through a single slot. The thread blocks while
//! the slot is full, so at most two batches exist at a time: the one being
//! applied and the one waiting.
//!
//! Fill rules, in precedence order:
//! 0. Stop requested: an empty batch becomes the shutdown marker
//! 1. Nothing queued and the batch is empty: bounded wait for data
//! 2. Next record would exceed the byte budget: close (unless empty)
//! 3. Next record is newer than the replication-delay cutoff: hold it back
//! 4. Next record must be applied alone and the batch has content: close
//! 5. Otherwise consume it; close if it must be alone or the count limit
//!    is reached

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::config::ApplierConfig;
use crate::observability::{Event, Logger};
use crate::oplog::{Batch, LogSource};

/// Wall-clock source for the replication-delay cutoff.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Limits applied while filling one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Byte budget
    pub bytes: usize,
    /// Record count limit
    pub ops: usize,
    /// Records newer than now minus this are held back
    pub delay: Option<Duration>,
    /// Bounded wait when the source is empty
    pub data_wait: Duration,
}

impl BatchLimits {
    /// Limits from configuration.
    pub fn from_config(config: &ApplierConfig) -> Self {
        Self {
            bytes: config.batch_limit_bytes,
            ops: config.batch_limit_ops,
            delay: config.replication_delay(),
            data_wait: config.data_wait_timeout(),
        }
    }
}

/// Add at most one record to `batch`. Returns true when the batch must be
/// closed.
fn try_pop_and_wait_for_more(
    source: &dyn LogSource,
    batch: &mut Batch,
    limits: &BatchLimits,
    clock: &dyn Clock,
    shutting_down: bool,
) -> bool {
    if shutting_down {
        // Queued records stay in the source for the next start
        if batch.is_empty() {
            batch.set_must_shutdown();
        }
        return true;
    }

    let Some(next) = source.peek() else {
        if batch.is_empty() {
            // Still closes: the next record starts a fresh batch
            source.wait_for_data(limits.data_wait);
        }
        return true;
    };

    if !batch.is_empty() && batch.bytes() + next.size_bytes() > limits.bytes {
        return true;
    }

    if let Some(delay) = limits.delay {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = clock.now() - delay;
        if next.wall_time > cutoff {
            if batch.is_empty() {
                thread::sleep(limits.data_wait);
            }
            return true;
        }
    }

    if next.must_apply_alone() {
        if batch.is_empty() {
            if let Some(record) = source.try_pop() {
                batch.push(record);
            }
        }
        return true;
    }

    if let Some(record) = source.try_pop() {
        batch.push(record);
    }
    batch.len() >= limits.ops
}

/// Fill one batch from `source` under `limits`.
///
/// May return an empty batch when no data arrived within the wait, or a
/// shutdown marker when `shutting_down` is set.
pub fn fill_batch(
    source: &dyn LogSource,
    limits: &BatchLimits,
    clock: &dyn Clock,
    shutting_down: bool,
) -> Batch {
    let mut batch = Batch::with_capacity(limits.ops.min(1024));
    while !try_pop_and_wait_for_more(source, &mut batch, limits, clock, shutting_down) {}
    batch
}

/// Batcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    /// Slot empty, not filling
    Idle,
    /// Draining the source into a new batch
    Filling,
    /// A batch is waiting in the slot
    Ready,
    /// Shutdown marker handed off, or consumer gone
    ShuttingDown,
}

#[derive(Debug)]
struct Slot {
    state: BatcherState,
    batch: Option<Batch>,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    changed: Condvar,
    stop_requested: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: BatcherState) {
        self.lock().state = state;
    }
}

/// Consumer side of the batcher's slot. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BatchQueue {
    shared: Arc<Shared>,
}

impl BatchQueue {
    /// Take the waiting batch, blocking up to `timeout`.
    pub fn next_batch(&self, timeout: Duration) -> Option<Batch> {
        let slot = self.shared.lock();
        let (mut slot, _) = self
            .shared
            .changed
            .wait_timeout_while(slot, timeout, |s| s.batch.is_none())
            .unwrap_or_else(|e| e.into_inner());
        let batch = slot.batch.take();
        if batch.is_some() && slot.state == BatcherState::Ready {
            slot.state = BatcherState::Idle;
        }
        self.shared.changed.notify_all();
        batch
    }

    /// Ask the batcher to finish its current fill and then emit a
    /// shutdown marker.
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.changed.notify_all();
    }

    /// The consumer is gone; the batcher must not block on handoff.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.changed.notify_all();
    }

    /// Current batcher state.
    pub fn state(&self) -> BatcherState {
        self.shared.lock().state
    }
}

/// Background batch producer.
pub struct Batcher {
    queue: BatchQueue,
    handle: Option<JoinHandle<()>>,
}

impl Batcher {
    /// Spawn the batcher thread.
    pub fn start(
        source: Arc<dyn LogSource>,
        limits: BatchLimits,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: BatcherState::Idle,
                batch: None,
            }),
            changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("repl-batcher".to_string())
            .spawn(move || run(&worker, source.as_ref(), &limits, clock.as_ref()))?;
        Ok(Self {
            queue: BatchQueue { shared },
            handle: Some(handle),
        })
    }

    /// Consumer handle.
    pub fn queue(&self) -> BatchQueue {
        self.queue.clone()
    }

    /// Close the slot and join the thread.
    pub fn stop(&mut self) {
        self.queue.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        // Never blocks; `stop` is the way to join
        self.queue.close();
    }
}

fn run(shared: &Shared, source: &dyn LogSource, limits: &BatchLimits, clock: &dyn Clock) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        {
            let mut slot = shared.lock();
            if slot.batch.is_none() {
                slot.state = BatcherState::Filling;
            }
        }
        let stopping = shared.stop_requested.load(Ordering::SeqCst);
        let batch = fill_batch(source, limits, clock, stopping);
        if batch.is_empty() && !batch.must_shutdown() {
            let mut slot = shared.lock();
            if slot.state == BatcherState::Filling {
                slot.state = BatcherState::Idle;
            }
            continue;
        }

        let shutdown = batch.must_shutdown();
        let mut slot = shared.lock();
        while slot.batch.is_some() && !shared.closed.load(Ordering::SeqCst) {
            slot = shared
                .changed
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        slot.batch = Some(batch);
        slot.state = if shutdown {
            BatcherState::ShuttingDown
        } else {
            BatcherState::Ready
        };
        shared.changed.notify_all();
        if shutdown {
            break;
        }
    }

    shared.set_state(BatcherState::ShuttingDown);
    Logger::info(Event::BatcherStop.as_str(), &[]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::{CommandKind, MemoryLogSource, OperationRecord};
    use chrono::TimeZone;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn limits() -> BatchLimits {
        BatchLimits {
            bytes: 1024 * 1024,
            ops: 100,
            delay: None,
            data_wait: Duration::from_millis(5),
        }
    }

    fn seqs(batch: &Batch) -> Vec<u64> {
        batch.records().iter().map(|r| r.seq()).collect()
    }

    fn drop_cmd(seq: u64) -> OperationRecord {
        OperationRecord::command(
            seq,
            "b.$cmd",
            CommandKind::Other {
                name: "drop".to_string(),
            },
        )
    }

    #[test]
    fn test_isolated_command_splits_batches() {
        let source = MemoryLogSource::from_records(vec![
            OperationRecord::insert(1, "a.c", "x"),
            drop_cmd(2),
            OperationRecord::insert(3, "a.c", "y"),
        ]);
        let clock = SystemClock;
        assert_eq!(seqs(&fill_batch(&source, &limits(), &clock, false)), vec![1]);
        assert_eq!(seqs(&fill_batch(&source, &limits(), &clock, false)), vec![2]);
        assert_eq!(seqs(&fill_batch(&source, &limits(), &clock, false)), vec![3]);
    }

    #[test]
    fn test_count_limit() {
        let source = MemoryLogSource::from_records(
            (1..=5).map(|i| OperationRecord::insert(i, "a.c", format!("{}", i))),
        );
        let mut small = limits();
        small.ops = 2;
        assert_eq!(seqs(&fill_batch(&source, &small, &SystemClock, false)), vec![1, 2]);
        assert_eq!(seqs(&fill_batch(&source, &small, &SystemClock, false)), vec![3, 4]);
        assert_eq!(seqs(&fill_batch(&source, &small, &SystemClock, false)), vec![5]);
    }

    #[test]
    fn test_oversized_record_forms_batch_of_one() {
        let big = OperationRecord::insert(1, "a.c", "big")
            .with_payload(serde_json::json!({"blob": "x".repeat(4096)}));
        let source = MemoryLogSource::from_records(vec![
            big,
            OperationRecord::insert(2, "a.c", "small"),
        ]);
        let mut tight = limits();
        tight.bytes = 512;
        assert_eq!(seqs(&fill_batch(&source, &tight, &SystemClock, false)), vec![1]);
        assert_eq!(seqs(&fill_batch(&source, &tight, &SystemClock, false)), vec![2]);
    }

    #[test]
    fn test_replication_delay_holds_back_recent_records() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let source = MemoryLogSource::from_records(vec![
            OperationRecord::insert(1, "a.c", "old").at(t0),
            OperationRecord::insert(2, "a.c", "new").at(t0 + chrono::Duration::seconds(50)),
        ]);
        let mut delayed = limits();
        delayed.delay = Some(Duration::from_secs(30));
        let clock = FixedClock(t0 + chrono::Duration::seconds(60));

        assert_eq!(seqs(&fill_batch(&source, &delayed, &clock, false)), vec![1]);
        assert!(fill_batch(&source, &delayed, &clock, false).is_empty());
        assert_eq!(source.len(), 1);

        let later = FixedClock(t0 + chrono::Duration::seconds(90));
        assert_eq!(seqs(&fill_batch(&source, &delayed, &later, false)), vec![2]);
    }

    #[test]
    fn test_empty_source_yields_empty_batch_or_marker() {
        let source = MemoryLogSource::new();
        let batch = fill_batch(&source, &limits(), &SystemClock, false);
        assert!(batch.is_empty() && !batch.must_shutdown());
        let marker = fill_batch(&source, &limits(), &SystemClock, true);
        assert!(marker.must_shutdown());
    }

    #[test]
    fn test_thread_hands_off_then_shuts_down() {
        let source = Arc::new(MemoryLogSource::from_records(
            (1..=3).map(|i| OperationRecord::insert(i, "a.c", format!("{}", i))),
        ));
        let mut batcher = Batcher::start(source, limits(), Arc::new(SystemClock)).unwrap();
        let queue = batcher.queue();

        let batch = queue.next_batch(Duration::from_secs(5)).unwrap();
        assert_eq!(seqs(&batch), vec![1, 2, 3]);

        queue.request_stop();
        let mut marker = None;
        for _ in 0..100 {
            if let Some(batch) = queue.next_batch(Duration::from_millis(50)) {
                marker = Some(batch);
                break;
            }
        }
        assert!(marker.map(|b| b.must_shutdown()).unwrap_or(false));
        batcher.stop();
        assert_eq!(queue.state(), BatcherState::ShuttingDown);
    }

    #[test]
    fn test_stop_unblocks_full_slot() {
        let source = Arc::new(MemoryLogSource::from_records(vec![
            drop_cmd(1),
            drop_cmd(2),
            drop_cmd(3),
        ]));
        let mut batcher = Batcher::start(source, limits(), Arc::new(SystemClock)).unwrap();
        thread::sleep(Duration::from_millis(30));
        batcher.stop();
        assert_eq!(batcher.queue().state(), BatcherState::ShuttingDown);
    }
}
