//! Background checkpoint coordinator.
//!
//! A single thread runs a quantum loop (200 ms by default). Each iteration
//! samples the replay window (bytes and epochs between the last checkpoint
//! and the active log's end), decides one of `None` / `CkptOnly` /
//! `CkptAndRotate`, executes it, and sleeps until the next quantum or a
//! wakeup.
//!
//! Failures never propagate out of the loop: they are routed to the
//! reported-error callback and counted, and the loop carries on.
//!
//! The coordinator also hosts the group-commit combiner (`try_publish`),
//! the dirty-range writeback queue, and the adaptive threshold driven by
//! an EWMA of ingest throughput.

use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use xylem_concurrency::MvccContext;
use xylem_core::{Error, NodeId, PersistenceMetrics, PersistentEntry, Result};
use xylem_durability::{
    wal, CheckpointInfo, CheckpointWriter, DeltaLog, DeltaLogInfo, LogGc, ManifestFile,
    RootSnapshot, Superblock, DEFAULT_PREALLOC_CHUNK,
};
use xylem_storage::fs::{PlatformFs, StdFs};
use xylem_storage::ShardedObjectTable;

use crate::policy::CheckpointPolicy;
use crate::reclaimer::Reclaimer;

/// Callback invoked with every error the coordinator swallows.
pub type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;

/// Hook receiving coalesced dirty ranges for physical writeback.
pub type FlushHook = Box<dyn Fn(&[DirtyRange]) + Send + Sync>;

/// A mapped range awaiting background writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRange {
    /// Owning data file.
    pub file_id: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Epoch generation the dirty data belongs to.
    pub epoch: u64,
}

/// Observable coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Epoch chosen for the most recent action.
    pub last_epoch: u64,
    /// Replay-window bytes at the last sample.
    pub last_replay_bytes: u64,
    /// Replay-window epochs at the last sample.
    pub last_replay_epochs: u64,
    /// Wall time of the last checkpoint in milliseconds.
    pub last_ckpt_ms: u64,
    /// Wall time of the last rotation in milliseconds.
    pub last_rotate_ms: u64,
    /// Checkpoints successfully written.
    pub checkpoints_written: u64,
    /// Rotations completed.
    pub rotations: u64,
    /// Delta logs pruned by GC.
    pub pruned_logs: u64,
    /// Epoch of the last successful checkpoint.
    pub last_checkpoint_epoch: u64,
    /// Epoch of the last successful log GC.
    pub last_gc_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    CkptOnly,
    CkptAndRotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostOp {
    /// Standalone checkpoint: may rotate afterwards and may run GC.
    MaybeRotate,
    /// Called from the rotation path, which handles rotation and GC.
    None,
}

struct DirtyState {
    ranges: Vec<DirtyRange>,
    total_bytes: u64,
    oldest: Instant,
}

struct ThroughputWindow {
    start: Instant,
    records: u64,
}

struct Shared {
    data_dir: PathBuf,
    ot: Arc<ShardedObjectTable>,
    superblock: Arc<Superblock>,
    manifest: Mutex<ManifestFile>,
    mvcc: Arc<MvccContext>,
    reclaimer: Option<Reclaimer>,
    log_gc: LogGc,
    policy: Mutex<CheckpointPolicy>,
    metrics: Arc<PersistenceMetrics>,

    active_log: Mutex<Option<Arc<DeltaLog>>>,
    prealloc_chunk: u64,

    running: AtomicBool,
    wake_lock: Mutex<()>,
    wake_cv: Condvar,
    checkpoint_requested: AtomicBool,
    last_ckpt: Mutex<Instant>,

    // Single-flight flag shared by checkpoint execution and the
    // group-commit leader.
    sync_in_progress: Mutex<bool>,
    publish_cv: Condvar,

    // Stats (u64::MAX = never).
    last_epoch: AtomicU64,
    last_replay_bytes: AtomicU64,
    last_replay_epochs: AtomicU64,
    last_ckpt_ms: AtomicU64,
    last_rotate_ms: AtomicU64,
    checkpoints_written: AtomicU64,
    rotations: AtomicU64,
    pruned_logs: AtomicU64,
    last_checkpoint_epoch: AtomicU64,
    last_gc_epoch: AtomicU64,
    checkpoint_ticks: AtomicU64,

    // Adaptive thresholds.
    current_throughput_bits: AtomicU64,
    adjusted_replay_bytes: AtomicU64,
    throughput_window: Mutex<ThroughputWindow>,

    dirty: Mutex<DirtyState>,
    flush_hook: Mutex<Option<FlushHook>>,

    error_cb: Mutex<Option<ErrorCallback>>,
}

const NO_EPOCH: u64 = u64::MAX;

impl Shared {
    fn report_error(&self, err: &Error) {
        self.metrics.coordinator_errors.increment(1);
        warn!(error = %err, "coordinator error");
        if let Some(cb) = self.error_cb.lock().as_ref() {
            cb(err);
        }
    }

    fn active_log(&self) -> Option<Arc<DeltaLog>> {
        self.active_log.lock().clone()
    }

    fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    fn checkpoint_epoch(&self) -> u64 {
        self.manifest.lock().checkpoint_epoch()
    }

    fn current_log_end_epoch(&self) -> u64 {
        if let Some(log) = self.active_log() {
            return log.end_epoch_relaxed();
        }
        self.manifest
            .lock()
            .delta_logs()
            .iter()
            .map(|l| l.end_epoch)
            .max()
            .unwrap_or(0)
    }

    fn estimate_replay_bytes(&self) -> u64 {
        let logs = {
            let m = self.manifest.lock();
            m.logs_after_checkpoint(m.checkpoint_epoch())
        };
        let active = self.active_log();
        let active_path = active.as_ref().map(|l| l.path().to_path_buf());
        let mut total = 0u64;
        for log in logs {
            let full = self.data_dir.join(&log.path);
            if Some(&full) == active_path.as_ref() {
                continue; // counted below from the live cursor
            }
            if log.size > 0 {
                total += log.size;
            } else if let Ok(size) = StdFs.file_size(&full) {
                total += size;
            }
        }
        if let Some(log) = &active {
            total += log.end_offset_relaxed();
        }
        total
    }
}

/// The checkpoint coordinator.
pub struct CheckpointCoordinator {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointCoordinator {
    /// Build a coordinator and create or adopt the active delta log.
    ///
    /// The manifest is taken over; further manifest mutation goes through
    /// the coordinator.
    pub fn new(
        data_dir: PathBuf,
        ot: Arc<ShardedObjectTable>,
        superblock: Arc<Superblock>,
        manifest: ManifestFile,
        mvcc: Arc<MvccContext>,
        policy: CheckpointPolicy,
        metrics: Arc<PersistenceMetrics>,
        reclaimer: Option<Reclaimer>,
    ) -> Result<Self> {
        let log_gc = LogGc::new(policy.retention);
        let shared = Arc::new(Shared {
            data_dir,
            ot,
            superblock,
            manifest: Mutex::new(manifest),
            mvcc,
            reclaimer,
            log_gc,
            adjusted_replay_bytes: AtomicU64::new(policy.base_replay_bytes),
            policy: Mutex::new(policy),
            metrics,
            active_log: Mutex::new(None),
            prealloc_chunk: DEFAULT_PREALLOC_CHUNK,
            running: AtomicBool::new(false),
            wake_lock: Mutex::new(()),
            wake_cv: Condvar::new(),
            checkpoint_requested: AtomicBool::new(false),
            last_ckpt: Mutex::new(Instant::now()),
            sync_in_progress: Mutex::new(false),
            publish_cv: Condvar::new(),
            last_epoch: AtomicU64::new(NO_EPOCH),
            last_replay_bytes: AtomicU64::new(0),
            last_replay_epochs: AtomicU64::new(0),
            last_ckpt_ms: AtomicU64::new(0),
            last_rotate_ms: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            pruned_logs: AtomicU64::new(0),
            last_checkpoint_epoch: AtomicU64::new(NO_EPOCH),
            last_gc_epoch: AtomicU64::new(NO_EPOCH),
            checkpoint_ticks: AtomicU64::new(0),
            current_throughput_bits: AtomicU64::new(0f64.to_bits()),
            throughput_window: Mutex::new(ThroughputWindow {
                start: Instant::now(),
                records: 0,
            }),
            dirty: Mutex::new(DirtyState {
                ranges: Vec::new(),
                total_bytes: 0,
                oldest: Instant::now(),
            }),
            flush_hook: Mutex::new(None),
            error_cb: Mutex::new(None),
        });
        let coordinator = CheckpointCoordinator {
            shared,
            thread: Mutex::new(None),
        };
        coordinator.init_or_adopt_active_log()?;
        Ok(coordinator)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the background thread. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.last_ckpt.lock() = Instant::now();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("xylem-coordinator".into())
            .spawn(move || coordinator_loop(shared))
            .expect("spawn coordinator thread");
        *self.thread.lock() = Some(handle);
    }

    /// Signal the loop to exit, join it, then quiesce and close the
    /// active log and seal it in the manifest.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        self.shared.wake_cv.notify_all();
        {
            *self.shared.sync_in_progress.lock() = false;
        }
        self.shared.publish_cv.notify_all();
        if was_running {
            if let Some(handle) = self.thread.lock().take() {
                let _ = handle.join();
            }
        }

        let old = self.shared.active_log.lock().take();
        if let Some(log) = old {
            log.prepare_close();
            if let Err(e) = log.sync() {
                self.shared.report_error(&e);
            }
            // Seal with the highest epoch the process reached, so the log
            // never reads as active again.
            let end_epoch = log
                .end_epoch_relaxed()
                .max(self.shared.mvcc.current_epoch())
                .max(1);
            let size = log.end_offset_relaxed();
            if let Err(e) = log.close() {
                self.shared.report_error(&e);
            }
            let rel = relative_log_path(log.path());
            let mut manifest = self.shared.manifest.lock();
            if manifest.close_delta_log(&rel, end_epoch, size) {
                if let Err(e) = manifest.store() {
                    self.shared.report_error(&e);
                }
            }
        }
    }

    /// Nudge the loop to checkpoint soon.
    pub fn request_checkpoint(&self) {
        self.shared
            .checkpoint_requested
            .store(true, Ordering::Release);
        self.shared.wake_cv.notify_all();
    }

    /// Seed the replay window after recovery and tighten policy when the
    /// replay was large, so the system catches up quickly.
    pub fn initialize_after_recovery(&self, recovered_epoch: u64, replay_bytes: u64) {
        self.shared
            .last_replay_epochs
            .store(recovered_epoch, Ordering::Relaxed);
        self.shared
            .last_replay_bytes
            .store(replay_bytes, Ordering::Relaxed);
        *self.shared.last_ckpt.lock() = Instant::now();

        let mut policy = self.shared.policy.lock();
        if replay_bytes > policy.steady_replay_bytes {
            self.request_checkpoint();
        }
        if replay_bytes > policy.max_replay_bytes {
            policy.steady_replay_bytes /= 2;
            policy.steady_age /= 2;
        }
    }

    /// The root pointer currently persisted in the superblock.
    pub fn persisted_root(&self) -> RootSnapshot {
        self.shared.superblock.load()
    }

    /// Observable counters.
    pub fn stats(&self) -> CoordinatorStats {
        let s = &self.shared;
        let norm = |v: u64| if v == NO_EPOCH { 0 } else { v };
        CoordinatorStats {
            last_epoch: norm(s.last_epoch.load(Ordering::Relaxed)),
            last_replay_bytes: s.last_replay_bytes.load(Ordering::Relaxed),
            last_replay_epochs: s.last_replay_epochs.load(Ordering::Relaxed),
            last_ckpt_ms: s.last_ckpt_ms.load(Ordering::Relaxed),
            last_rotate_ms: s.last_rotate_ms.load(Ordering::Relaxed),
            checkpoints_written: s.checkpoints_written.load(Ordering::Relaxed),
            rotations: s.rotations.load(Ordering::Relaxed),
            pruned_logs: s.pruned_logs.load(Ordering::Relaxed),
            last_checkpoint_epoch: norm(s.last_checkpoint_epoch.load(Ordering::Relaxed)),
            last_gc_epoch: norm(s.last_gc_epoch.load(Ordering::Relaxed)),
        }
    }

    /// Install the reported-error callback.
    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *self.shared.error_cb.lock() = Some(cb);
    }

    /// Install the physical writeback hook for dirty ranges.
    pub fn set_flush_hook(&self, hook: FlushHook) {
        *self.shared.flush_hook.lock() = Some(hook);
    }

    // ------------------------------------------------------------------
    // Writer-facing surface
    // ------------------------------------------------------------------

    /// The active delta log (ref-counted; safe to append through while a
    /// rotation swaps the pointer).
    pub fn active_log(&self) -> Option<Arc<DeltaLog>> {
        self.shared.active_log()
    }

    /// Append delta rows to the active log, retrying once when a rotation
    /// closed the log mid-append.
    pub fn append_deltas(&self, rows: &[PersistentEntry]) -> Result<()> {
        for attempt in 0..2 {
            let Some(log) = self.shared.active_log() else {
                return Err(Error::InvalidState("no active delta log".into()));
            };
            match log.append(rows) {
                Ok(bytes) => {
                    self.shared.metrics.wal_bytes_appended.increment(bytes);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt == 0 => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Transient("active log rotated twice mid-append".into()))
    }

    /// Feed the adaptive threshold with freshly ingested record counts.
    /// Windows are one second; the smoothed rate picks between the small
    /// and the base replay-byte thresholds.
    pub fn update_throughput(&self, records_inserted: u64) {
        let policy = self.shared.policy.lock();
        if !policy.adaptive_wal_rotation {
            return;
        }
        let (alpha, threshold, min_bytes, base_bytes) = (
            policy.ewma_alpha,
            policy.throughput_threshold,
            policy.min_replay_bytes,
            policy.base_replay_bytes,
        );
        drop(policy);

        let mut window = self.shared.throughput_window.lock();
        window.records += records_inserted;
        let elapsed = window.start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let rate = window.records as f64 / elapsed.as_secs_f64();
            window.records = 0;
            window.start = Instant::now();
            drop(window);

            let current = f64::from_bits(self.shared.current_throughput_bits.load(Ordering::Relaxed));
            let smoothed = alpha * rate + (1.0 - alpha) * current;
            self.shared
                .current_throughput_bits
                .store(smoothed.to_bits(), Ordering::Relaxed);
            let new_threshold = if smoothed > threshold {
                min_bytes
            } else {
                base_bytes
            };
            self.shared
                .adjusted_replay_bytes
                .store(new_threshold, Ordering::Relaxed);
        }
    }

    /// Queue mapped ranges for background writeback.
    pub fn submit_dirty_ranges(&self, ranges: &[DirtyRange]) {
        if ranges.is_empty() {
            return;
        }
        let mut dirty = self.shared.dirty.lock();
        if dirty.ranges.is_empty() {
            dirty.oldest = Instant::now();
        }
        for r in ranges {
            dirty.total_bytes += r.length;
            dirty.ranges.push(*r);
        }
    }

    // ------------------------------------------------------------------
    // Group commit
    // ------------------------------------------------------------------

    /// Publish `(root, epoch)` durably.
    ///
    /// With group commit disabled (interval zero) this syncs the active
    /// log and publishes directly, returning `true`. Otherwise the first
    /// caller becomes the leader: it captures the active log pointer,
    /// sleeps the batching window, syncs the captured log, and publishes
    /// once. Non-leaders return `false` and may keep appending (or call
    /// [`CheckpointCoordinator::wait_for_publish`]).
    pub fn try_publish(&self, root: NodeId, epoch: u64) -> Result<bool> {
        let interval = self.shared.policy.lock().group_commit_interval;
        if interval.is_zero() {
            if let Some(log) = self.shared.active_log() {
                log.sync()?;
            }
            self.shared.superblock.publish(root, epoch)?;
            self.shared.metrics.group_commits.increment(1);
            return Ok(true);
        }

        {
            let mut flag = self.shared.sync_in_progress.lock();
            if *flag {
                return Ok(false);
            }
            *flag = true;
        }
        // Capture the log pointer before the sleep: appends that race the
        // window land either in this log (synced below) or in a newer one
        // (synced by a later publish).
        let captured = self.shared.active_log();
        std::thread::sleep(interval);
        let result = (|| -> Result<()> {
            if let Some(log) = &captured {
                log.sync()?;
            }
            self.shared.superblock.publish(root, epoch)
        })();
        {
            *self.shared.sync_in_progress.lock() = false;
        }
        self.shared.publish_cv.notify_all();
        result?;
        self.shared.metrics.group_commits.increment(1);
        Ok(true)
    }

    /// Block until no publish or checkpoint is in flight.
    pub fn wait_for_publish(&self) {
        let mut flag = self.shared.sync_in_progress.lock();
        while *flag {
            self.shared.publish_cv.wait(&mut flag);
        }
    }

    /// Change the group-commit batching window; zero disables.
    pub fn set_group_commit_interval(&self, interval: Duration) {
        self.shared.policy.lock().group_commit_interval = interval;
    }

    // ------------------------------------------------------------------
    // Synchronous triggers (shutdown flows and tests)
    // ------------------------------------------------------------------

    /// Run one checkpoint now, at the epoch the policy would choose.
    /// Returns the checkpointed epoch.
    pub fn checkpoint_now(&self) -> Result<u64> {
        let epoch = choose_snapshot_epoch(&self.shared);
        self.shared.last_epoch.store(epoch, Ordering::Relaxed);
        do_checkpoint_impl(&self.shared, epoch, PostOp::MaybeRotate)
    }

    /// Run one checkpoint-plus-rotation now. Returns the checkpointed
    /// epoch.
    pub fn rotate_now(&self) -> Result<u64> {
        let epoch = choose_snapshot_epoch(&self.shared);
        self.shared.last_epoch.store(epoch, Ordering::Relaxed);
        do_checkpoint_and_rotate(&self.shared, epoch)
    }

    /// Persist the named-root catalog into the manifest.
    pub fn persist_roots(&self, roots: Vec<xylem_durability::RootEntry>) -> Result<()> {
        let mut manifest = self.shared.manifest.lock();
        manifest.set_roots(roots);
        manifest.store()
    }

    /// Read the named-root catalog from the manifest.
    pub fn load_roots(&self) -> Vec<xylem_durability::RootEntry> {
        self.shared.manifest.lock().roots().to_vec()
    }

    // ------------------------------------------------------------------
    // Startup: create or adopt the active log
    // ------------------------------------------------------------------

    fn init_or_adopt_active_log(&self) -> Result<()> {
        if self.shared.active_log().is_some() {
            return Ok(());
        }
        let logs_dir = self.shared.logs_dir();
        std::fs::create_dir_all(&logs_dir)?;

        let mut manifest = self.shared.manifest.lock();

        // Fresh install: no logs recorded at all.
        if manifest.delta_logs().is_empty() {
            let seq = 1;
            let name = wal::log_file_name(seq);
            let log = Arc::new(DeltaLog::open_for_append(
                &logs_dir.join(&name),
                seq,
                self.shared.prealloc_chunk,
            )?);
            *self.shared.active_log.lock() = Some(log);
            manifest.add_delta_log(DeltaLogInfo {
                path: format!("logs/{name}"),
                start_epoch: 1,
                end_epoch: 0,
                size: 0,
            })?;
            manifest.store()?;
            StdFs.fsync_directory(&logs_dir)?;
            return Ok(());
        }

        // Adopt the manifest's active log if one exists.
        if let Some(active) = manifest.active_log().cloned() {
            let full = manifest.resolve(&active.path);
            let seq = wal::parse_sequence(&full).unwrap_or(1);
            let log = Arc::new(DeltaLog::open_for_append(
                &full,
                seq,
                self.shared.prealloc_chunk,
            )?);
            *self.shared.active_log.lock() = Some(log);
            return Ok(());
        }

        // All logs closed: continue after the last one.
        let last = manifest
            .delta_logs()
            .iter()
            .max_by_key(|l| l.start_epoch)
            .cloned();
        let seq = last
            .as_ref()
            .and_then(|l| wal::parse_sequence(&manifest.resolve(&l.path)))
            .map(|s| s + 1)
            .unwrap_or(1);
        let start_epoch = last.as_ref().map(|l| l.end_epoch + 1).unwrap_or(1);
        let name = wal::log_file_name(seq);
        let log = Arc::new(DeltaLog::open_for_append(
            &logs_dir.join(&name),
            seq,
            self.shared.prealloc_chunk,
        )?);
        *self.shared.active_log.lock() = Some(log);
        manifest.add_delta_log(DeltaLogInfo {
            path: format!("logs/{name}"),
            start_epoch,
            end_epoch: 0,
            size: 0,
        })?;
        manifest.store()?;
        StdFs.fsync_directory(&logs_dir)?;
        Ok(())
    }
}

impl Drop for CheckpointCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relative_log_path(path: &std::path::Path) -> String {
    match path.file_name() {
        Some(name) => format!("logs/{}", name.to_string_lossy()),
        None => path.to_string_lossy().into_owned(),
    }
}

// ----------------------------------------------------------------------
// Loop
// ----------------------------------------------------------------------

fn coordinator_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        let now = Instant::now();
        let quantum = shared.policy.lock().quantum;

        let ckpt_epoch = shared.checkpoint_epoch();
        let log_end = shared.current_log_end_epoch();
        let replay_bytes = shared.estimate_replay_bytes();
        let replay_epochs = log_end.saturating_sub(ckpt_epoch);
        shared
            .last_replay_bytes
            .store(replay_bytes, Ordering::Relaxed);
        shared
            .last_replay_epochs
            .store(replay_epochs, Ordering::Relaxed);

        // Rotation thresholds; rotation dominates and implies checkpoint.
        let mut need_rotate = false;
        if let Some(log) = shared.active_log() {
            let policy = shared.policy.lock();
            let size_hit = policy.rotate_bytes > 0 && log.end_offset_relaxed() >= policy.rotate_bytes;
            let age_hit = !policy.rotate_age.is_zero() && log.age() >= policy.rotate_age;
            need_rotate = size_hit || age_hit;
        }

        let need_ckpt = should_checkpoint(&shared, ckpt_epoch, log_end, replay_bytes, now);
        let was_requested = shared.checkpoint_requested.swap(false, Ordering::AcqRel);

        let action = if need_rotate {
            Action::CkptAndRotate
        } else if need_ckpt || was_requested {
            Action::CkptOnly
        } else {
            Action::None
        };

        flush_dirty_if_needed(&shared);

        if action == Action::None {
            let mut guard = shared.wake_lock.lock();
            let _ = shared.wake_cv.wait_for(&mut guard, quantum);
            if !shared.running.load(Ordering::Relaxed) {
                break;
            }
            continue;
        }
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }

        let epoch = choose_snapshot_epoch(&shared);
        shared.last_epoch.store(epoch, Ordering::Relaxed);
        debug!(epoch, ?action, "coordinator action");

        let result = match action {
            Action::CkptAndRotate => do_checkpoint_and_rotate(&shared, epoch).map(|_| ()),
            Action::CkptOnly => do_checkpoint_impl(&shared, epoch, PostOp::MaybeRotate).map(|_| ()),
            Action::None => Ok(()),
        };
        if let Err(e) = result {
            shared.report_error(&e);
        }

        *shared.last_ckpt.lock() = now;
    }
}

fn should_checkpoint(
    shared: &Shared,
    ckpt_epoch: u64,
    log_end_epoch: u64,
    replay_bytes: u64,
    now: Instant,
) -> bool {
    let policy = shared.policy.lock();
    let age = now.saturating_duration_since(*shared.last_ckpt.lock());

    let effective_threshold = if policy.adaptive_wal_rotation {
        shared.adjusted_replay_bytes.load(Ordering::Relaxed)
    } else {
        policy.max_replay_bytes
    };

    // Critical thresholds override min_interval.
    if replay_bytes >= effective_threshold {
        return true;
    }
    if log_end_epoch.saturating_sub(ckpt_epoch) >= policy.max_replay_epochs {
        return true;
    }

    // Time-based triggers respect min_interval.
    if age < policy.min_interval {
        return false;
    }
    if age >= policy.max_age {
        return true;
    }
    if replay_bytes > 0 && age >= policy.query_only_age {
        return true;
    }

    let mut steady_threshold = policy.steady_replay_bytes;
    let throughput = f64::from_bits(shared.current_throughput_bits.load(Ordering::Relaxed));
    if policy.adaptive_wal_rotation && throughput > policy.throughput_threshold {
        steady_threshold = policy.min_replay_bytes;
    }
    if replay_bytes >= steady_threshold {
        return true;
    }
    if age >= policy.steady_age {
        return true;
    }

    false
}

/// Choose the epoch to snapshot: the max epoch the WAL durably covers,
/// clamped to the MVCC epoch. Epoch 0 is allowed only for empty systems.
fn choose_snapshot_epoch(shared: &Shared) -> u64 {
    let log = shared.active_log();
    let wal_bytes = log.as_ref().map_or(0, |l| l.end_offset_relaxed());
    let wal_epoch = log.as_ref().map_or(0, |l| l.end_epoch_relaxed());

    if wal_bytes == 0
        && wal_epoch == 0
        && shared.last_epoch.load(Ordering::Relaxed) == NO_EPOCH
    {
        return 0;
    }
    if wal_epoch > 0 {
        // The WAL's max epoch is by definition covered; clamp to the MVCC
        // epoch to stay conservative.
        let mvcc_epoch = shared.mvcc.current_epoch();
        return if mvcc_epoch > 0 {
            wal_epoch.min(mvcc_epoch)
        } else {
            wal_epoch
        };
    }
    0
}

struct SyncFlagGuard<'a>(&'a Shared);

impl Drop for SyncFlagGuard<'_> {
    fn drop(&mut self) {
        *self.0.sync_in_progress.lock() = false;
        self.0.publish_cv.notify_all();
    }
}

fn do_checkpoint_impl(shared: &Shared, mut epoch: u64, post_op: PostOp) -> Result<u64> {
    let t0 = Instant::now();

    // Serialize with other checkpoints and group-commit leaders.
    {
        let mut flag = shared.sync_in_progress.lock();
        while *flag {
            shared.publish_cv.wait(&mut flag);
        }
        *flag = true;
    }
    let _guard = SyncFlagGuard(shared);

    // Clamp to what the WAL durably contains.
    let log = shared.active_log();
    if let Some(log) = &log {
        log.sync()?;
        let wal_epoch = log.end_epoch_relaxed();
        let wal_bytes = log.end_offset_relaxed();
        if wal_bytes == 0 && wal_epoch == 0 {
            epoch = 0;
        } else if epoch > wal_epoch {
            epoch = wal_epoch;
        }
    }

    // Verify coverage, waiting a bounded window for a racing writer.
    let covers = |shared: &Shared| {
        epoch == 0
            || shared
                .active_log()
                .is_some_and(|l| l.end_epoch_relaxed() >= epoch)
    };
    if !covers(shared) {
        let deadline = Instant::now() + Duration::from_millis(50);
        while !covers(shared) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        if !covers(shared) {
            return Err(Error::Transient(format!(
                "WAL does not cover checkpoint epoch {epoch}"
            )));
        }
    }

    flush_dirty_until(shared, epoch);

    // Snapshot and write.
    let rows = shared.ot.iterate_live_snapshot();
    let writer = CheckpointWriter::new(&shared.data_dir)?;
    let written = writer.write(epoch, &rows)?;

    {
        let mut manifest = shared.manifest.lock();
        manifest.set_checkpoint(CheckpointInfo {
            path: xylem_durability::checkpoint::checkpoint_file_name(epoch),
            epoch,
            size: written.size,
            entries: written.entries,
            crc: written.crc,
        });
        manifest.store()?;
    }

    shared.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    shared
        .last_ckpt_ms
        .store(t0.elapsed().as_millis() as u64, Ordering::Relaxed);
    shared.last_checkpoint_epoch.store(epoch, Ordering::Release);
    shared.metrics.checkpoints_written.increment(1);
    shared
        .metrics
        .last_checkpoint_entries
        .set(written.entries as i64);
    shared
        .metrics
        .checkpoint_ms
        .record(t0.elapsed().as_millis() as u64);

    let keep = shared.policy.lock().checkpoint_keep_count;
    writer.cleanup_old_checkpoints(keep);

    if post_op == PostOp::MaybeRotate {
        let should_rotate = log.as_ref().is_some_and(|l| {
            let policy = shared.policy.lock();
            (policy.rotate_bytes > 0 && l.end_offset_relaxed() >= policy.rotate_bytes)
                || (!policy.rotate_age.is_zero() && l.age() >= policy.rotate_age)
        });
        if should_rotate {
            rotate_active_log(shared, epoch)?;
        }
        if shared.policy.lock().gc_on_checkpoint {
            run_log_gc(shared, epoch);
        }
    }

    // Run the reclaimer adaptively: always under heavy replay, else every
    // tenth checkpoint.
    if let Some(reclaimer) = &shared.reclaimer {
        let heavy_replay = shared.last_replay_bytes.load(Ordering::Relaxed)
            > shared.policy.lock().max_replay_bytes / 2;
        let tick = shared.checkpoint_ticks.fetch_add(1, Ordering::Relaxed);
        if heavy_replay || tick % 10 == 0 {
            let reclaimed = reclaimer.run_once();
            shared.metrics.reclaims.increment(reclaimed as u64);
        }
    }

    Ok(epoch)
}

fn do_checkpoint_and_rotate(shared: &Shared, epoch: u64) -> Result<u64> {
    let t0 = Instant::now();
    let epoch = do_checkpoint_impl(shared, epoch, PostOp::None)?;
    rotate_active_log(shared, epoch)?;
    if shared.policy.lock().gc_on_rotate {
        run_log_gc(shared, epoch);
    }
    shared
        .last_rotate_ms
        .store(t0.elapsed().as_millis() as u64, Ordering::Relaxed);
    Ok(epoch)
}

/// The rotation protocol: prepare the new log, swap the active pointer,
/// quiesce the old log, record both in the manifest, close the old file.
fn rotate_active_log(shared: &Shared, checkpoint_epoch: u64) -> Result<()> {
    let logs_dir = shared.logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    let cur = shared.active_log();
    let new_seq = cur.as_ref().map_or(1, |l| l.sequence() + 1);
    let new_name = wal::log_file_name(new_seq);
    let new_log = Arc::new(DeltaLog::open_for_append(
        &logs_dir.join(&new_name),
        new_seq,
        shared.prealloc_chunk,
    )?);
    StdFs.fsync_directory(&logs_dir)?;

    // Atomic cut: writers see the new log immediately.
    let old = {
        let mut slot = shared.active_log.lock();
        std::mem::replace(&mut *slot, Some(Arc::clone(&new_log)))
    };

    // Quiesce the old log before computing epoch boundaries.
    let mut final_end = checkpoint_epoch;
    let mut final_size = 0;
    let mut old_rel = None;
    if let Some(old) = &old {
        old.prepare_close();
        old.sync()?;
        final_end = old.end_epoch_relaxed();
        final_size = old.end_offset_relaxed();
        old_rel = Some(relative_log_path(old.path()));
    }

    let new_start = final_end.max(checkpoint_epoch) + 1;
    {
        let mut manifest = shared.manifest.lock();
        if let Some(rel) = &old_rel {
            // A closed log must carry a nonzero end epoch to stay closed.
            if !manifest.close_delta_log(rel, final_end.max(1), final_size) {
                shared.report_error(&Error::InvalidState(format!(
                    "rotation could not close {rel} in the manifest"
                )));
            }
        }
        manifest.add_delta_log(DeltaLogInfo {
            path: format!("logs/{new_name}"),
            start_epoch: new_start,
            end_epoch: 0,
            size: 0,
        })?;
        manifest.store()?;
    }
    StdFs.fsync_directory(&logs_dir)?;

    if let Some(old) = old {
        // Writers still draining the old Arc finish against a closed log
        // and retry transparently on the new one.
        old.close()?;
    }

    shared.rotations.fetch_add(1, Ordering::Relaxed);
    shared.metrics.rotations.increment(1);
    debug!(sequence = new_seq, start_epoch = new_start, "rotated delta log");
    Ok(())
}

fn run_log_gc(shared: &Shared, checkpoint_epoch: u64) {
    let mut manifest = shared.manifest.lock();
    match shared.log_gc.prune_covered(&mut manifest, checkpoint_epoch) {
        Ok(0) => {}
        Ok(n) => {
            shared.pruned_logs.fetch_add(n as u64, Ordering::Relaxed);
            shared.metrics.pruned_logs.increment(n as u64);
            shared
                .last_gc_epoch
                .store(checkpoint_epoch, Ordering::Release);
        }
        Err(e) => shared.report_error(&e),
    }
}

// ----------------------------------------------------------------------
// Dirty-range writeback
// ----------------------------------------------------------------------

const DIRTY_FLUSH_BYTES: u64 = 128 * 1024 * 1024;
const DIRTY_FLUSH_AGE: Duration = Duration::from_secs(3);

fn flush_dirty_if_needed(shared: &Shared) {
    let to_flush = {
        let mut dirty = shared.dirty.lock();
        let over_bytes = dirty.total_bytes >= DIRTY_FLUSH_BYTES;
        let over_age = !dirty.ranges.is_empty() && dirty.oldest.elapsed() >= DIRTY_FLUSH_AGE;
        if !(over_bytes || over_age) {
            return;
        }
        dirty.total_bytes = 0;
        dirty.oldest = Instant::now();
        std::mem::take(&mut dirty.ranges)
    };
    flush_ranges(shared, to_flush);
}

fn flush_dirty_until(shared: &Shared, epoch: u64) {
    let to_flush = {
        let mut dirty = shared.dirty.lock();
        let (flush, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut dirty.ranges).into_iter().partition(|r| r.epoch <= epoch);
        dirty.total_bytes = keep.iter().map(|r| r.length).sum();
        dirty.ranges = keep;
        flush
    };
    flush_ranges(shared, to_flush);
}

/// Sort and coalesce contiguous ranges per file, then hand them to the
/// writeback hook (a no-op until the mapping owner installs one).
fn flush_ranges(shared: &Shared, mut ranges: Vec<DirtyRange>) {
    if ranges.is_empty() {
        return;
    }
    ranges.sort_by(|a, b| (a.file_id, a.offset).cmp(&(b.file_id, b.offset)));
    let mut coalesced: Vec<DirtyRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match coalesced.last_mut() {
            Some(last)
                if last.file_id == r.file_id && last.offset + last.length >= r.offset =>
            {
                let end = (last.offset + last.length).max(r.offset + r.length);
                last.length = end - last.offset;
                last.epoch = last.epoch.max(r.epoch);
            }
            _ => coalesced.push(r),
        }
    }
    if let Some(hook) = shared.flush_hook.lock().as_ref() {
        hook(&coalesced);
    }
}
