//! Checkpoint, rotation, GC, and group-commit policy knobs.

use std::time::Duration;
use xylem_durability::RetentionPolicy;

/// Policy driving the checkpoint coordinator.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    // Replay-window triggers.
    /// Checkpoint once the replay window exceeds this many bytes.
    pub max_replay_bytes: u64,
    /// Checkpoint once the replay window spans this many epochs.
    pub max_replay_epochs: u64,
    /// Checkpoint at least this often.
    pub max_age: Duration,
    /// Never checkpoint more often than this (time-based triggers only).
    pub min_interval: Duration,

    // Adaptive tuning from ingest throughput.
    /// Enable throughput-driven threshold adaptation.
    pub adaptive_wal_rotation: bool,
    /// Replay-byte threshold under high throughput.
    pub min_replay_bytes: u64,
    /// Replay-byte threshold under normal throughput.
    pub base_replay_bytes: u64,
    /// Records/second above which the smaller threshold applies.
    pub throughput_threshold: f64,
    /// EWMA smoothing factor for the throughput estimate.
    pub ewma_alpha: f64,

    /// Checkpoint a nonempty replay window after this much idle time.
    pub query_only_age: Duration,

    // Steady-state cadence.
    /// Steady-state replay-byte trigger.
    pub steady_replay_bytes: u64,
    /// Steady-state age trigger.
    pub steady_age: Duration,

    // WAL rotation (separate from checkpoint triggers).
    /// Rotate the active log at this size; 0 disables.
    pub rotate_bytes: u64,
    /// Rotate the active log at this age; zero disables.
    pub rotate_age: Duration,

    // GC.
    /// Run log GC after a standalone checkpoint.
    pub gc_on_checkpoint: bool,
    /// Run log GC immediately after a rotation.
    pub gc_on_rotate: bool,
    /// Retention policy for closed logs.
    pub retention: RetentionPolicy,
    /// Checkpoint files to retain.
    pub checkpoint_keep_count: usize,

    /// Group-commit batching window; zero disables group commit.
    pub group_commit_interval: Duration,

    /// Coordinator loop quantum.
    pub quantum: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy {
            max_replay_bytes: 256 * 1024 * 1024,
            max_replay_epochs: 100_000,
            max_age: Duration::from_secs(600),
            min_interval: Duration::from_secs(30),
            adaptive_wal_rotation: true,
            min_replay_bytes: 64 * 1024 * 1024,
            base_replay_bytes: 256 * 1024 * 1024,
            throughput_threshold: 100_000.0,
            ewma_alpha: 0.2,
            query_only_age: Duration::from_secs(45),
            steady_replay_bytes: 96 * 1024 * 1024,
            steady_age: Duration::from_secs(90),
            rotate_bytes: 256 * 1024 * 1024,
            rotate_age: Duration::from_secs(3600),
            gc_on_checkpoint: true,
            gc_on_rotate: false,
            retention: RetentionPolicy::default(),
            checkpoint_keep_count: 2,
            group_commit_interval: Duration::ZERO,
            quantum: Duration::from_millis(200),
        }
    }
}

impl CheckpointPolicy {
    /// Aggressive, small-threshold policy for tests.
    pub fn for_testing() -> Self {
        CheckpointPolicy {
            max_replay_bytes: 64 * 1024,
            max_replay_epochs: 1000,
            max_age: Duration::from_secs(5),
            min_interval: Duration::ZERO,
            steady_replay_bytes: 32 * 1024,
            steady_age: Duration::from_secs(2),
            rotate_bytes: 32 * 1024,
            rotate_age: Duration::from_secs(60),
            checkpoint_keep_count: 2,
            quantum: Duration::from_millis(10),
            ..Default::default()
        }
    }
}
