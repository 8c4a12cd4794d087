//! The durable runtime: wiring for the whole persistence core.
//!
//! `DurableRuntime::open` performs cold-start recovery, restores the MVCC
//! epoch, loads the named-root catalog, and starts the checkpoint
//! coordinator. Writers then drive the node lifecycle through the
//! runtime's helpers:
//!
//! ```text
//! allocate_node → (build node bytes) → commit_node → publish_root
//!                                    ↘ abort_node
//! retire_node → (reclaimer, eventually)
//! ```
//!
//! Shutdown order: stop the coordinator (quiesces and seals the active
//! log), close segment files, drop the superblock handle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use xylem_concurrency::{EpochGuard, MvccContext};
use xylem_core::{Error, NodeId, NodeKind, PersistenceMetrics, Result};
use xylem_durability::{ManifestFile, RootEntry, RootSnapshot, Superblock};
use xylem_storage::{
    Allocation, AllocatorConfig, SegmentAllocator, ShardedObjectTable, TableConfig,
};

use crate::coordinator::CheckpointCoordinator;
use crate::policy::CheckpointPolicy;
use crate::reclaimer::Reclaimer;
use crate::recovery::{self, RecoveryReport};

/// Data-directory layout.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root of all persistent state.
    pub data_dir: PathBuf,
}

impl Paths {
    /// Layout rooted at `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Paths {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// The superblock file.
    pub fn superblock(&self) -> PathBuf {
        self.data_dir.join("superblock")
    }

    /// The delta-log directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// The segment-file directory.
    pub fn segments_dir(&self) -> PathBuf {
        self.data_dir.join("segments")
    }
}

/// A reserved node: the id plus the segment range backing it.
#[derive(Debug, Clone, Copy)]
pub struct ReservedNode {
    /// The allocated id (RESERVED; invisible until commit).
    pub id: NodeId,
    /// The backing segment range.
    pub allocation: Allocation,
}

struct Catalog {
    roots: HashMap<String, NodeId>,
    mbrs: HashMap<String, Vec<f32>>,
    epoch: u64,
}

/// The assembled persistence core.
pub struct DurableRuntime {
    paths: Paths,
    table: Arc<ShardedObjectTable>,
    allocator: Arc<SegmentAllocator>,
    mvcc: Arc<MvccContext>,
    superblock: Arc<Superblock>,
    coordinator: CheckpointCoordinator,
    reclaimer: Reclaimer,
    metrics: Arc<PersistenceMetrics>,
    catalog: Mutex<Catalog>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for DurableRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableRuntime")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl DurableRuntime {
    /// Open (or create) the persistence core under `data_dir`.
    ///
    /// Runs recovery before any thread starts, then launches the
    /// coordinator.
    pub fn open(data_dir: &Path, policy: CheckpointPolicy) -> Result<Arc<Self>> {
        Self::open_with(data_dir, policy, TableConfig::default(), AllocatorConfig::default())
    }

    /// `open` with explicit table and allocator geometry.
    pub fn open_with(
        data_dir: &Path,
        policy: CheckpointPolicy,
        table_config: TableConfig,
        allocator_config: AllocatorConfig,
    ) -> Result<Arc<Self>> {
        let paths = Paths::new(data_dir);
        std::fs::create_dir_all(&paths.data_dir)?;
        std::fs::create_dir_all(paths.logs_dir())?;

        let metrics = Arc::new(PersistenceMetrics::default());
        let allocator = Arc::new(SegmentAllocator::open(&paths.data_dir, allocator_config)?);
        let table = Arc::new(ShardedObjectTable::new(
            table_config,
            Some(Arc::clone(&allocator)),
        ));
        let mvcc = Arc::new(MvccContext::new());
        let superblock = Arc::new(Superblock::new(&paths.superblock()));
        let manifest = ManifestFile::load_or_default(&paths.data_dir)?;

        // Recovery: checkpoint restore + WAL replay, before any threads.
        let report = recovery::cold_start(&paths.data_dir, &table, &manifest)?;
        let rows = table.iterate_live_snapshot();
        allocator.restore_from_rows(rows.iter())?;

        let snapshot = superblock.load();
        let restored_epoch =
            match recovery::validate_epoch_sources(&report, snapshot.epoch) {
                Ok(epoch) => epoch,
                Err(e) => {
                    // Adopt the higher epoch anyway; regressing it would
                    // hand out duplicate epochs.
                    warn!(error = %e, "epoch sources disagree after recovery");
                    report.max_replayed_epoch.max(snapshot.epoch)
                }
            };
        mvcc.recover_set_epoch(restored_epoch);

        let reclaimer = Reclaimer::new(Arc::clone(&table), Arc::clone(&mvcc));
        let coordinator = CheckpointCoordinator::new(
            paths.data_dir.clone(),
            Arc::clone(&table),
            Arc::clone(&superblock),
            manifest,
            Arc::clone(&mvcc),
            policy,
            Arc::clone(&metrics),
            Some(reclaimer.clone()),
        )?;
        coordinator.initialize_after_recovery(report.max_replayed_epoch, report.replay_bytes);

        let runtime = Arc::new(DurableRuntime {
            paths,
            table,
            allocator,
            mvcc,
            superblock,
            coordinator,
            reclaimer,
            metrics,
            catalog: Mutex::new(Catalog {
                roots: HashMap::new(),
                mbrs: HashMap::new(),
                epoch: 0,
            }),
            recovery: report,
        });

        runtime.load_catalog_from_manifest();
        // The superblock is authoritative for the primary (unnamed) root.
        if snapshot.root.valid() {
            let mut catalog = runtime.catalog.lock();
            catalog.roots.insert(String::new(), snapshot.root);
            catalog.epoch = catalog.epoch.max(snapshot.epoch);
        }

        runtime.coordinator.start();
        info!(
            data_dir = %runtime.paths.data_dir.display(),
            recovered_epoch = restored_epoch,
            live_entries = runtime.table.count_live(),
            "durable runtime open"
        );
        Ok(runtime)
    }

    /// Stop the background machinery and close files. Idempotent; also
    /// invoked on drop.
    pub fn shutdown(&self) {
        self.coordinator.stop();
        if let Err(e) = self.allocator.close_all() {
            warn!(error = %e, "failed to close segment files");
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The object table.
    pub fn table(&self) -> &Arc<ShardedObjectTable> {
        &self.table
    }

    /// The MVCC context.
    pub fn mvcc(&self) -> &Arc<MvccContext> {
        &self.mvcc
    }

    /// The checkpoint coordinator.
    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    /// The reclaimer.
    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<PersistenceMetrics> {
        &self.metrics
    }

    /// What recovery found at open.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// The data-directory layout.
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    // ------------------------------------------------------------------
    // Writer path
    // ------------------------------------------------------------------

    /// Reserve a node: allocate a segment range of `class_id`'s size and
    /// an object-table handle pointing at it.
    pub fn allocate_node(&self, kind: NodeKind, class_id: u8) -> Result<ReservedNode> {
        let allocation = self.allocator.allocate(class_id)?;
        match self.table.allocate(kind, class_id, allocation.addr()) {
            Ok(id) => {
                self.metrics.allocations.increment(1);
                Ok(ReservedNode { id, allocation })
            }
            Err(e) => {
                self.allocator.free(allocation);
                Err(e)
            }
        }
    }

    /// Commit a reserved node at `epoch`: publish it to readers and append
    /// its delta row to the active log.
    pub fn commit_node(&self, id: NodeId, epoch: u64) -> Result<()> {
        self.table.mark_live_commit(id, epoch);
        let rec = self.table.delta_record(id).ok_or_else(|| {
            Error::InvalidState(format!("commit of unknown node {id}"))
        })?;
        self.coordinator.append_deltas(&[rec])?;
        self.coordinator.update_throughput(1);
        Ok(())
    }

    /// Retire a live node at `epoch` and log the transition. Idempotent.
    pub fn retire_node(&self, id: NodeId, epoch: u64) -> Result<()> {
        self.table.retire(id, epoch);
        if let Some(rec) = self.table.delta_record(id) {
            self.coordinator.append_deltas(&[rec])?;
        }
        self.metrics.retires.increment(1);
        Ok(())
    }

    /// Abort a reservation: return the handle and the segment range.
    /// Nothing was durable, so no delta is logged.
    pub fn abort_node(&self, node: ReservedNode) -> bool {
        let ok = self.table.abort_reservation(node.id);
        if ok {
            self.allocator.free(node.allocation);
        }
        ok
    }

    /// Advance the global epoch, returning the new value.
    pub fn advance_epoch(&self) -> u64 {
        self.mvcc.advance_epoch()
    }

    /// Pin the calling thread at the current epoch for reading.
    pub fn pin_reader(&self) -> Result<EpochGuard> {
        self.mvcc.pin_current()
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Publish the primary root durably: the group-commit path syncs the
    /// active log before the superblock becomes visible. Returns `false`
    /// when another publish was already in flight.
    pub fn publish_root(&self, root: NodeId, epoch: u64) -> Result<bool> {
        self.coordinator.try_publish(root, epoch)
    }

    /// The durably published primary root.
    pub fn persisted_root(&self) -> RootSnapshot {
        self.superblock.load()
    }

    /// Record a named root (empty name = primary). The primary root also
    /// publishes through the superblock; named roots persist via the
    /// manifest catalog on [`DurableRuntime::persist_catalog`].
    pub fn set_root(&self, name: &str, id: NodeId, epoch: u64, mbr: Option<&[f32]>) -> Result<()> {
        {
            let mut catalog = self.catalog.lock();
            catalog.roots.insert(name.to_string(), id);
            if let Some(mbr) = mbr {
                catalog.mbrs.insert(name.to_string(), mbr.to_vec());
            }
            catalog.epoch = catalog.epoch.max(epoch);
            // A single-tree host keeps the primary root in step.
            if catalog.roots.len() == 1 && !name.is_empty() {
                catalog.roots.insert(String::new(), id);
            }
        }
        if name.is_empty() {
            self.publish_root(id, epoch)?;
        }
        Ok(())
    }

    /// Look up a root by name; the superblock answers for the primary
    /// root when the catalog has no entry.
    pub fn get_root(&self, name: &str) -> NodeId {
        if let Some(id) = self.catalog.lock().roots.get(name) {
            return *id;
        }
        if name.is_empty() {
            return self.superblock.load().root;
        }
        NodeId::INVALID
    }

    /// Persist the named-root catalog into the manifest at `epoch`.
    pub fn persist_catalog(&self, epoch: u64) -> Result<()> {
        let entries: Vec<RootEntry> = {
            let catalog = self.catalog.lock();
            catalog
                .roots
                .iter()
                .map(|(name, id)| RootEntry {
                    name: name.clone(),
                    node_id_raw: id.raw(),
                    epoch,
                    mbr: catalog.mbrs.get(name).cloned(),
                })
                .collect()
        };
        self.coordinator.persist_roots(entries)?;
        self.catalog.lock().epoch = epoch;
        Ok(())
    }

    fn load_catalog_from_manifest(&self) {
        let roots = self.coordinator.load_roots();
        if roots.is_empty() {
            return;
        }
        let mut catalog = self.catalog.lock();
        catalog.roots.clear();
        catalog.mbrs.clear();
        let mut max_epoch = 0;
        for entry in roots {
            catalog
                .roots
                .insert(entry.name.clone(), NodeId::from_raw(entry.node_id_raw));
            if let Some(mbr) = entry.mbr {
                catalog.mbrs.insert(entry.name, mbr);
            }
            max_epoch = max_epoch.max(entry.epoch);
        }
        catalog.epoch = max_epoch;
    }
}

impl Drop for DurableRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
