//! The collector context.
//!
//! [`GcContext`] owns the object table, the class registry, the cluster
//! registry and the purge state, and serialises collections against mutators
//! through its [`GcSyncObject`]. Share it between threads with an `Arc`.
//!
//! Closures passed to [`GcContext::with_object`] and
//! [`GcContext::with_object_mut`] run under the heap lock and must not call
//! back into the context.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rayon::{ThreadPool, ThreadPoolBuilder};
use reclaim_utils::{PhaseTiming, Profiler, Stopwatch};

use super::array_pool::{ArrayPoolStats, GcArrayPool};
use super::class::{ClassDescriptor, ClassId, ClassRegistry};
use super::cluster::{Cluster, ClusterRegistry, WeakReferenceClearer};
use super::config::GcConfig;
use super::object::{Field, Object, ObjectFlags, ObjectHandle, RefSlot};
use super::purge::{IncrementalPurge, PurgeProgress};
use super::reachability::ReachabilityAnalysis;
use super::sync::{AsyncLockGuard, GcLockGuard, GcSyncObject};
use super::table::ObjectTable;
use crate::error::{GcError, GcResult, fatal};

/// Statistics from a garbage collection run
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Collectable objects when marking began
    pub objects_considered: usize,
    /// Objects whose references were traced
    pub objects_scanned: usize,
    /// Objects found unreachable
    pub objects_unreachable: usize,
    /// Clusters broken up during this collection
    pub clusters_dissolved: usize,
    /// Weak references nulled because their target died
    pub weak_references_cleared: usize,
    /// Objects freed by this call, including a purge left over from before
    pub objects_purged: usize,
    /// Trace waves
    pub waves: usize,
    /// Whether marking ran on the worker pool
    pub parallel: bool,
    /// Time spent in each phase
    pub phases: Vec<PhaseTiming>,
    /// Duration of GC in milliseconds
    pub duration_ms: u64,
}

impl GcStats {
    pub fn phase(&self, name: &str) -> Duration {
        self.phases
            .iter()
            .filter(|phase| phase.name == name)
            .map(|phase| phase.duration)
            .sum()
    }
}

#[derive(Debug, Default)]
struct Heap {
    table: ObjectTable,
    clusters: ClusterRegistry,
    purge: IncrementalPurge,
}

pub struct GcContext {
    config: GcConfig,
    classes: RwLock<ClassRegistry>,
    heap: RwLock<Heap>,
    sync: GcSyncObject,
    array_pool: GcArrayPool,
    workers: Option<ThreadPool>,
    attempts_since_last_gc: AtomicU32,
    last_stats: Mutex<Option<GcStats>>,
}

impl GcContext {
    pub fn new(config: GcConfig) -> GcResult<Self> {
        let worker_count = config.worker_count();
        let workers = if worker_count > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(worker_count)
                .thread_name(|index| format!("reclaim-gc-{index}"))
                .build()
                .map_err(|e| GcError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };

        tracing::info!(
            workers = worker_count,
            min_objects_per_task = config.min_objects_per_task,
            "initialised garbage collector"
        );

        Ok(Self {
            config,
            classes: RwLock::new(ClassRegistry::new()),
            heap: RwLock::new(Heap::default()),
            sync: GcSyncObject::new(),
            array_pool: GcArrayPool::new(),
            workers,
            attempts_since_last_gc: AtomicU32::new(0),
            last_stats: Mutex::new(None),
        })
    }

    /// Context configured from `RECLAIM_GC_*` environment variables
    pub fn from_env() -> GcResult<Self> {
        Self::new(GcConfig::from_env())
    }

    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .as_ref()
            .map_or(1, ThreadPool::current_num_threads)
    }

    pub fn register_class(&self, descriptor: ClassDescriptor) -> GcResult<ClassId> {
        self.classes.write().register(descriptor)
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes.read().find(name)
    }

    /// Allocate a default-initialised instance of `class`.
    pub fn create_object(&self, class: ClassId, name: impl Into<String>) -> GcResult<ObjectHandle> {
        let _guard = self.sync.lock_async();
        let fields = self.classes.read().instantiate_fields(class)?;
        self.heap
            .write()
            .table
            .allocate(class, name.into(), fields)
            .ok_or(GcError::TableExhausted)
    }

    /// Move every object created so far into the permanent pool.
    pub fn close_permanent_pool(&self) {
        let _guard = self.sync.lock_async();
        self.heap.write().table.close_permanent_pool();
    }

    pub fn is_valid(&self, handle: ObjectHandle) -> bool {
        self.heap.read().table.contains(handle)
    }

    pub fn object_count(&self) -> usize {
        self.heap.read().table.len()
    }

    pub fn with_object<R>(&self, handle: ObjectHandle, f: impl FnOnce(&Object) -> R) -> GcResult<R> {
        let heap = self.heap.read();
        let object = heap.table.get(handle).ok_or(GcError::InvalidHandle(handle))?;
        Ok(f(object))
    }

    pub fn with_object_mut<R>(
        &self,
        handle: ObjectHandle,
        f: impl FnOnce(&mut Object) -> R,
    ) -> GcResult<R> {
        let _guard = self.sync.lock_async();
        let classes = self.classes.read();
        let mut heap = self.heap.write();
        let Heap {
            table, clusters, ..
        } = &mut *heap;
        let object = table.get_mut(handle).ok_or(GcError::InvalidHandle(handle))?;
        let result = f(object);
        clusters.record_references_from(table, &classes, handle)?;
        Ok(result)
    }

    pub fn flags(&self, handle: ObjectHandle) -> GcResult<ObjectFlags> {
        self.with_object(handle, |object| object.flags().load())
    }

    pub fn set_flags(&self, handle: ObjectHandle, flags: ObjectFlags) -> GcResult<()> {
        self.with_object(handle, |object| object.flags().insert(flags))
    }

    pub fn clear_flags(&self, handle: ObjectHandle, flags: ObjectFlags) -> GcResult<()> {
        self.with_object(handle, |object| object.flags().remove(flags))
    }

    pub fn add_to_root_set(&self, handle: ObjectHandle) -> GcResult<()> {
        self.with_object(handle, |object| {
            if object.is_pending_kill() {
                return Err(GcError::RootedPendingKill(handle));
            }
            object.flags().insert(ObjectFlags::ROOT_SET);
            Ok(())
        })?
    }

    pub fn remove_from_root_set(&self, handle: ObjectHandle) -> GcResult<()> {
        self.clear_flags(handle, ObjectFlags::ROOT_SET)
    }

    /// Kill an object explicitly. Strong references to it are nulled by the
    /// next collection.
    pub fn mark_pending_kill(&self, handle: ObjectHandle) -> GcResult<()> {
        self.with_object(handle, |object| {
            if object.is_rooted() {
                return Err(GcError::RootedPendingKill(handle));
            }
            object.flags().insert(ObjectFlags::PENDING_KILL);
            Ok(())
        })?
    }

    /// Point the reference field at `offset` of `handle` to `target`.
    ///
    /// Objects the last collection found unreachable cannot become targets;
    /// they are destroyed by the pending purge.
    pub fn set_reference(
        &self,
        handle: ObjectHandle,
        offset: usize,
        target: Option<ObjectHandle>,
    ) -> GcResult<()> {
        let _guard = self.sync.lock_async();
        let classes = self.classes.read();
        let mut heap = self.heap.write();
        let Heap {
            table, clusters, ..
        } = &mut *heap;
        check_target(table, target)?;
        let object = table.get(handle).ok_or(GcError::InvalidHandle(handle))?;
        let slot = object
            .field(offset)
            .and_then(Field::as_ref_slot)
            .ok_or_else(|| field_mismatch(object, offset, "reference"))?;
        slot.set(target);
        if target.is_some() {
            clusters.record_references_from(table, &classes, handle)?;
        }
        Ok(())
    }

    pub fn reference(&self, handle: ObjectHandle, offset: usize) -> GcResult<Option<ObjectHandle>> {
        let heap = self.heap.read();
        let object = heap.table.get(handle).ok_or(GcError::InvalidHandle(handle))?;
        object
            .field(offset)
            .and_then(Field::as_ref_slot)
            .map(RefSlot::get)
            .ok_or_else(|| field_mismatch(object, offset, "reference"))
    }

    /// Append `target` to the reference array at `offset` of `handle`.
    pub fn push_reference(
        &self,
        handle: ObjectHandle,
        offset: usize,
        target: Option<ObjectHandle>,
    ) -> GcResult<()> {
        let _guard = self.sync.lock_async();
        let classes = self.classes.read();
        let mut heap = self.heap.write();
        let Heap {
            table, clusters, ..
        } = &mut *heap;
        check_target(table, target)?;
        let object = table.get_mut(handle).ok_or(GcError::InvalidHandle(handle))?;
        match object.field_mut(offset) {
            Some(Field::RefArray(slots)) => slots.push(RefSlot::new(target)),
            _ => return Err(field_mismatch(object, offset, "reference array")),
        }
        if target.is_some() {
            clusters.record_references_from(table, &classes, handle)?;
        }
        Ok(())
    }

    /// Bundle `members` with `root` into a cluster.
    pub fn create_cluster(&self, root: ObjectHandle, members: &[ObjectHandle]) -> GcResult<()> {
        let _guard = self.sync.lock_async();
        let classes = self.classes.read();
        let mut heap = self.heap.write();
        let Heap {
            table, clusters, ..
        } = &mut *heap;
        clusters.create_cluster(table, &classes, root, members)?;
        Ok(())
    }

    pub fn cluster(&self, root: ObjectHandle) -> Option<Cluster> {
        self.heap.read().clusters.get(root).cloned()
    }

    pub fn cluster_count(&self) -> usize {
        self.heap.read().clusters.len()
    }

    /// Root of the cluster `handle` belongs to, if any.
    pub fn owner_of(&self, handle: ObjectHandle) -> GcResult<Option<ObjectHandle>> {
        self.with_object(handle, Object::owner)
    }

    /// Hold off collections until the guard is dropped.
    pub fn lock_async(&self) -> AsyncLockGuard<'_> {
        self.sync.lock_async()
    }

    pub fn is_garbage_collecting(&self) -> bool {
        self.sync.is_collecting()
    }

    /// Collect garbage, blocking until the GC lock is available.
    ///
    /// Objects carrying any of `keep_flags` are treated as roots. With
    /// `full_purge` the unreachable objects are destroyed and freed before
    /// returning; otherwise call [`Self::incremental_purge_garbage`].
    pub fn collect_garbage(&self, keep_flags: ObjectFlags, full_purge: bool) -> GcStats {
        let _gc = self.sync.gc_lock();
        self.collect_garbage_internal(keep_flags, full_purge)
    }

    /// Collect garbage if the GC lock is free. After the configured number of
    /// consecutive misses the next attempt blocks for the lock instead.
    pub fn try_collect_garbage(&self, keep_flags: ObjectFlags, full_purge: bool) -> Option<GcStats> {
        let _gc: GcLockGuard<'_> = match self.sync.try_gc_lock() {
            Some(guard) => guard,
            None => {
                let retries = self.config.retries_before_forcing_gc;
                let attempts = self.attempts_since_last_gc.fetch_add(1, Ordering::AcqRel) + 1;
                if retries > 0 && attempts > retries {
                    tracing::warn!(
                        attempts,
                        "GC lock still busy after repeated attempts, forcing collection"
                    );
                    self.sync.gc_lock()
                } else {
                    tracing::debug!(attempts, "GC lock busy, skipping collection");
                    return None;
                }
            }
        };
        Some(self.collect_garbage_internal(keep_flags, full_purge))
    }

    /// Number of `try_collect_garbage` misses since the last collection.
    pub fn attempts_since_last_gc(&self) -> u32 {
        self.attempts_since_last_gc.load(Ordering::Acquire)
    }

    fn collect_garbage_internal(&self, keep_flags: ObjectFlags, full_purge: bool) -> GcStats {
        let watch = Stopwatch::start_new();
        let _collecting = self.sync.collecting_scope();
        self.attempts_since_last_gc.store(0, Ordering::Release);

        let classes = self.classes.read();
        let mut heap = self.heap.write();
        let Heap {
            table,
            clusters,
            purge,
        } = &mut *heap;
        let mut profiler = Profiler::new();
        let mut stats = GcStats::default();

        if purge.is_pending() {
            let progress = profiler.record_phase("finish_previous_purge", || {
                purge.run(table, &classes, None)
            });
            stats.objects_purged += progress.objects_purged;
        }

        if self.config.verify_assumptions {
            profiler
                .record_phase("verify", || clusters.verify_all(table))
                .unwrap_or_else(|error| fatal(error));
        }

        tracing::debug!(full_purge, ?keep_flags, "collecting garbage");

        let table: &ObjectTable = table;
        let analysis = ReachabilityAnalysis::new(
            table,
            &classes,
            &self.array_pool,
            self.workers.as_ref(),
            &self.config,
        );
        let outcome = profiler.record_phase("mark", || {
            analysis.perform(clusters, keep_flags, !self.config.allow_parallel_gc)
        });
        tracing::debug!(
            "{:.3} ms for GC mark ({} objects scanned)",
            profiler.total("mark").as_secs_f64() * 1000.0,
            outcome.objects_scanned
        );

        stats.clusters_dissolved = outcome.clusters_dissolved;
        stats.clusters_dissolved += profiler.record_phase("unhash", || {
            clusters.dissolve_unreachable_clusters(table, &classes)
        });
        stats.weak_references_cleared = profiler.record_phase("clear_weak_references", || {
            let traced = outcome
                .weak_slots
                .iter()
                .filter(|slot| {
                    let dead = slot
                        .get()
                        .and_then(|target| table.get(target))
                        .is_some_and(Object::is_unreachable);
                    if dead {
                        slot.clear();
                    }
                    dead
                })
                .count();

            // clustered and permanent objects are never walked by the trace
            let clustered = clusters
                .clear_weak_references(table, &classes)
                .unwrap_or_else(|error| fatal(error));
            let mut clearer = WeakReferenceClearer { table, cleared: 0 };
            for object in table.iter_permanent() {
                classes
                    .token_stream(object.class())
                    .unwrap_or_else(|error| fatal(error))
                    .walk(object, &mut clearer);
            }
            traced + clustered + clearer.cleared
        });

        stats.objects_considered = outcome.objects_considered;
        stats.objects_scanned = outcome.objects_scanned;
        stats.waves = outcome.waves;
        stats.parallel = outcome.parallel;
        stats.objects_unreachable = table.count_with_flags(ObjectFlags::UNREACHABLE);
        drop(outcome);

        let Heap { table, purge, .. } = &mut *heap;
        purge.request(stats.objects_considered);
        if full_purge {
            let progress = profiler.record_phase("purge", || purge.run(table, &classes, None));
            stats.objects_purged += progress.objects_purged;
        }

        stats.phases = profiler.into_phases();
        stats.duration_ms = u64::try_from(watch.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            "GC collected {} of {} objects in {:.3} ms ({} scanned, {} clusters dissolved)",
            stats.objects_unreachable,
            stats.objects_considered,
            watch.elapsed_ms(),
            stats.objects_scanned,
            stats.clusters_dissolved
        );

        *self.last_stats.lock() = Some(stats.clone());
        stats
    }

    /// Advance a pending purge, bounded by the configured time limit when
    /// `use_time_limit` is set.
    pub fn incremental_purge_garbage(&self, use_time_limit: bool) -> PurgeProgress {
        let limit = use_time_limit.then(|| self.config.incremental_purge_time_limit());
        self.incremental_purge_garbage_with_limit(limit)
    }

    pub fn incremental_purge_garbage_with_limit(&self, time_limit: Option<Duration>) -> PurgeProgress {
        let _collecting = self.sync.collecting_scope();
        let classes = self.classes.read();
        let mut heap = self.heap.write();
        let Heap { table, purge, .. } = &mut *heap;
        purge.run(table, &classes, time_limit)
    }

    pub fn is_incremental_purge_pending(&self) -> bool {
        self.heap.read().purge.is_pending()
    }

    pub fn last_stats(&self) -> Option<GcStats> {
        self.last_stats.lock().clone()
    }

    pub fn array_pool_stats(&self) -> ArrayPoolStats {
        self.array_pool.stats()
    }

    /// Finish any pending purge and release pooled scratch memory.
    pub fn shutdown(&self) {
        let _gc = self.sync.gc_lock();
        if self.is_incremental_purge_pending() {
            self.incremental_purge_garbage_with_limit(None);
        }
        self.array_pool.cleanup();
        tracing::info!(objects = self.object_count(), "garbage collector shut down");
    }
}

/// A reference target must be live and not already condemned.
fn check_target(table: &ObjectTable, target: Option<ObjectHandle>) -> GcResult<()> {
    let Some(target) = target else {
        return Ok(());
    };
    match table.get(target) {
        Some(object)
            if !object
                .flags()
                .intersects(ObjectFlags::UNREACHABLE | ObjectFlags::BEGIN_DESTROYED) =>
        {
            Ok(())
        }
        _ => Err(GcError::InvalidHandle(target)),
    }
}

fn field_mismatch(object: &Object, offset: usize, expected: &'static str) -> GcError {
    GcError::FieldMismatch {
        object: object.name().to_string(),
        offset,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::class::{FieldKind, ReferenceKind};

    fn context() -> (GcContext, ClassId) {
        let gc = GcContext::new(GcConfig::single_threaded()).unwrap();
        let node = gc
            .register_class(
                ClassDescriptor::new("Node")
                    .field("next", FieldKind::strong())
                    .field("observer", FieldKind::weak())
                    .field("value", FieldKind::Value),
            )
            .unwrap();
        (gc, node)
    }

    #[test]
    fn test_collect_frees_orphans() {
        let (gc, node) = context();
        let root = gc.create_object(node, "root").unwrap();
        let child = gc.create_object(node, "child").unwrap();
        let orphan = gc.create_object(node, "orphan").unwrap();
        gc.add_to_root_set(root).unwrap();
        gc.set_reference(root, 0, Some(child)).unwrap();

        let stats = gc.collect_garbage(ObjectFlags::empty(), true);

        assert_eq!(stats.objects_considered, 3);
        assert_eq!(stats.objects_unreachable, 1);
        assert_eq!(stats.objects_purged, 1);
        assert!(gc.is_valid(root));
        assert!(gc.is_valid(child));
        assert!(!gc.is_valid(orphan));
        assert!(!gc.is_incremental_purge_pending());
        assert!(gc.last_stats().is_some());
    }

    #[test]
    fn test_weak_reference_to_dead_object_is_cleared() {
        let (gc, node) = context();
        let root = gc.create_object(node, "root").unwrap();
        let watched = gc.create_object(node, "watched").unwrap();
        gc.add_to_root_set(root).unwrap();
        gc.set_reference(root, 1, Some(watched)).unwrap();

        let stats = gc.collect_garbage(ObjectFlags::empty(), false);

        assert_eq!(stats.weak_references_cleared, 1);
        assert_eq!(gc.reference(root, 1).unwrap(), None);
        assert!(gc.is_incremental_purge_pending());
        assert!(gc.incremental_purge_garbage(false).completed);
        assert!(!gc.is_valid(watched));
    }

    #[test]
    fn test_pending_kill_rules() {
        let (gc, node) = context();
        let rooted = gc.create_object(node, "rooted").unwrap();
        gc.add_to_root_set(rooted).unwrap();
        assert_eq!(
            gc.mark_pending_kill(rooted),
            Err(GcError::RootedPendingKill(rooted))
        );

        let victim = gc.create_object(node, "victim").unwrap();
        gc.set_reference(rooted, 0, Some(victim)).unwrap();
        gc.mark_pending_kill(victim).unwrap();
        assert_eq!(
            gc.add_to_root_set(victim),
            Err(GcError::RootedPendingKill(victim))
        );

        gc.collect_garbage(ObjectFlags::empty(), true);
        assert_eq!(gc.reference(rooted, 0).unwrap(), None);
        assert!(!gc.is_valid(victim));
    }

    #[test]
    fn test_set_reference_validates_field_and_target() {
        let (gc, node) = context();
        let a = gc.create_object(node, "a").unwrap();
        let b = gc.create_object(node, "b").unwrap();

        assert!(matches!(
            gc.set_reference(a, 2, Some(b)),
            Err(GcError::FieldMismatch { offset: 2, .. })
        ));
        let freed = ObjectHandle::from_index(99).unwrap();
        assert_eq!(
            gc.set_reference(a, 0, Some(freed)),
            Err(GcError::InvalidHandle(freed))
        );
        assert_eq!(
            gc.push_reference(a, 0, Some(b)),
            Err(GcError::FieldMismatch {
                object: "a".into(),
                offset: 0,
                expected: "reference array",
            })
        );
    }

    #[test]
    fn test_condemned_object_cannot_be_referenced() {
        let (gc, node) = context();
        let root = gc.create_object(node, "root").unwrap();
        let doomed = gc.create_object(node, "doomed").unwrap();
        gc.add_to_root_set(root).unwrap();

        gc.collect_garbage(ObjectFlags::empty(), false);
        assert!(gc.flags(doomed).unwrap().contains(ObjectFlags::UNREACHABLE));

        assert_eq!(
            gc.set_reference(root, 0, Some(doomed)),
            Err(GcError::InvalidHandle(doomed))
        );
        assert_eq!(
            gc.set_reference(root, 1, Some(doomed)),
            Err(GcError::InvalidHandle(doomed))
        );
        assert_eq!(gc.reference(root, 0).unwrap(), None);

        let progress = gc.incremental_purge_garbage(false);
        assert!(progress.completed);
        assert!(!gc.is_valid(doomed));
        let stats = gc.collect_garbage(ObjectFlags::empty(), true);
        assert_eq!(stats.objects_unreachable, 0);
        assert!(gc.is_valid(root));
    }

    #[test]
    fn test_condemned_object_cannot_be_pushed() {
        let gc = GcContext::new(GcConfig::single_threaded()).unwrap();
        let list = gc
            .register_class(
                ClassDescriptor::new("List")
                    .field("items", FieldKind::ReferenceArray(ReferenceKind::Strong)),
            )
            .unwrap();
        let holder = gc.create_object(list, "holder").unwrap();
        let doomed = gc.create_object(list, "doomed").unwrap();
        gc.add_to_root_set(holder).unwrap();
        gc.collect_garbage(ObjectFlags::empty(), false);

        assert_eq!(
            gc.push_reference(holder, 0, Some(doomed)),
            Err(GcError::InvalidHandle(doomed))
        );
        gc.with_object(holder, |object| {
            let items = object.field(0).and_then(Field::as_ref_array);
            assert_eq!(items.map(<[RefSlot]>::len), Some(0));
        })
        .unwrap();
        assert!(gc.incremental_purge_garbage(false).completed);
    }

    #[test]
    fn test_try_collect_forces_after_retries() {
        let gc = GcContext::new(GcConfig {
            retries_before_forcing_gc: 2,
            ..GcConfig::single_threaded()
        })
        .unwrap();

        std::thread::scope(|scope| {
            let guard = gc.lock_async();
            assert!(gc.try_collect_garbage(ObjectFlags::empty(), true).is_none());
            assert!(gc.try_collect_garbage(ObjectFlags::empty(), true).is_none());
            assert_eq!(gc.attempts_since_last_gc(), 2);

            let forced = scope.spawn(|| gc.try_collect_garbage(ObjectFlags::empty(), true));
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
            assert!(forced.join().unwrap().is_some());
        });
        assert_eq!(gc.attempts_since_last_gc(), 0);
    }

    #[test]
    fn test_shutdown_drains_pool() {
        let (gc, node) = context();
        for index in 0..10 {
            gc.create_object(node, format!("n{index}")).unwrap();
        }
        gc.collect_garbage(ObjectFlags::empty(), false);
        gc.shutdown();

        assert_eq!(gc.object_count(), 0);
        assert_eq!(gc.array_pool_stats().pooled, 0);
        assert_eq!(gc.array_pool_stats().in_use, 0);
    }
}
