//! Reachability analysis.
//!
//! Marking runs in two steps. First every collectable object is flagged
//! unreachable, except those kept by the root set or a keep flag, which seed
//! the frontier. Then the frontier is traced in waves: each wave is split into
//! batches processed on the worker pool, and the objects the batches claim
//! become the next wave. Clusters that turn out dead while some member was
//! referenced from outside are dissolved and their survivors traced, until
//! nothing changes.

use rayon::ThreadPool;
use rayon::prelude::*;

use super::array_pool::GcArrayPool;
use super::class::ClassRegistry;
use super::cluster::ClusterRegistry;
use super::config::GcConfig;
use super::object::{ObjectFlags, ObjectHandle, RefSlot};
use super::processor::{ReferenceProcessor, WorkerOutput};
use super::table::ObjectTable;
use crate::error::{GcError, fatal};

/// Result of one reachability analysis.
#[derive(Debug, Default)]
pub struct ReachabilityOutcome<'a> {
    /// Weak slots to null if their target ends up unreachable.
    pub weak_slots: Vec<&'a RefSlot>,
    /// Collectable objects present when marking began.
    pub objects_considered: usize,
    pub objects_scanned: usize,
    pub waves: usize,
    /// Clusters broken up because a member outlived its root.
    pub clusters_dissolved: usize,
    pub parallel: bool,
}

pub struct ReachabilityAnalysis<'a> {
    table: &'a ObjectTable,
    classes: &'a ClassRegistry,
    pool: &'a GcArrayPool,
    workers: Option<&'a ThreadPool>,
    config: &'a GcConfig,
}

impl<'a> ReachabilityAnalysis<'a> {
    pub const fn new(
        table: &'a ObjectTable,
        classes: &'a ClassRegistry,
        pool: &'a GcArrayPool,
        workers: Option<&'a ThreadPool>,
        config: &'a GcConfig,
    ) -> Self {
        Self {
            table,
            classes,
            pool,
            workers,
            config,
        }
    }

    pub fn perform(
        &self,
        clusters: &mut ClusterRegistry,
        keep_flags: ObjectFlags,
        force_single_threaded: bool,
    ) -> ReachabilityOutcome<'a> {
        let workers = if force_single_threaded {
            None
        } else {
            self.workers.filter(|pool| pool.current_num_threads() > 1)
        };
        let mut outcome = ReachabilityOutcome {
            parallel: workers.is_some(),
            ..ReachabilityOutcome::default()
        };

        let mut frontier = self.pool.acquire();
        outcome.objects_considered = self.mark_objects_as_unreachable(&mut frontier, keep_flags);

        loop {
            self.trace(clusters, frontier, workers, &mut outcome);

            let mut survivors = self.pool.acquire();
            let dissolved = clusters.dissolve_clusters_with_reachable_members(
                self.table,
                self.classes,
                &mut survivors,
            );
            outcome.clusters_dissolved += dissolved;
            if survivors.is_empty() {
                self.pool.release(survivors);
                break;
            }
            tracing::trace!(
                clusters = dissolved,
                survivors = survivors.len(),
                "re-tracing members of dissolved clusters"
            );
            frontier = survivors;
        }

        debug_assert!(self.pool.check_leaks(), "GC array pool leaked during marking");
        outcome
    }

    /// Flag every collectable object unreachable and collect the seeds.
    /// Returns the number of collectable objects.
    pub fn mark_objects_as_unreachable(
        &self,
        frontier: &mut Vec<ObjectHandle>,
        keep_flags: ObjectFlags,
    ) -> usize {
        let keep = keep_flags | ObjectFlags::GARBAGE_COLLECTION_KEEP_FLAGS;
        let mut considered = 0;

        for object in self.table.iter_collectable() {
            considered += 1;
            let flags = object.flags();
            debug_assert!(
                !flags.contains(ObjectFlags::UNREACHABLE),
                "object {} is already flagged unreachable",
                object.handle()
            );
            flags.remove(ObjectFlags::REACHABLE_IN_CLUSTER);
            let current = flags.load();

            if current.contains(ObjectFlags::ROOT_SET) {
                if current.contains(ObjectFlags::PENDING_KILL) {
                    fatal(GcError::RootedPendingKill(object.handle()));
                }
                frontier.push(object.handle());
            } else if object.owner().is_some() {
                if current.intersects(keep) && !current.contains(ObjectFlags::PENDING_KILL) {
                    frontier.push(object.handle());
                }
            } else if current.intersects(keep) && !current.contains(ObjectFlags::PENDING_KILL) {
                frontier.push(object.handle());
            } else {
                flags.insert(ObjectFlags::UNREACHABLE | ObjectFlags::NO_STRONG_REFERENCE);
            }
        }

        tracing::trace!(considered, seeds = frontier.len(), "marked objects as unreachable");
        considered
    }

    fn trace(
        &self,
        clusters: &ClusterRegistry,
        frontier: Vec<ObjectHandle>,
        workers: Option<&ThreadPool>,
        outcome: &mut ReachabilityOutcome<'a>,
    ) {
        let processor = ReferenceProcessor::new(
            self.table,
            self.classes,
            clusters,
            self.pool,
            self.config.member_reference_keeps_cluster,
        );
        let min_per_task = self.config.min_objects_per_task.max(1);

        // one output per task, reused by every wave of this trace
        let mut outputs: Vec<WorkerOutput<'a>> = Vec::new();
        let tasks = workers.map_or(1, ThreadPool::current_num_threads);
        outputs.resize_with(tasks, WorkerOutput::default);

        let mut current = frontier;
        while !current.is_empty() {
            outcome.waves += 1;
            let next = match workers {
                Some(workers) if current.len() >= 2 * min_per_task => self.parallel_wave(
                    &processor,
                    &current,
                    workers,
                    min_per_task,
                    &mut outputs,
                    outcome,
                ),
                _ => self.serial_wave(&processor, &current, &mut outputs[0], outcome),
            };
            self.pool.release(current);
            current = next;
        }
        self.pool.release(current);
    }

    fn serial_wave(
        &self,
        processor: &ReferenceProcessor<'a, '_>,
        wave: &[ObjectHandle],
        output: &mut WorkerOutput<'a>,
        outcome: &mut ReachabilityOutcome<'a>,
    ) -> Vec<ObjectHandle> {
        output.reached = self.pool.acquire();
        for &handle in wave {
            processor.process_object(handle, output);
        }
        Self::drain(output, outcome);
        std::mem::take(&mut output.reached)
    }

    fn parallel_wave(
        &self,
        processor: &ReferenceProcessor<'a, '_>,
        wave: &[ObjectHandle],
        workers: &ThreadPool,
        min_per_task: usize,
        outputs: &mut [WorkerOutput<'a>],
        outcome: &mut ReachabilityOutcome<'a>,
    ) -> Vec<ObjectHandle> {
        let batch = min_per_task
            .max(wave.len().div_ceil(workers.current_num_threads()))
            .max(wave.len().div_ceil(outputs.len()));
        let tasks = wave.len().div_ceil(batch);
        let pool = self.pool;

        workers.install(|| {
            outputs[..tasks]
                .par_iter_mut()
                .zip(wave.par_chunks(batch))
                .for_each(|(output, chunk)| {
                    output.reached = pool.acquire();
                    for &handle in chunk {
                        processor.process_object(handle, output);
                    }
                });
        });

        let mut next = self.pool.acquire();
        for output in &mut outputs[..tasks] {
            next.extend_from_slice(&output.reached);
            Self::drain(output, outcome);
            self.pool.release(std::mem::take(&mut output.reached));
        }
        next
    }

    /// Move a task's counters and weak slots into the outcome, keeping the
    /// task's buffers for the next wave.
    fn drain(output: &mut WorkerOutput<'a>, outcome: &mut ReachabilityOutcome<'a>) {
        outcome.objects_scanned += std::mem::take(&mut output.objects_scanned);
        outcome.weak_slots.append(&mut output.weak_slots);
    }
}
