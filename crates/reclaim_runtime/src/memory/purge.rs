//! Incremental destruction of unreachable objects.
//!
//! Purging happens in two phases that may be spread over many calls:
//!
//! 1. Walk the table and route `begin_destroy` to every unreachable object,
//!    then `finish_destroy` once it reports ready. Objects that are not ready
//!    are parked and retried after the walk.
//! 2. Once every object has finished destroying, walk the table again and
//!    free the unreachable slots.
//!
//! With a time limit the deadline is polled every few objects, after the
//! object at hand has been processed, so each call makes some progress.

use std::time::Duration;

use reclaim_utils::Stopwatch;

use super::class::{ClassInfo, ClassLifecycle, ClassRegistry};
use super::object::{Object, ObjectFlags, ObjectHandle};
use super::table::ObjectTable;
use crate::error::{GcError, fatal};

const DESTROY_POLL_GRANULARITY: usize = 10;
const FINISH_DESTROY_POLL_GRANULARITY: usize = 10;
const SWEEP_POLL_GRANULARITY: usize = 100;
const FINISH_DESTROY_STALL_WARNING: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeProgress {
    /// Objects freed by this call.
    pub objects_purged: usize,
    /// The purge has finished and no further calls are needed.
    pub completed: bool,
}

#[derive(Debug, Default)]
pub struct IncrementalPurge {
    purge_required: bool,
    cursor: usize,
    cursor_needs_reset: bool,
    finish_destroy_routed_to_all: bool,
    pending_finish_destroy: Vec<ObjectHandle>,
    objects_purged: usize,
    objects_at_mark: usize,
}

impl IncrementalPurge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the purge after a mark that considered `objects_at_mark` objects.
    pub fn request(&mut self, objects_at_mark: usize) {
        self.purge_required = true;
        self.cursor_needs_reset = true;
        self.finish_destroy_routed_to_all = false;
        self.objects_purged = 0;
        self.objects_at_mark = objects_at_mark;
    }

    pub const fn is_pending(&self) -> bool {
        self.purge_required
    }

    pub fn pending_finish_destroy(&self) -> &[ObjectHandle] {
        &self.pending_finish_destroy
    }

    /// Advance the purge. `None` runs it to completion.
    pub fn run(
        &mut self,
        table: &mut ObjectTable,
        classes: &ClassRegistry,
        time_limit: Option<Duration>,
    ) -> PurgeProgress {
        if !self.purge_required {
            return PurgeProgress {
                objects_purged: 0,
                completed: true,
            };
        }

        let watch = time_limit.map_or_else(Stopwatch::start_new, Stopwatch::with_limit);
        let purged_before = self.objects_purged;

        if self.cursor_needs_reset {
            self.cursor = table.first_gc_index();
            self.cursor_needs_reset = false;
        }

        let mut time_limit_reached = false;
        if !self.finish_destroy_routed_to_all {
            time_limit_reached =
                self.route_destroy(table, classes, &watch, time_limit.is_some());
        }

        let mut completed = false;
        if self.finish_destroy_routed_to_all && !time_limit_reached {
            completed = self.sweep(table, &watch);
        }

        let progress = PurgeProgress {
            objects_purged: self.objects_purged - purged_before,
            completed,
        };
        if completed {
            tracing::info!(
                "GC purged {} objects ({} -> {}) in {:.3} ms",
                self.objects_purged,
                self.objects_at_mark,
                self.objects_at_mark.saturating_sub(self.objects_purged),
                watch.elapsed_ms()
            );
            *self = Self {
                pending_finish_destroy: std::mem::take(&mut self.pending_finish_destroy),
                ..Self::default()
            };
        }
        progress
    }

    /// Phase 1. Returns true when the time limit cut it short.
    fn route_destroy(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
        watch: &Stopwatch,
        use_time_limit: bool,
    ) -> bool {
        let mut polls = 0usize;
        while self.cursor < table.capacity() {
            if let Some(object) = table.slot(self.cursor)
                && object.is_unreachable()
            {
                debug_assert!(
                    !object.flags().contains(ObjectFlags::FINISH_DESTROYED),
                    "object {} finished destroying before the purge reached it",
                    object.handle()
                );
                let lifecycle = lifecycle(classes, object);
                conditional_begin_destroy(object, lifecycle);
                if is_ready_for_finish_destroy(object, lifecycle) {
                    conditional_finish_destroy(object, lifecycle);
                } else {
                    self.pending_finish_destroy.push(object.handle());
                }
            }
            self.cursor += 1;

            let poll = polls % DESTROY_POLL_GRANULARITY == 0;
            polls += 1;
            if poll && watch.exceeded() {
                return true;
            }
        }

        let mut time_limit_reached = false;
        let mut stalled_since = Stopwatch::start_new();
        let mut last_pending = self.pending_finish_destroy.len();
        let mut polls = 0usize;

        while !self.pending_finish_destroy.is_empty() {
            let mut index = 0;
            while index < self.pending_finish_destroy.len() {
                let handle = self.pending_finish_destroy[index];
                match table.get(handle) {
                    Some(object) => {
                        let lifecycle = lifecycle(classes, object);
                        if is_ready_for_finish_destroy(object, lifecycle) {
                            conditional_finish_destroy(object, lifecycle);
                            self.pending_finish_destroy.swap_remove(index);
                        } else {
                            index += 1;
                        }
                    }
                    None => {
                        self.pending_finish_destroy.swap_remove(index);
                    }
                }

                let poll = polls % FINISH_DESTROY_POLL_GRANULARITY == 0;
                polls += 1;
                if poll && watch.exceeded() {
                    time_limit_reached = true;
                    break;
                }
            }

            if use_time_limit {
                break;
            }
            if !self.pending_finish_destroy.is_empty() {
                if self.pending_finish_destroy.len() != last_pending {
                    last_pending = self.pending_finish_destroy.len();
                    stalled_since = Stopwatch::start_new();
                } else if stalled_since.elapsed() > FINISH_DESTROY_STALL_WARNING {
                    tracing::warn!(
                        pending = last_pending,
                        "objects still not ready for finish_destroy after {:.1} s",
                        stalled_since.elapsed().as_secs_f64()
                    );
                    stalled_since = Stopwatch::start_new();
                }
                std::thread::yield_now();
            }
        }

        if self.pending_finish_destroy.is_empty() {
            self.pending_finish_destroy.shrink_to(256);
            self.finish_destroy_routed_to_all = true;
            self.cursor_needs_reset = true;
        }
        time_limit_reached
    }

    /// Phase 2. Returns true when every unreachable object has been freed.
    fn sweep(&mut self, table: &mut ObjectTable, watch: &Stopwatch) -> bool {
        if self.cursor_needs_reset {
            self.cursor = table.first_gc_index();
            self.cursor_needs_reset = false;
        }

        let mut freed = 0usize;
        while self.cursor < table.capacity() {
            let doomed = table
                .slot(self.cursor)
                .filter(|object| object.is_unreachable())
                .map(|object| (object.handle(), object.flags().load()));
            self.cursor += 1;

            let Some((handle, flags)) = doomed else {
                continue;
            };
            if !flags.contains(ObjectFlags::BEGIN_DESTROYED) {
                fatal(GcError::PurgeProtocol {
                    object: handle,
                    missing: "begin_destroy",
                });
            }
            if !flags.contains(ObjectFlags::FINISH_DESTROYED) {
                fatal(GcError::PurgeProtocol {
                    object: handle,
                    missing: "finish_destroy",
                });
            }
            table.free(handle);
            self.objects_purged += 1;
            freed += 1;

            if freed % SWEEP_POLL_GRANULARITY == 0 && watch.exceeded() {
                return false;
            }
        }
        true
    }
}

fn lifecycle(classes: &ClassRegistry, object: &Object) -> ClassLifecycle {
    classes
        .get(object.class())
        .map(ClassInfo::lifecycle)
        .unwrap_or_default()
}

fn conditional_begin_destroy(object: &Object, lifecycle: ClassLifecycle) {
    if object.flags().try_insert(ObjectFlags::BEGIN_DESTROYED)
        && let Some(begin_destroy) = lifecycle.begin_destroy
    {
        begin_destroy(object);
    }
}

fn is_ready_for_finish_destroy(object: &Object, lifecycle: ClassLifecycle) -> bool {
    lifecycle
        .is_ready_for_finish_destroy
        .is_none_or(|ready| ready(object))
}

fn conditional_finish_destroy(object: &Object, lifecycle: ClassLifecycle) {
    if object.flags().try_insert(ObjectFlags::FINISH_DESTROYED)
        && let Some(finish_destroy) = lifecycle.finish_destroy
    {
        finish_destroy(object);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::memory::class::{ClassDescriptor, ClassId};

    fn populate(table: &mut ObjectTable, class: ClassId, live: usize, dead: usize) -> Vec<ObjectHandle> {
        let mut doomed = Vec::new();
        for index in 0..live + dead {
            let handle = table.allocate(class, format!("obj_{index}"), Box::new([])).unwrap();
            if index >= live {
                doomed.push(handle);
            }
        }
        for &handle in &doomed {
            table.get(handle).unwrap().flags().insert(ObjectFlags::UNREACHABLE);
        }
        doomed
    }

    #[test]
    fn test_full_purge_frees_unreachable_objects() {
        static FINISHED: AtomicUsize = AtomicUsize::new(0);
        fn count_finish(_: &Object) {
            FINISHED.fetch_add(1, Ordering::SeqCst);
        }

        let mut classes = ClassRegistry::new();
        let class = classes
            .register(ClassDescriptor::new("Counted").on_finish_destroy(count_finish))
            .unwrap();
        let mut table = ObjectTable::new();
        let doomed = populate(&mut table, class, 5, 7);

        let mut purge = IncrementalPurge::new();
        purge.request(12);
        let progress = purge.run(&mut table, &classes, None);

        assert_eq!(progress.objects_purged, 7);
        assert!(progress.completed);
        assert!(!purge.is_pending());
        assert_eq!(FINISHED.load(Ordering::SeqCst), 7);
        assert_eq!(table.len(), 5);
        assert!(doomed.iter().all(|&handle| !table.contains(handle)));
    }

    #[test]
    fn test_not_ready_objects_defer_sweep() {
        static READY: AtomicBool = AtomicBool::new(false);
        fn gate(_: &Object) -> bool {
            READY.load(Ordering::SeqCst)
        }

        let mut classes = ClassRegistry::new();
        let class = classes
            .register(ClassDescriptor::new("Fenced").ready_for_finish_destroy(gate))
            .unwrap();
        let mut table = ObjectTable::new();
        let doomed = populate(&mut table, class, 2, 3);

        let mut purge = IncrementalPurge::new();
        purge.request(5);
        let progress = purge.run(&mut table, &classes, Some(Duration::from_secs(60)));

        assert_eq!(progress.objects_purged, 0);
        assert!(!progress.completed);
        assert!(purge.is_pending());
        assert_eq!(purge.pending_finish_destroy().len(), 3);
        for &handle in &doomed {
            let flags = table.get(handle).unwrap().flags().load();
            assert!(flags.contains(ObjectFlags::BEGIN_DESTROYED));
            assert!(!flags.contains(ObjectFlags::FINISH_DESTROYED));
        }

        READY.store(true, Ordering::SeqCst);
        let progress = purge.run(&mut table, &classes, Some(Duration::from_secs(60)));
        assert_eq!(progress.objects_purged, 3);
        assert!(progress.completed);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_zero_budget_still_makes_progress() {
        let mut classes = ClassRegistry::new();
        let class = classes.register(ClassDescriptor::new("Plain")).unwrap();
        let mut table = ObjectTable::new();
        populate(&mut table, class, 0, 450);

        let mut purge = IncrementalPurge::new();
        purge.request(450);
        let mut calls = 0;
        let mut total = 0;
        loop {
            calls += 1;
            let progress = purge.run(&mut table, &classes, Some(Duration::ZERO));
            total += progress.objects_purged;
            if progress.completed {
                break;
            }
            assert!(calls < 1000, "purge stopped making progress");
        }

        assert_eq!(total, 450);
        assert!(table.is_empty());
        assert!(calls > 1);
    }

    #[test]
    fn test_run_without_request_is_noop() {
        let classes = ClassRegistry::new();
        let mut table = ObjectTable::new();
        let mut purge = IncrementalPurge::new();
        assert_eq!(
            purge.run(&mut table, &classes, None),
            PurgeProgress {
                objects_purged: 0,
                completed: true,
            }
        );
    }

    #[test]
    #[should_panic(expected = "without finish_destroy")]
    fn test_sweep_rejects_undestroyed_object() {
        let mut classes = ClassRegistry::new();
        let class = classes.register(ClassDescriptor::new("Plain")).unwrap();
        let mut table = ObjectTable::new();
        let handle = table.allocate(class, "rogue".into(), Box::new([])).unwrap();

        let mut purge = IncrementalPurge::new();
        purge.request(1);
        purge.finish_destroy_routed_to_all = true;
        table
            .get(handle)
            .unwrap()
            .flags()
            .insert(ObjectFlags::UNREACHABLE | ObjectFlags::BEGIN_DESTROYED);
        purge.run(&mut table, &classes, None);
    }
}
