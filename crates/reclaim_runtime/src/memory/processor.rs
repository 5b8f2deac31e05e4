//! Per-edge reachability decisions.
//!
//! Every worker shares one [`ReferenceProcessor`]. State a worker produces
//! (newly reached objects, weak slots to revisit, counters) lives in its own
//! [`WorkerOutput`], so the only shared mutations are atomic flag operations.

use super::array_pool::GcArrayPool;
use super::class::{ClassRegistry, ReferenceKind};
use super::cluster::ClusterRegistry;
use super::object::{Object, ObjectFlags, ObjectHandle, RefSlot};
use super::table::ObjectTable;
use super::token_stream::TokenVisitor;
use crate::error::{GcError, fatal};

/// What one trace task produced.
#[derive(Default)]
pub struct WorkerOutput<'a> {
    /// Objects this worker claimed; they form part of the next wave.
    pub reached: Vec<ObjectHandle>,
    /// Weak slots whose target was unreachable when visited.
    pub weak_slots: Vec<&'a RefSlot>,
    pub objects_scanned: usize,
}

impl<'a> WorkerOutput<'a> {
    pub const fn new(reached: Vec<ObjectHandle>) -> Self {
        Self {
            reached,
            weak_slots: Vec::new(),
            objects_scanned: 0,
        }
    }
}

/// Shares the heap for `'a` and the cluster registry for `'c`. The registry
/// is borrowed per trace because clusters are dissolved between traces.
pub struct ReferenceProcessor<'a, 'c> {
    table: &'a ObjectTable,
    classes: &'a ClassRegistry,
    clusters: &'c ClusterRegistry,
    pool: &'a GcArrayPool,
    member_reference_keeps_cluster: bool,
}

impl<'a, 'c> ReferenceProcessor<'a, 'c> {
    pub const fn new(
        table: &'a ObjectTable,
        classes: &'a ClassRegistry,
        clusters: &'c ClusterRegistry,
        pool: &'a GcArrayPool,
        member_reference_keeps_cluster: bool,
    ) -> Self {
        Self {
            table,
            classes,
            clusters,
            pool,
            member_reference_keeps_cluster,
        }
    }

    /// Trace one object taken from the frontier.
    pub fn process_object(&self, handle: ObjectHandle, output: &mut WorkerOutput<'a>) {
        let Some(object) = self.table.get(handle) else {
            fatal(GcError::CorruptReference {
                target: handle.to_raw(),
                referencing: "frontier".into(),
                token: "queued object".into(),
            });
        };
        output.objects_scanned += 1;

        if object.flags().contains(ObjectFlags::CLUSTER_ROOT) {
            self.mark_referenced_clusters_as_reachable(handle, &mut output.reached);
        } else if object.owner().is_some() {
            self.mark_cluster_member_reachable(object, &mut output.reached);
        } else {
            let stream = self
                .classes
                .token_stream(object.class())
                .unwrap_or_else(|error| fatal(error));
            stream.walk(
                object,
                &mut EdgeVisitor {
                    processor: self,
                    output,
                    referencing: object,
                },
            );
        }
    }

    /// Apply the reachability rules to one edge of `referencing`.
    pub fn handle_object_reference(
        &self,
        output: &mut WorkerOutput<'a>,
        referencing: Option<&'a Object>,
        slot: &'a RefSlot,
        kind: ReferenceKind,
        allow_elimination: bool,
        token_index: Option<usize>,
    ) {
        let raw = slot.raw();
        if raw == 0 || self.table.resides_in_permanent_pool(raw) {
            return;
        }
        let Some(target) = self.table.get_raw(raw) else {
            self.corrupt_reference(raw, referencing, token_index);
        };
        let flags = target.flags().load();

        if kind == ReferenceKind::Weak {
            if allow_elimination && flags.contains(ObjectFlags::PENDING_KILL) {
                slot.clear();
            } else if flags.contains(ObjectFlags::UNREACHABLE) || target.owner().is_some() {
                output.weak_slots.push(slot);
            }
            return;
        }

        if allow_elimination && flags.contains(ObjectFlags::PENDING_KILL) {
            slot.clear();
            return;
        }

        if flags.contains(ObjectFlags::UNREACHABLE) {
            if target.flags().try_clear(ObjectFlags::UNREACHABLE) {
                debug_assert!(
                    target.owner().is_none(),
                    "cluster member {} flagged unreachable while its cluster is intact",
                    target.handle()
                );
                self.claimed(target, &mut output.reached);
            }
        } else if target.owner().is_some() && !flags.contains(ObjectFlags::REACHABLE_IN_CLUSTER) {
            self.mark_cluster_member_reachable(target, &mut output.reached);
        }

        if flags.contains(ObjectFlags::NO_STRONG_REFERENCE) {
            target.flags().remove(ObjectFlags::NO_STRONG_REFERENCE);
        }
    }

    /// Follow-up for an object this thread just cleared the unreachable flag of.
    fn claimed(&self, target: &Object, reached: &mut Vec<ObjectHandle>) {
        if target.flags().contains(ObjectFlags::CLUSTER_ROOT) {
            self.mark_referenced_clusters_as_reachable(target.handle(), reached);
        } else {
            reached.push(target.handle());
        }
    }

    /// Flag a cluster member as referenced from outside its cluster. When
    /// member references keep their cluster, the owning root is claimed too.
    pub fn mark_cluster_member_reachable(&self, member: &Object, reached: &mut Vec<ObjectHandle>) {
        if !member.flags().try_insert(ObjectFlags::REACHABLE_IN_CLUSTER) {
            return;
        }
        if !self.member_reference_keeps_cluster {
            return;
        }
        let Some(owner) = member.owner() else {
            return;
        };
        let Some(root) = self.table.get(owner) else {
            self.corrupt_reference(owner.to_raw(), Some(member), None);
        };
        if root.flags().try_clear(ObjectFlags::UNREACHABLE) {
            root.flags().remove(ObjectFlags::NO_STRONG_REFERENCE);
            self.mark_referenced_clusters_as_reachable(owner, reached);
        }
    }

    /// Mark everything the cluster rooted at `root` keeps alive, following
    /// cluster-to-cluster references transitively. Each cluster is expanded
    /// by whichever thread claimed its root.
    pub fn mark_referenced_clusters_as_reachable(
        &self,
        root: ObjectHandle,
        reached: &mut Vec<ObjectHandle>,
    ) {
        let mut pending = self.pool.acquire();
        pending.push(root);

        while let Some(current) = pending.pop() {
            let Some(cluster) = self.clusters.get(current) else {
                fatal(GcError::ClusterInvariant(format!(
                    "object {current} is flagged as a cluster root but has no cluster"
                )));
            };

            for &mutable in &cluster.mutable_objects {
                self.mark_mutable_object(mutable, current, &mut pending, reached);
            }

            for &referenced in &cluster.referenced_clusters {
                let Some(referenced_root) = self.table.get(referenced) else {
                    self.corrupt_reference(referenced.to_raw(), self.table.get(current), None);
                };
                if referenced_root.flags().try_clear(ObjectFlags::UNREACHABLE) {
                    referenced_root
                        .flags()
                        .remove(ObjectFlags::NO_STRONG_REFERENCE);
                    pending.push(referenced);
                }
            }
        }

        self.pool.release(pending);
    }

    fn mark_mutable_object(
        &self,
        handle: ObjectHandle,
        cluster: ObjectHandle,
        pending_clusters: &mut Vec<ObjectHandle>,
        reached: &mut Vec<ObjectHandle>,
    ) {
        if self.table.resides_in_permanent_pool(handle.to_raw()) {
            return;
        }
        let Some(object) = self.table.get(handle) else {
            self.corrupt_reference(handle.to_raw(), self.table.get(cluster), None);
        };
        let flags = object.flags().load();

        if flags.contains(ObjectFlags::UNREACHABLE) {
            if object.flags().try_clear(ObjectFlags::UNREACHABLE) {
                object.flags().remove(ObjectFlags::NO_STRONG_REFERENCE);
                if flags.contains(ObjectFlags::CLUSTER_ROOT) {
                    pending_clusters.push(handle);
                } else {
                    reached.push(handle);
                }
            }
        } else if object.owner().is_some() && !flags.contains(ObjectFlags::REACHABLE_IN_CLUSTER) {
            self.mark_cluster_member_reachable(object, reached);
        }
    }

    #[cold]
    fn corrupt_reference(
        &self,
        raw: u32,
        referencing: Option<&Object>,
        token_index: Option<usize>,
    ) -> ! {
        let token = match (referencing, token_index) {
            (Some(object), Some(index)) => self
                .classes
                .token_stream(object.class())
                .map_or_else(|_| format!("token: {index}"), |stream| stream.describe(index)),
            _ => "no token".to_string(),
        };
        fatal(GcError::CorruptReference {
            target: raw,
            referencing: referencing.map_or_else(|| "NULL".to_string(), |object| object.name().to_string()),
            token,
        });
    }
}

struct EdgeVisitor<'p, 'a, 'c, 'o> {
    processor: &'p ReferenceProcessor<'a, 'c>,
    output: &'o mut WorkerOutput<'a>,
    referencing: &'a Object,
}

impl<'a> TokenVisitor<'a> for EdgeVisitor<'_, 'a, '_, '_> {
    fn visit_reference(&mut self, slot: &'a RefSlot, kind: ReferenceKind, token_index: usize) {
        self.processor.handle_object_reference(
            self.output,
            Some(self.referencing),
            slot,
            kind,
            true,
            Some(token_index),
        );
    }
}
