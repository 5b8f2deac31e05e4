//! Clusters: groups of objects that live and die together.
//!
//! The root stands for every member during marking. References leaving the
//! cluster are recorded when it is created, and again whenever a reference
//! field of the root or a member is written, split into references to other
//! clusters and references to standalone ("mutable") objects. Marking a
//! cluster never walks its members, so their weak references are nulled by a
//! separate pass once marking is done.

use ahash::{AHashMap, AHashSet};

use super::class::{ClassRegistry, ReferenceKind};
use super::object::{Object, ObjectFlags, ObjectHandle, RefSlot};
use super::table::ObjectTable;
use super::token_stream::TokenVisitor;
use crate::error::{GcError, GcResult, fatal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub root: ObjectHandle,
    /// Members, root excluded.
    pub objects: Vec<ObjectHandle>,
    /// Roots of clusters referenced from inside this one.
    pub referenced_clusters: Vec<ObjectHandle>,
    /// Standalone objects referenced from inside this one.
    pub mutable_objects: Vec<ObjectHandle>,
}

#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: AHashMap<ObjectHandle, Cluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn get(&self, root: ObjectHandle) -> Option<&Cluster> {
        self.clusters.get(&root)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn create_cluster(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
        root: ObjectHandle,
        members: &[ObjectHandle],
    ) -> GcResult<&Cluster> {
        let root_object = clusterable(table, root)?;

        let mut membership = AHashSet::with_capacity(members.len() + 1);
        membership.insert(root);
        let mut objects = Vec::with_capacity(members.len());
        for &member in members {
            let object = clusterable(table, member)?;
            if membership.insert(member) {
                objects.push(object.handle());
            }
        }

        let mut cluster = Cluster {
            root,
            objects,
            referenced_clusters: Vec::new(),
            mutable_objects: Vec::new(),
        };
        let sources: Vec<ObjectHandle> = membership.into_iter().collect();
        classify_edges(table, classes, &mut cluster, &sources)?;
        cluster.referenced_clusters.sort_unstable();
        cluster.mutable_objects.sort_unstable();

        for &member in &cluster.objects {
            if let Some(object) = table.get(member) {
                object.set_owner(Some(root));
            }
        }
        root_object.flags().insert(ObjectFlags::CLUSTER_ROOT);

        tracing::debug!(
            root = %root,
            members = cluster.objects.len(),
            referenced_clusters = cluster.referenced_clusters.len(),
            mutable_objects = cluster.mutable_objects.len(),
            "created cluster"
        );

        Ok(&*self.clusters.entry(root).or_insert(cluster))
    }

    /// Fold the strong references `source` holds now into the bookkeeping of
    /// the cluster it belongs to. Call after writing a reference field of a
    /// cluster root or member; a no-op for standalone objects. Targets that
    /// are no longer referenced stay recorded until the cluster dissolves.
    pub fn record_references_from(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
        source: ObjectHandle,
    ) -> GcResult<()> {
        let Some(object) = table.get(source) else {
            return Err(GcError::InvalidHandle(source));
        };
        let root = if object.flags().contains(ObjectFlags::CLUSTER_ROOT) {
            source
        } else if let Some(owner) = object.owner() {
            owner
        } else {
            return Ok(());
        };
        let Some(cluster) = self.clusters.get_mut(&root) else {
            return Err(GcError::ClusterInvariant(format!(
                "object {source} belongs to unregistered cluster {root}"
            )));
        };
        let added = classify_edges(table, classes, cluster, &[source])?;
        if added > 0 {
            tracing::trace!(root = %root, source = %source, added, "recorded cluster references");
        }
        Ok(())
    }

    /// Null weak references held by members of intact clusters whose target
    /// is unreachable. Returns the number of slots cleared.
    pub fn clear_weak_references(
        &self,
        table: &ObjectTable,
        classes: &ClassRegistry,
    ) -> GcResult<usize> {
        let mut clearer = WeakReferenceClearer { table, cleared: 0 };
        for cluster in self.clusters.values() {
            for &handle in std::iter::once(&cluster.root).chain(&cluster.objects) {
                if let Some(object) = table.get(handle) {
                    classes.token_stream(object.class())?.walk(object, &mut clearer);
                }
            }
        }
        Ok(clearer.cleared)
    }

    /// Re-classify every strong edge held by the cluster rooted at `root`.
    fn refresh(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
        root: ObjectHandle,
    ) -> GcResult<()> {
        let Some(cluster) = self.clusters.get_mut(&root) else {
            return Ok(());
        };
        let sources: Vec<ObjectHandle> = std::iter::once(root)
            .chain(cluster.objects.iter().copied())
            .collect();
        classify_edges(table, classes, cluster, &sources)?;
        Ok(())
    }

    /// Break up the cluster rooted at `root`. Members that were reached from
    /// outside this mark become standalone and stay reachable; the rest are
    /// flagged unreachable. Clusters that referenced this one re-classify
    /// their edges, so the former objects they point at become their mutable
    /// objects.
    pub fn dissolve(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
        root: ObjectHandle,
    ) -> Option<Cluster> {
        let cluster = self.clusters.remove(&root)?;

        if let Some(root_object) = table.get(root) {
            root_object
                .flags()
                .remove(ObjectFlags::CLUSTER_ROOT | ObjectFlags::NO_STRONG_REFERENCE);
        }
        for &member in &cluster.objects {
            let Some(object) = table.get(member) else {
                continue;
            };
            object.set_owner(None);
            object.flags().remove(ObjectFlags::NO_STRONG_REFERENCE);
            if !object.flags().contains(ObjectFlags::REACHABLE_IN_CLUSTER) {
                object.flags().insert(ObjectFlags::UNREACHABLE);
            }
        }

        let mut referencing = Vec::new();
        for other in self.clusters.values_mut() {
            if let Some(position) = other.referenced_clusters.iter().position(|&r| r == root) {
                other.referenced_clusters.swap_remove(position);
                referencing.push(other.root);
            }
        }
        for other in referencing {
            self.refresh(table, classes, other)
                .unwrap_or_else(|error| fatal(error));
        }

        tracing::trace!(root = %root, members = cluster.objects.len(), "dissolved cluster");
        Some(cluster)
    }

    /// Dissolve every unreachable cluster with a member reached from outside.
    /// The surviving members are pushed onto `frontier` for tracing.
    pub fn dissolve_clusters_with_reachable_members(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
        frontier: &mut Vec<ObjectHandle>,
    ) -> usize {
        let doomed: Vec<ObjectHandle> = self
            .clusters
            .values()
            .filter(|cluster| {
                is_unreachable(table, cluster.root)
                    && cluster.objects.iter().any(|&member| {
                        table.get(member).is_some_and(|object| {
                            object.flags().contains(ObjectFlags::REACHABLE_IN_CLUSTER)
                        })
                    })
            })
            .map(|cluster| cluster.root)
            .collect();

        for &root in &doomed {
            if let Some(cluster) = self.dissolve(table, classes, root) {
                frontier.extend(cluster.objects.iter().copied().filter(|&member| {
                    table
                        .get(member)
                        .is_some_and(|object| !object.is_unreachable())
                }));
            }
        }
        doomed.len()
    }

    /// Dissolve every cluster whose root is still unreachable after marking.
    pub fn dissolve_unreachable_clusters(
        &mut self,
        table: &ObjectTable,
        classes: &ClassRegistry,
    ) -> usize {
        let doomed: Vec<ObjectHandle> = self
            .clusters
            .keys()
            .copied()
            .filter(|&root| is_unreachable(table, root))
            .collect();
        for &root in &doomed {
            self.dissolve(table, classes, root);
        }
        doomed.len()
    }

    /// Check the structural invariants of the cluster rooted at `root`.
    pub fn verify_cluster_assumptions(&self, table: &ObjectTable, root: ObjectHandle) -> GcResult<()> {
        let broken = |reason: String| Err(GcError::ClusterInvariant(format!("cluster {root}: {reason}")));

        let Some(cluster) = self.clusters.get(&root) else {
            return broken("not registered".into());
        };
        let Some(root_object) = table.get(root) else {
            return broken("root has been freed".into());
        };
        if !root_object.flags().contains(ObjectFlags::CLUSTER_ROOT) {
            return broken("root is not flagged as a cluster root".into());
        }
        if root_object.owner().is_some() {
            return broken("root belongs to another cluster".into());
        }
        for &member in &cluster.objects {
            let Some(object) = table.get(member) else {
                return broken(format!("member {member} has been freed"));
            };
            if object.owner() != Some(root) {
                return broken(format!("member {member} has owner {:?}", object.owner()));
            }
            if object.is_unreachable() {
                return broken(format!("member {member} is flagged unreachable"));
            }
        }
        for &referenced in &cluster.referenced_clusters {
            if !self.clusters.contains_key(&referenced) {
                return broken(format!("referenced cluster {referenced} does not exist"));
            }
        }
        for &mutable in &cluster.mutable_objects {
            if !table.contains(mutable) {
                return broken(format!("mutable object {mutable} has been freed"));
            }
        }
        Ok(())
    }

    pub fn verify_all(&self, table: &ObjectTable) -> GcResult<()> {
        self.clusters
            .keys()
            .try_for_each(|&root| self.verify_cluster_assumptions(table, root))
    }
}

fn is_unreachable(table: &ObjectTable, handle: ObjectHandle) -> bool {
    table.get(handle).is_some_and(Object::is_unreachable)
}

fn clusterable(table: &ObjectTable, handle: ObjectHandle) -> GcResult<&Object> {
    let object = table.get(handle).ok_or(GcError::InvalidHandle(handle))?;
    let invalid = |reason| {
        Err(GcError::InvalidCluster {
            object: handle,
            reason,
        })
    };
    if table.resides_in_permanent_pool(handle.to_raw()) {
        return invalid("object is in the permanent pool");
    }
    if object.owner().is_some() {
        return invalid("object already belongs to a cluster");
    }
    if object.flags().contains(ObjectFlags::CLUSTER_ROOT) {
        return invalid("object is already a cluster root");
    }
    if object.flags().intersects(ObjectFlags::UNREACHABLE | ObjectFlags::PENDING_KILL) {
        return invalid("object is pending destruction");
    }
    Ok(object)
}

/// Walk `sources` and add the strong targets outside `cluster` to its
/// bookkeeping. Returns the number of new entries.
fn classify_edges(
    table: &ObjectTable,
    classes: &ClassRegistry,
    cluster: &mut Cluster,
    sources: &[ObjectHandle],
) -> GcResult<usize> {
    let membership: AHashSet<ObjectHandle> = std::iter::once(cluster.root)
        .chain(cluster.objects.iter().copied())
        .collect();
    let mut classifier = EdgeClassifier::new(table, &membership);
    for &handle in sources {
        if let Some(object) = table.get(handle) {
            classes
                .token_stream(object.class())?
                .walk(object, &mut classifier);
        }
    }
    Ok(merge_unique(&mut cluster.referenced_clusters, classifier.referenced_clusters)
        + merge_unique(&mut cluster.mutable_objects, classifier.mutable_objects))
}

/// Append the handles `list` does not hold yet; returns how many were added.
fn merge_unique(list: &mut Vec<ObjectHandle>, handles: AHashSet<ObjectHandle>) -> usize {
    let before = list.len();
    for handle in handles {
        if !list.contains(&handle) {
            list.push(handle);
        }
    }
    list.len() - before
}

struct EdgeClassifier<'t> {
    table: &'t ObjectTable,
    membership: &'t AHashSet<ObjectHandle>,
    referenced_clusters: AHashSet<ObjectHandle>,
    mutable_objects: AHashSet<ObjectHandle>,
}

impl<'t> EdgeClassifier<'t> {
    fn new(table: &'t ObjectTable, membership: &'t AHashSet<ObjectHandle>) -> Self {
        Self {
            table,
            membership,
            referenced_clusters: AHashSet::new(),
            mutable_objects: AHashSet::new(),
        }
    }
}

impl<'a> TokenVisitor<'a> for EdgeClassifier<'_> {
    fn visit_reference(&mut self, slot: &'a RefSlot, kind: ReferenceKind, _token_index: usize) {
        if kind == ReferenceKind::Weak {
            return;
        }
        let raw = slot.raw();
        if raw == 0 || self.table.resides_in_permanent_pool(raw) {
            return;
        }
        let Some(target) = self.table.get_raw(raw) else {
            return;
        };
        let handle = target.handle();
        if self.membership.contains(&handle) {
            return;
        }
        if let Some(owner) = target.owner() {
            self.referenced_clusters.insert(owner);
        } else if target.flags().contains(ObjectFlags::CLUSTER_ROOT) {
            self.referenced_clusters.insert(handle);
        } else {
            self.mutable_objects.insert(handle);
        }
    }
}

/// Nulls weak slots whose target was left unreachable by marking.
pub(crate) struct WeakReferenceClearer<'t> {
    pub(crate) table: &'t ObjectTable,
    pub(crate) cleared: usize,
}

impl<'a> TokenVisitor<'a> for WeakReferenceClearer<'_> {
    fn visit_reference(&mut self, slot: &'a RefSlot, kind: ReferenceKind, _token_index: usize) {
        if kind != ReferenceKind::Weak {
            return;
        }
        if self.table.get_raw(slot.raw()).is_some_and(Object::is_unreachable) {
            slot.clear();
            self.cleared += 1;
        }
    }
}
