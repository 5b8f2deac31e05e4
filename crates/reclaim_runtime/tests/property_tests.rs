//! Property-based tests for the collector.
//!
//! Random graphs are collected and the survivors compared against a plain
//! breadth-first search from the roots. Some graphs bundle consecutive nodes
//! into clusters whose nodes form a strong cycle, so keeping a cluster whole
//! keeps exactly what the search reaches. Every random edge is written after
//! the clusters exist.

use std::collections::{BTreeSet, VecDeque};
use std::ops::Range;

use proptest::prelude::*;
use reclaim_runtime::memory::{
    ClassDescriptor, FieldKind, GcConfig, GcContext, ObjectFlags, ObjectHandle, ReferenceKind,
};

const EDGES: usize = 0;
const WEAK: usize = 1;

#[derive(Debug, Clone)]
struct Graph {
    nodes: usize,
    edges: Vec<(usize, usize)>,
    weak_edges: Vec<(usize, usize)>,
    roots: Vec<usize>,
    /// Node ranges; the first node of each range is the cluster root.
    clusters: Vec<Range<usize>>,
}

impl Graph {
    /// The cycle joining the nodes of each cluster.
    fn cluster_edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.clusters
            .iter()
            .filter(|range| range.len() > 1)
            .flat_map(|range| {
                let range = range.clone();
                range.clone().map(move |from| {
                    let to = if from + 1 == range.end { range.start } else { from + 1 };
                    (from, to)
                })
            })
    }
}

/// Lay clusters of the given sizes over consecutive nodes, from node 0.
fn carve(nodes: usize, sizes: &[usize]) -> Vec<Range<usize>> {
    let mut start = 0;
    let mut clusters = Vec::new();
    for &size in sizes {
        if start + size > nodes {
            break;
        }
        clusters.push(start..start + size);
        start += size;
    }
    clusters
}

fn graph() -> impl Strategy<Value = Graph> {
    (1usize..80).prop_flat_map(|nodes| {
        (
            prop::collection::vec((0..nodes, 0..nodes), 0..nodes * 2),
            prop::collection::vec((0..nodes, 0..nodes), 0..nodes / 2 + 1),
            prop::collection::vec(0..nodes, 0..4),
            prop::collection::vec(1usize..6, 0..5),
        )
            .prop_map(move |(edges, weak_edges, roots, sizes)| Graph {
                nodes,
                edges,
                weak_edges,
                roots,
                clusters: carve(nodes, &sizes),
            })
    })
}

fn expected_survivors(graph: &Graph) -> BTreeSet<usize> {
    let edges: Vec<(usize, usize)> = graph
        .edges
        .iter()
        .copied()
        .chain(graph.cluster_edges())
        .collect();
    let mut seen: BTreeSet<usize> = graph.roots.iter().copied().collect();
    let mut queue: VecDeque<usize> = seen.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        for &(from, to) in &edges {
            if from == node && seen.insert(to) {
                queue.push_back(to);
            }
        }
    }
    seen
}

fn build(config: GcConfig, graph: &Graph) -> (GcContext, Vec<ObjectHandle>) {
    let gc = GcContext::new(config).unwrap();
    let node = gc
        .register_class(
            ClassDescriptor::new("Node")
                .field("edges", FieldKind::ReferenceArray(ReferenceKind::Strong))
                .field("observer", FieldKind::weak()),
        )
        .unwrap();
    let handles: Vec<ObjectHandle> = (0..graph.nodes)
        .map(|index| gc.create_object(node, format!("n{index}")).unwrap())
        .collect();
    for (from, to) in graph.cluster_edges() {
        gc.push_reference(handles[from], EDGES, Some(handles[to]))
            .unwrap();
    }
    for range in &graph.clusters {
        gc.create_cluster(handles[range.start], &handles[range.start + 1..range.end])
            .unwrap();
    }
    for &(from, to) in &graph.edges {
        gc.push_reference(handles[from], EDGES, Some(handles[to]))
            .unwrap();
    }
    for &(from, to) in &graph.weak_edges {
        gc.set_reference(handles[from], WEAK, Some(handles[to]))
            .unwrap();
    }
    for &root in &graph.roots {
        gc.add_to_root_set(handles[root]).unwrap();
    }
    (gc, handles)
}

fn survivors(gc: &GcContext, handles: &[ObjectHandle]) -> BTreeSet<usize> {
    handles
        .iter()
        .enumerate()
        .filter(|&(_, &handle)| gc.is_valid(handle))
        .map(|(index, _)| index)
        .collect()
}

fn parallel_config(workers: usize) -> GcConfig {
    GcConfig {
        worker_threads: workers,
        min_objects_per_task: 1,
        ..GcConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Survivors are exactly the objects reachable from the roots
    #[test]
    fn survivors_match_reachable_closure(graph in graph()) {
        let (gc, handles) = build(GcConfig::single_threaded(), &graph);
        let expected = expected_survivors(&graph);

        let stats = gc.collect_garbage(ObjectFlags::empty(), true);

        prop_assert_eq!(survivors(&gc, &handles), expected.clone());
        prop_assert_eq!(stats.objects_unreachable, graph.nodes - expected.len());
        prop_assert_eq!(stats.objects_purged, graph.nodes - expected.len());
    }

    /// A second collection with an unchanged graph finds no garbage
    #[test]
    fn collection_is_idempotent(graph in graph()) {
        let (gc, handles) = build(GcConfig::single_threaded(), &graph);
        gc.collect_garbage(ObjectFlags::empty(), true);
        let count = gc.object_count();
        let clusters = gc.cluster_count();

        let second = gc.collect_garbage(ObjectFlags::empty(), true);

        prop_assert_eq!(second.objects_unreachable, 0);
        prop_assert_eq!(second.clusters_dissolved, 0);
        prop_assert_eq!(gc.object_count(), count);
        prop_assert_eq!(gc.cluster_count(), clusters);
        prop_assert_eq!(survivors(&gc, &handles), expected_survivors(&graph));
    }

    /// The worker count never changes which objects survive
    #[test]
    fn worker_count_does_not_change_survivors(graph in graph(), workers in 2usize..6) {
        let (serial, serial_handles) = build(GcConfig::single_threaded(), &graph);
        let (parallel, parallel_handles) = build(parallel_config(workers), &graph);

        let serial_stats = serial.collect_garbage(ObjectFlags::empty(), true);
        let parallel_stats = parallel.collect_garbage(ObjectFlags::empty(), true);

        prop_assert!(parallel_stats.parallel);
        prop_assert_eq!(
            survivors(&serial, &serial_handles),
            survivors(&parallel, &parallel_handles)
        );
        prop_assert_eq!(
            survivors(&parallel, &parallel_handles),
            expected_survivors(&graph)
        );
        prop_assert_eq!(serial_stats.clusters_dissolved, parallel_stats.clusters_dissolved);
        prop_assert_eq!(serial.cluster_count(), parallel.cluster_count());
        prop_assert_eq!(serial_stats.objects_scanned, parallel_stats.objects_scanned);
        prop_assert_eq!(
            serial_stats.weak_references_cleared,
            parallel_stats.weak_references_cleared
        );
        prop_assert_eq!(parallel.array_pool_stats().in_use, 0);
    }

    /// Weak references never keep their target alive, and only references to
    /// dead objects are cleared
    #[test]
    fn weak_references_follow_survival(graph in graph()) {
        let (gc, handles) = build(GcConfig::single_threaded(), &graph);
        let expected = expected_survivors(&graph);

        gc.collect_garbage(ObjectFlags::empty(), true);

        prop_assert_eq!(survivors(&gc, &handles), expected.clone());
        for &from in &expected {
            let observed = gc.reference(handles[from], WEAK).unwrap();
            let last_weak = graph
                .weak_edges
                .iter()
                .rev()
                .find(|&&(source, _)| source == from)
                .map(|&(_, to)| to);
            match last_weak {
                Some(to) if expected.contains(&to) => {
                    prop_assert_eq!(observed, Some(handles[to]));
                }
                _ => {
                    prop_assert_eq!(observed, None);
                }
            }
        }
    }
}
