//! Reclaim command line
//!
//! Run with: `reclaim [COMMAND]`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use reclaim_runtime::memory::{ClassDescriptor, ClassId, FieldKind, ReferenceKind};
use reclaim_runtime::{GcConfig, GcContext, GcStats, ObjectFlags, ObjectHandle, RuntimeConfig};
use reclaim_utils::{Benchmark, Stopwatch, init_logging};

const LINKS: usize = 0;
const OBSERVER: usize = 1;

#[derive(Parser)]
#[command(name = "reclaim")]
#[command(about = "Drive the reclaim garbage collector over synthetic object graphs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML runtime configuration (requires the toml-config feature)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Trace worker count (0 = one per logical CPU)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Never mark in parallel
    #[arg(long, global = true)]
    single_threaded: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a graph, collect it and purge incrementally
    Stress {
        #[command(flatten)]
        graph: GraphArgs,

        /// Budget of one incremental purge step in milliseconds
        #[arg(long)]
        purge_budget_ms: Option<f64>,
    },

    /// Time repeated full collections
    Bench {
        #[command(flatten)]
        graph: GraphArgs,

        /// Number of timed collections
        #[arg(short, long, default_value_t = 10)]
        iterations: usize,
    },
}

#[derive(Args, Clone, Debug)]
struct GraphArgs {
    /// Objects in the random part of the graph
    #[arg(short, long, default_value_t = 100_000)]
    objects: usize,

    /// Strong references per object
    #[arg(long, default_value_t = 2)]
    fan_out: usize,

    /// Objects added to the root set
    #[arg(long, default_value_t = 16)]
    roots: usize,

    /// Clusters built next to the random graph
    #[arg(long, default_value_t = 64)]
    clusters: usize,

    /// Members per cluster
    #[arg(long, default_value_t = 32)]
    cluster_size: usize,

    /// Seed for the graph generator
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RuntimeConfig::default(),
    }
    .merge_with_env();

    if cli.verbose {
        config.logging.filter = Some("reclaim=debug,reclaim_runtime=debug".to_string());
    }
    init_logging(config.logging.filter.as_deref());

    if let Some(workers) = cli.workers {
        config.gc.worker_threads = workers;
    }
    if cli.single_threaded {
        config.gc = GcConfig {
            allow_parallel_gc: false,
            ..config.gc
        };
    }
    config.validate()?;

    match cli.command {
        Commands::Stress {
            graph,
            purge_budget_ms,
        } => {
            if let Some(budget) = purge_budget_ms {
                config.gc.incremental_purge_time_limit_ms = budget;
                config.validate()?;
            }
            stress(config.gc, &graph)
        }
        Commands::Bench { graph, iterations } => bench(config.gc, &graph, iterations),
    }
}

fn stress(config: GcConfig, args: &GraphArgs) -> Result<()> {
    let gc = GcContext::new(config)?;
    let class = register_classes(&gc)?;

    let watch = Stopwatch::start_new();
    let population = populate(&gc, class, args)?;
    info!(
        objects = gc.object_count(),
        roots = population.roots,
        clusters = gc.cluster_count(),
        "built graph in {:.3} ms",
        watch.elapsed_ms()
    );

    let stats = gc.collect_garbage(ObjectFlags::empty(), false);
    report(&stats);

    let watch = Stopwatch::start_new();
    let mut steps = 0usize;
    let mut purged = 0usize;
    loop {
        steps += 1;
        let progress = gc.incremental_purge_garbage(true);
        purged += progress.objects_purged;
        if progress.completed {
            break;
        }
    }
    println!(
        "purge:       {purged} objects in {steps} steps ({:.3} ms)",
        watch.elapsed_ms()
    );

    let second = gc.collect_garbage(ObjectFlags::empty(), true);
    println!(
        "recollect:   {} unreachable, {} live",
        second.objects_unreachable,
        gc.object_count()
    );

    let pool = gc.array_pool_stats();
    println!(
        "array pool:  {} acquired, {} released, {} allocated",
        pool.acquired, pool.released, pool.allocated
    );
    gc.shutdown();
    Ok(())
}

fn bench(config: GcConfig, args: &GraphArgs, iterations: usize) -> Result<()> {
    let gc = GcContext::new(config)?;
    let class = register_classes(&gc)?;
    let survivors = populate(&gc, class, args)?;
    gc.collect_garbage(ObjectFlags::empty(), true);
    let live = gc.object_count();

    // each iteration adds a fresh, unrooted batch of garbage
    let mut round = 0u64;
    let garbage = GraphArgs {
        objects: args.objects / 4,
        roots: 0,
        clusters: args.clusters / 4,
        ..args.clone()
    };
    let mut failure = None;
    let result = Benchmark::new("collect_garbage", iterations).run(
        || {
            round += 1;
            let garbage = GraphArgs {
                seed: args.seed.wrapping_add(round),
                ..garbage.clone()
            };
            if let Err(error) = populate(&gc, class, &garbage) {
                failure.get_or_insert(error);
            }
        },
        |()| gc.collect_garbage(ObjectFlags::empty(), true),
    );
    if let Some(error) = failure {
        return Err(error);
    }

    println!("{result}");
    println!(
        "Live objects: {live} ({} roots), throughput {:.0} objects/s",
        survivors.roots,
        result.throughput(live + garbage.objects)
    );
    gc.shutdown();
    Ok(())
}

fn report(stats: &GcStats) {
    println!(
        "collect:     {} considered, {} scanned, {} unreachable in {} ms",
        stats.objects_considered, stats.objects_scanned, stats.objects_unreachable, stats.duration_ms
    );
    println!(
        "             {} waves ({}), {} clusters dissolved, {} weak references cleared",
        stats.waves,
        if stats.parallel { "parallel" } else { "serial" },
        stats.clusters_dissolved,
        stats.weak_references_cleared
    );
    for phase in &stats.phases {
        println!(
            "  {:<24} {:>10.3} ms",
            phase.name,
            phase.duration.as_secs_f64() * 1000.0
        );
    }
    if stats.phase("mark") > Duration::from_secs(1) {
        tracing::warn!("marking took longer than a second");
    }
}

fn register_classes(gc: &GcContext) -> Result<ClassId> {
    let node = gc.register_class(
        ClassDescriptor::new("Node")
            .field("links", FieldKind::ReferenceArray(ReferenceKind::Strong))
            .field("observer", FieldKind::weak())
            .field("payload", FieldKind::Value),
    )?;
    Ok(node)
}

struct Population {
    roots: usize,
}

/// Deterministic graph: random strong links and weak observers between
/// `args.objects` nodes, plus chained clusters that some nodes point at.
fn populate(gc: &GcContext, class: ClassId, args: &GraphArgs) -> Result<Population> {
    let mut rng = SplitMix64::new(args.seed);
    let handles = (0..args.objects)
        .map(|index| gc.create_object(class, format!("node{index}")))
        .collect::<Result<Vec<ObjectHandle>, _>>()?;

    if !handles.is_empty() {
        for &handle in &handles {
            for _ in 0..args.fan_out {
                let target = handles[rng.below(handles.len())];
                gc.push_reference(handle, LINKS, Some(target))?;
            }
            if rng.below(4) == 0 {
                let observed = handles[rng.below(handles.len())];
                gc.set_reference(handle, OBSERVER, Some(observed))?;
            }
        }
    }

    for cluster in 0..args.clusters {
        let root = gc.create_object(class, format!("cluster{cluster}"))?;
        let mut previous = root;
        let mut members = Vec::with_capacity(args.cluster_size);
        for index in 0..args.cluster_size {
            let member = gc.create_object(class, format!("cluster{cluster}.{index}"))?;
            gc.push_reference(previous, LINKS, Some(member))?;
            members.push(member);
            previous = member;
        }
        gc.create_cluster(root, &members)?;

        if !handles.is_empty() && rng.below(2) == 0 {
            let holder = handles[rng.below(handles.len())];
            gc.push_reference(holder, LINKS, Some(root))?;
        }
    }

    let roots = args.roots.min(handles.len());
    for &root in &handles[..roots] {
        gc.add_to_root_set(root)?;
    }
    Ok(Population { roots })
}

struct SplitMix64(u64);

impl SplitMix64 {
    const fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}
