use std::{panic, process, thread, time::Instant};

use clap::Parser as ClapParser;
use gchandles::{
    DhContext, Generation, Handle, HandleError, HandleKind, HandleTableBucket, HandleTableMap,
    MapCreateInfo, ObjectRef, ScanContext, VariableStrength,
    sim::{SenseBarrier, SimulatedHeap},
};
use log::{debug, error, info, warn};

/// Stress driver: mutator threads churn handles in one bucket while a
/// simulated collector runs complete GC cycles over it.
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Mutator threads
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Handles each mutator creates per cycle
    #[arg(long, default_value_t = 10_000)]
    handles: usize,
    /// Collector heaps (tables per bucket)
    #[arg(long, default_value_t = 2)]
    heaps: usize,
    #[arg(long, default_value_t = 2)]
    max_generation: Generation,
    /// GC cycles to run
    #[arg(long, default_value_t = 8)]
    cycles: usize,
    /// Move surviving objects and run the relocation pass
    #[arg(long)]
    compact: bool,
}

const MUTATOR_KINDS: [HandleKind; 7] = [
    HandleKind::Strong,
    HandleKind::WeakShort,
    HandleKind::WeakLong,
    HandleKind::Pinned,
    HandleKind::Dependent,
    HandleKind::Variable,
    HandleKind::SizedRef,
];

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        error!("{err}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), HandleError> {
    let map = HandleTableMap::initialize(MapCreateInfo {
        heap_count: Some(cli.heaps),
        max_generation: Some(cli.max_generation),
    })?;
    let bucket = map.create_bucket(&HandleKind::default_flags())?;
    let sim = SimulatedHeap::new(cli.heaps, cli.max_generation);
    let barrier = SenseBarrier::new();
    let parties = cli.threads + 1;

    info!(
        "{} mutators x {} handles, {} heaps, {} cycles",
        cli.threads, cli.handles, cli.heaps, cli.cycles
    );
    let start = Instant::now();

    let kept: usize = thread::scope(|s| {
        let mutators: Vec<_> = (0..cli.threads)
            .map(|id| {
                let (sim, barrier) = (&sim, &barrier);
                s.spawn(move || mutate(id, cli, bucket, sim, barrier, parties))
            })
            .collect();

        for cycle in 0..cli.cycles {
            // mutators done with this round
            barrier.wait(parties);
            let condemned = (cycle % (cli.max_generation as usize + 1)) as Generation;
            collect(&map, &sim, condemned, cli);
            barrier.wait(parties);
        }

        mutators.into_iter().map(join).sum()
    });

    let snapshot = map.stats().snapshot();
    info!(
        "done in {:?}: {} handles kept, {} live in bucket, {} objects left",
        start.elapsed(),
        kept,
        bucket.count_handles(),
        sim.object_count()
    );
    info!(
        "scanned {} handles, skipped {} blocks and {} clumps, cycles per generation {:?}",
        snapshot.handles_visited, snapshot.blocks_skipped, snapshot.clumps_skipped, snapshot.cycles
    );
    map.shutdown();
    Ok(())
}

fn mutate(
    id: usize,
    cli: &Cli,
    bucket: &HandleTableBucket,
    sim: &SimulatedHeap,
    barrier: &SenseBarrier,
    parties: usize,
) -> usize {
    let table = bucket.default_table();
    let mut live: Vec<(HandleKind, Handle)> = Vec::new();
    debug!("mutator {id} allocates from table {}", table.index());

    for _ in 0..cli.cycles {
        for i in 0..cli.handles {
            let kind = MUTATOR_KINDS[(i + id) % MUTATOR_KINDS.len()];
            let extra = match kind {
                HandleKind::Dependent => sim.allocate(16).addr(),
                HandleKind::Variable if i % 2 == 0 => VariableStrength::Strong.bits(),
                HandleKind::Variable => VariableStrength::WeakLong.bits(),
                _ => 0,
            };
            match table.create_handle(kind, ObjectRef::NULL, extra) {
                Ok(handle) => {
                    handle.assign(sim.allocate(16 + (i % 8) * 8), sim);
                    live.push((kind, handle));
                }
                Err(err) => {
                    warn!("mutator {id}: {err}");
                    break;
                }
            }
        }

        // drop the older half
        let retire = live.len() / 2;
        for (kind, handle) in live.drain(..retire) {
            table.destroy_handle(kind, handle);
        }

        barrier.wait(parties);
        // collector runs
        barrier.wait(parties);
    }

    let kept = live.len();
    for (kind, handle) in live {
        table.destroy_handle(kind, handle);
    }
    kept
}

/// One stop-the-world GC cycle. Every phase runs one worker per heap and
/// joins before the next phase starts.
fn collect(map: &HandleTableMap, sim: &SimulatedHeap, condemned: Generation, cli: &Cli) {
    let heaps = cli.heaps;
    sim.begin_collection(condemned);

    per_heap(heaps, |sc| {
        let mut promote = sim.promoter();
        map.trace_pinning_roots(condemned, &sc, sim, &mut promote);
        map.trace_normal_roots(condemned, &sc, sim, sim, &mut promote);
    });

    // dependent handles can cross heaps: repeat until no heap promotes
    let mut rounds = 0;
    loop {
        rounds += 1;
        let promoted = per_heap_any(heaps, |sc| {
            let mut promote = sim.promoter();
            let mut ctx = DhContext::new(condemned, sc, &mut promote);
            map.scan_dependent_handles_for_promotion(&mut ctx, sim)
        });
        if !promoted {
            break;
        }
    }

    per_heap(heaps, |sc| {
        map.clear_short_weak(condemned, &sc, sim);
        map.clear_dependent_handles(condemned, &sc, sim);
        map.clear_long_weak(condemned, &sc, sim);
    });

    let result = sim.finish_collection(cli.compact);
    per_heap(heaps, |sc| {
        if cli.compact {
            let relocate_sc = ScanContext {
                promotion: false,
                ..sc
            };
            let mut relocate = sim.relocator();
            map.update_pointers(condemned, &relocate_sc, &mut relocate);
        }
        map.age_handles(condemned, &sc);
        if cfg!(debug_assertions) {
            if let Err(err) = map.verify_handles(&sc, sim) {
                warn!("heap {}: {err}", sc.heap);
            }
        }
    });

    map.notify_gc_cycle_complete(condemned);
    info!(
        "gc {condemned}: {} freed, {} survived, {} moved, {} dependent rounds",
        result.freed, result.survived, result.moved, rounds
    );
}

fn per_heap(heaps: usize, work: impl Fn(ScanContext) + Sync) {
    thread::scope(|s| {
        for heap in 0..heaps {
            let work = &work;
            s.spawn(move || work(ScanContext::for_heap(heap)));
        }
    });
}

fn per_heap_any(heaps: usize, work: impl Fn(ScanContext) -> bool + Sync) -> bool {
    thread::scope(|s| {
        let workers: Vec<_> = (0..heaps)
            .map(|heap| {
                let work = &work;
                s.spawn(move || work(ScanContext::for_heap(heap)))
            })
            .collect();
        workers
            .into_iter()
            .fold(false, |any, worker| join(worker) || any)
    })
}

/// Joins a worker, re-raising its panic here so a failed phase is never
/// mistaken for a quiet one.
fn join<T>(worker: thread::ScopedJoinHandle<'_, T>) -> T {
    worker
        .join()
        .unwrap_or_else(|payload| panic::resume_unwind(payload))
}
